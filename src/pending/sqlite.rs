use futures_util::future::BoxFuture;
use sqlx::SqlitePool;

use crate::{error::Error, message::Message};

use super::{marker_key, prepare, PendingStore, PENDING_ID};

/// Pending store backed by the `pending` table.
#[derive(Clone)]
pub struct SqlitePendingStore {
    pool: SqlitePool,
}

impl SqlitePendingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl PendingStore for SqlitePendingStore {
    fn fetch_message_by_gateway_order_id<'a>(
        &'a self,
        gateway: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Message>, Error>> {
        Box::pin(async move {
            let row: Option<(i64, String)> = sqlx::query_as(
                "
                SELECT id, message FROM pending
                WHERE gateway = $1 AND order_id = $2 AND is_resolved = 0
                ORDER BY date DESC, id DESC
                LIMIT 1
                ",
            )
            .bind(gateway)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

            let Some((id, body)) = row else {
                return Ok(None);
            };

            let mut message = Message::from_json(&body)?;
            message.insert(PENDING_ID, id);
            Ok(Some(message))
        })
    }

    fn store_message<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<i64, Error>> {
        Box::pin(async move {
            let (pending_id, body) = prepare(message)?;

            let date = body.get_i64("date");
            let json = body.to_json()?;

            let id = match pending_id {
                Some(id) => {
                    sqlx::query(
                        "
                        UPDATE pending
                        SET date = $1, gateway = $2, gateway_account = $3, gateway_txn_id = $4,
                            order_id = $5, payment_method = $6, message = $7
                        WHERE id = $8
                        ",
                    )
                    .bind(date)
                    .bind(body.gateway())
                    .bind(body.get_string("gateway_account"))
                    .bind(body.gateway_txn_id())
                    .bind(body.order_id())
                    .bind(body.get_string("payment_method"))
                    .bind(&json)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                    id
                }
                None => {
                    sqlx::query_scalar(
                        "
                        INSERT INTO pending (
                            date, gateway, gateway_account, gateway_txn_id, order_id,
                            payment_method, message
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        RETURNING id
                        ",
                    )
                    .bind(date)
                    .bind(body.gateway())
                    .bind(body.get_string("gateway_account"))
                    .bind(body.gateway_txn_id())
                    .bind(body.order_id())
                    .bind(body.get_string("payment_method"))
                    .bind(&json)
                    .fetch_one(&self.pool)
                    .await?
                }
            };

            Ok(id)
        })
    }

    fn delete_message<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let (Some(gateway), Some(order_id)) = (message.gateway(), message.order_id()) else {
                tracing::warn!("Not resolving pending message without gateway and order id");
                return Ok(());
            };

            let result = sqlx::query(
                "UPDATE pending SET is_resolved = 1 WHERE gateway = $1 AND order_id = $2 AND is_resolved = 0",
            )
            .bind(&gateway)
            .bind(&order_id)
            .execute(&self.pool)
            .await?;

            tracing::debug!(
                %gateway,
                %order_id,
                rows = result.rows_affected(),
                "Resolved pending message"
            );

            Ok(())
        })
    }

    fn mark_resolved<'a>(
        &'a self,
        message: &'a Message,
        date: i64,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let (gateway, order_id) = marker_key(message)?;
            let mut body = message.clone();
            body.remove(PENDING_ID);

            sqlx::query(
                "
                INSERT INTO pending (
                    date, gateway, gateway_account, gateway_txn_id, order_id,
                    payment_method, is_resolved, message
                )
                VALUES ($1, $2, $3, $4, $5, $6, 1, $7)
                ",
            )
            .bind(date)
            .bind(&gateway)
            .bind(body.get_string("gateway_account"))
            .bind(body.gateway_txn_id())
            .bind(&order_id)
            .bind(body.get_string("payment_method"))
            .bind(body.to_json()?)
            .execute(&self.pool)
            .await?;

            tracing::debug!(%gateway, %order_id, "Stored resolved marker");
            Ok(())
        })
    }

    fn has_resolved<'a>(
        &'a self,
        gateway: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let exists = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM pending WHERE gateway = $1 AND order_id = $2 AND is_resolved = 1)",
            )
            .bind(gateway)
            .bind(order_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(exists)
        })
    }

    fn delete_old_messages<'a>(
        &'a self,
        before: i64,
        gateway: &'a str,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM pending WHERE date < $1 AND gateway = $2")
                .bind(before)
                .bind(gateway)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn setup_store() -> SqlitePendingStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        SqlitePendingStore::new(pool)
    }

    fn pending() -> Message {
        Message::try_from(json!({
            "date": 1_000,
            "gateway": "adyen",
            "order_id": "12.1",
            "email": "donor@example.org",
            "gross": "10.00",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_store_fetch_and_update() {
        let store = setup_store().await;
        let id = store.store_message(&pending()).await.unwrap();

        let mut fetched = store
            .fetch_message_by_gateway_order_id("adyen", "12.1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.get_i64(PENDING_ID), Some(id));
        assert_eq!(fetched.get_string("email").as_deref(), Some("donor@example.org"));

        fetched.insert("gross", "11.00");
        assert_eq!(store.store_message(&fetched).await.unwrap(), id);

        let updated = store
            .fetch_message_by_gateway_order_id("adyen", "12.1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.get_string("gross").as_deref(), Some("11.00"));
        assert_eq!(updated.get_i64(PENDING_ID), Some(id));
    }

    #[tokio::test]
    async fn test_resolve_hides_record() {
        let store = setup_store().await;
        store.store_message(&pending()).await.unwrap();
        assert!(!store.has_resolved("adyen", "12.1").await.unwrap());

        store.delete_message(&pending()).await.unwrap();

        assert!(store
            .fetch_message_by_gateway_order_id("adyen", "12.1")
            .await
            .unwrap()
            .is_none());
        assert!(store.has_resolved("adyen", "12.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_marker_counts_as_resolved() {
        let store = setup_store().await;
        let notification =
            Message::try_from(json!({ "gateway": "adyen", "order_id": "R1" })).unwrap();

        store.mark_resolved(&notification, 1_000).await.unwrap();

        assert!(store.has_resolved("adyen", "R1").await.unwrap());
        assert!(store
            .fetch_message_by_gateway_order_id("adyen", "R1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.delete_old_messages(2_000, "adyen").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_invalid_and_cleans_old() {
        let store = setup_store().await;
        let invalid = Message::try_from(json!({ "gateway": "adyen", "order_id": "1" })).unwrap();
        assert!(store.store_message(&invalid).await.is_err());

        store.store_message(&pending()).await.unwrap();
        assert_eq!(store.delete_old_messages(500, "adyen").await.unwrap(), 0);
        assert_eq!(store.delete_old_messages(2_000, "paypal").await.unwrap(), 0);
        assert_eq!(store.delete_old_messages(2_000, "adyen").await.unwrap(), 1);
    }
}
