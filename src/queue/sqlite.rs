//! SQLite-backed durable queues.
//!
//! A pop claims the oldest visible row by setting `claimed_until` to the end of a lease in a
//! single `UPDATE ... RETURNING` statement, so two consumers can never claim the same row. The
//! row is deleted once the callback succeeds and released when it fails. A consumer that dies
//! or is cancelled mid-callback leaves the claim in place until the lease runs out, after which
//! the message is delivered again.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use sqlx::SqlitePool;

use crate::{clock::Clock, error::Error};

use super::{Disposition, DurableQueue, PopCallback, QueueProvider};

#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    name: Arc<str>,
    lease: i64,
    clock: Arc<dyn Clock>,
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: i64,
    body: String,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, name: impl AsRef<str>, lease: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            name: Arc::from(name.as_ref()),
            lease: lease as i64,
            clock,
        }
    }

    async fn claim(&self) -> Result<Option<ClaimedRow>, Error> {
        let now = self.clock.now();

        let row = sqlx::query_as(
            "
            UPDATE queue_messages
            SET claimed_until = $1
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = $2 AND (claimed_until IS NULL OR claimed_until <= $3)
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, body
            ",
        )
        .bind(now + self.lease)
        .bind(self.name.as_ref())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn commit(&self, id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, id: i64) -> Result<(), Error> {
        sqlx::query("UPDATE queue_messages SET claimed_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl DurableQueue for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn push_raw(&self, body: String) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            sqlx::query("INSERT INTO queue_messages (queue, body, enqueued_at) VALUES ($1, $2, $3)")
                .bind(self.name.as_ref())
                .bind(body)
                .bind(self.clock.now())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn pop_atomic<'a>(
        &'a self,
        callback: PopCallback<'a>,
    ) -> BoxFuture<'a, Result<Option<Disposition>, Error>> {
        Box::pin(async move {
            let Some(ClaimedRow { id, body }) = self.claim().await? else {
                return Ok(None);
            };

            match callback(body).await {
                Ok(disposition) if disposition.commits() => {
                    self.commit(id).await?;
                    Ok(Some(disposition))
                }
                Ok(disposition) => {
                    self.release(id).await?;
                    Ok(Some(disposition))
                }
                Err(e) => {
                    if let Err(release_err) = self.release(id).await {
                        tracing::warn!(
                            queue = %self.name,
                            message_id = id,
                            "Failed to release claim, message reappears after its lease: {release_err}"
                        );
                    }
                    Err(e)
                }
            }
        })
    }

    fn len(&self) -> BoxFuture<'_, Result<u64, Error>> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = $1")
                .bind(self.name.as_ref())
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        })
    }
}

#[derive(Clone)]
pub struct SqliteQueues {
    pool: SqlitePool,
    lease: u64,
    clock: Arc<dyn Clock>,
}

impl SqliteQueues {
    pub fn new(pool: SqlitePool, lease: u64, clock: Arc<dyn Clock>) -> Self {
        Self { pool, lease, clock }
    }
}

impl QueueProvider for SqliteQueues {
    fn queue(&self, name: &str) -> Arc<dyn DurableQueue> {
        Arc::new(SqliteQueue::new(
            self.pool.clone(),
            name,
            self.lease,
            self.clock.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;
    use sqlx::sqlite::SqlitePoolOptions;

    use crate::{clock::ManualClock, queue::pop_callback};

    use super::*;

    async fn setup_queue(clock: Arc<ManualClock>) -> SqliteQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        SqliteQueue::new(pool, "test", 60, clock)
    }

    #[tokio::test]
    async fn test_pop_commits_in_order() {
        let queue = setup_queue(Arc::new(ManualClock::new(1_000))).await;
        queue.push_raw("one".to_owned()).await.unwrap();
        queue.push_raw("two".to_owned()).await.unwrap();

        let popped = queue
            .pop_atomic(pop_callback(|body| {
                async move {
                    assert_eq!(body, "one");
                    Ok(Disposition::Processed)
                }
                .boxed()
            }))
            .await
            .unwrap();

        assert_eq!(popped, Some(Disposition::Processed));
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_callback_releases_claim() {
        let queue = setup_queue(Arc::new(ManualClock::new(1_000))).await;
        queue.push_raw("one".to_owned()).await.unwrap();

        let result = queue
            .pop_atomic(pop_callback(|_| {
                async move { Err(Error::configuration("bad wiring")) }.boxed()
            }))
            .await;
        assert!(matches!(result, Err(Error::Configuration { .. })));

        let popped = queue
            .pop_atomic(pop_callback(|body| {
                async move {
                    assert_eq!(body, "one");
                    Ok(Disposition::Processed)
                }
                .boxed()
            }))
            .await
            .unwrap();
        assert_eq!(popped, Some(Disposition::Processed));
    }

    #[tokio::test]
    async fn test_deferred_releases_claim() {
        let queue = setup_queue(Arc::new(ManualClock::new(1_000))).await;
        queue.push_raw("one".to_owned()).await.unwrap();

        let popped = queue
            .pop_atomic(pop_callback(|_| async move { Ok(Disposition::Deferred) }.boxed()))
            .await
            .unwrap();
        assert_eq!(popped, Some(Disposition::Deferred));

        // Visible again straight away, without waiting out the lease.
        let popped = queue
            .pop_atomic(pop_callback(|_| async move { Ok(Disposition::Processed) }.boxed()))
            .await
            .unwrap();
        assert_eq!(popped, Some(Disposition::Processed));
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_claim_reappears_after_lease() {
        let clock = Arc::new(ManualClock::new(1_000));
        let queue = setup_queue(clock.clone()).await;
        queue.push_raw("one".to_owned()).await.unwrap();

        let pop = queue.pop_atomic(pop_callback(|_| {
            async move {
                std::future::pending::<()>().await;
                Ok(Disposition::Processed)
            }
            .boxed()
        }));
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), pop)
            .await
            .is_err());

        // Still claimed: invisible, but not lost.
        let popped = queue
            .pop_atomic(pop_callback(|_| async move { Ok(Disposition::Processed) }.boxed()))
            .await
            .unwrap();
        assert_eq!(popped, None);
        assert_eq!(queue.len().await.unwrap(), 1);

        clock.advance(61);

        let popped = queue
            .pop_atomic(pop_callback(|_| async move { Ok(Disposition::Processed) }.boxed()))
            .await
            .unwrap();
        assert_eq!(popped, Some(Disposition::Processed));
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}
