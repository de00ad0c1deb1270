//! SQLite-backed damaged store.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use sqlx::SqlitePool;

use crate::{clock::Clock, error::Error, message::Message};

use super::{check_retry_date, DamagedRecord, DamagedStore};

#[derive(Clone)]
pub struct SqliteDamagedStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

#[derive(sqlx::FromRow)]
struct DamagedRow {
    id: i64,
    original_queue: String,
    original_date: i64,
    damaged_date: i64,
    retry_date: Option<i64>,
    error: String,
    trace: String,
    message: String,
}

impl TryFrom<DamagedRow> for DamagedRecord {
    type Error = Error;

    fn try_from(row: DamagedRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            original_queue: row.original_queue,
            original_date: row.original_date,
            damaged_date: row.damaged_date,
            retry_date: row.retry_date,
            error: row.error,
            trace: row.trace,
            message: Message::from_json(&row.message)?,
        })
    }
}

const SELECT_DAMAGED: &str = "
    SELECT id, original_queue, original_date, damaged_date, retry_date, error, trace, message
    FROM damaged
";

impl SqliteDamagedStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

impl DamagedStore for SqliteDamagedStore {
    fn now(&self) -> i64 {
        self.clock.now()
    }

    fn store_message_at<'a>(
        &'a self,
        message: &'a Message,
        original_queue: &'a str,
        error: &'a str,
        trace: &'a str,
        retry_date: Option<i64>,
        now: i64,
    ) -> BoxFuture<'a, Result<i64, Error>> {
        Box::pin(async move {
            check_retry_date(retry_date, now)?;

            let id = sqlx::query_scalar(
                "
                INSERT INTO damaged (
                    original_date, damaged_date, retry_date, original_queue,
                    gateway, gateway_txn_id, order_id, error, trace, message
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING id
                ",
            )
            .bind(message.original_date().unwrap_or(now))
            .bind(now)
            .bind(retry_date)
            .bind(original_queue)
            .bind(message.gateway())
            .bind(message.gateway_txn_id())
            .bind(message.order_id())
            .bind(error)
            .bind(trace)
            .bind(message.to_json()?)
            .fetch_one(&self.pool)
            .await?;

            Ok(id)
        })
    }

    fn fetch_message_by_gateway_order_id<'a>(
        &'a self,
        gateway: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<DamagedRecord>, Error>> {
        Box::pin(async move {
            let row: Option<DamagedRow> = sqlx::query_as(&format!(
                "{SELECT_DAMAGED} WHERE gateway = $1 AND order_id = $2 ORDER BY id LIMIT 1"
            ))
            .bind(gateway)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

            row.map(DamagedRecord::try_from).transpose()
        })
    }

    fn fetch_retry_messages(
        &self,
        limit: u32,
        before: i64,
    ) -> BoxFuture<'_, Result<Vec<DamagedRecord>, Error>> {
        Box::pin(async move {
            let rows: Vec<DamagedRow> = sqlx::query_as(&format!(
                "{SELECT_DAMAGED} WHERE retry_date <= $1 ORDER BY retry_date, id LIMIT $2"
            ))
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter().map(DamagedRecord::try_from).collect()
        })
    }

    fn delete_message(&self, id: i64) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM damaged WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn delete_old_messages<'a>(
        &'a self,
        before: i64,
        original_queue: &'a str,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            let result =
                sqlx::query("DELETE FROM damaged WHERE original_date < $1 AND original_queue = $2")
                    .bind(before)
                    .bind(original_queue)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        })
    }
}
