//! Quarantine for messages that failed processing.
//!
//! A damaged record keeps the failed message together with the reason it failed. Records with
//! a `retry_date` are picked up again by the requeuer once that date has passed; records
//! without one wait for a human.

use futures_util::future::BoxFuture;

use crate::{error::Error, message::Message};

pub mod memory;
pub mod sqlite;

#[derive(Debug, Clone, PartialEq)]
pub struct DamagedRecord {
    pub id: i64,
    pub original_queue: String,
    /// When the payment event happened, falling back to when the record was written.
    pub original_date: i64,
    pub damaged_date: i64,
    pub retry_date: Option<i64>,
    pub error: String,
    pub trace: String,
    pub message: Message,
}

pub trait DamagedStore: Send + Sync + 'static {
    /// The store's current time in epoch seconds.
    fn now(&self) -> i64;

    /// Durably records `message` as failed at `damaged_date` and returns the new record's id.
    ///
    /// Fails if `retry_date` lies before `damaged_date`.
    fn store_message_at<'a>(
        &'a self,
        message: &'a Message,
        original_queue: &'a str,
        error: &'a str,
        trace: &'a str,
        retry_date: Option<i64>,
        damaged_date: i64,
    ) -> BoxFuture<'a, Result<i64, Error>>;

    /// [`store_message_at`](Self::store_message_at) the store's current time.
    fn store_message<'a>(
        &'a self,
        message: &'a Message,
        original_queue: &'a str,
        error: &'a str,
        trace: &'a str,
        retry_date: Option<i64>,
    ) -> BoxFuture<'a, Result<i64, Error>> {
        self.store_message_at(
            message,
            original_queue,
            error,
            trace,
            retry_date,
            self.now(),
        )
    }

    fn fetch_message_by_gateway_order_id<'a>(
        &'a self,
        gateway: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<DamagedRecord>, Error>>;

    /// Records whose retry date is at or before `before`, oldest retry date first.
    fn fetch_retry_messages(
        &self,
        limit: u32,
        before: i64,
    ) -> BoxFuture<'_, Result<Vec<DamagedRecord>, Error>>;

    fn delete_message(&self, id: i64) -> BoxFuture<'_, Result<(), Error>>;

    /// Drops records from `original_queue` whose original date is before `before`.
    fn delete_old_messages<'a>(
        &'a self,
        before: i64,
        original_queue: &'a str,
    ) -> BoxFuture<'a, Result<u64, Error>>;
}

fn check_retry_date(retry_date: Option<i64>, now: i64) -> Result<(), Error> {
    match retry_date {
        Some(retry_date) if retry_date < now => Err(Error::invalid_message(format!(
            "retry date {retry_date} is before the damaged date {now}"
        ))),
        _ => Ok(()),
    }
}
