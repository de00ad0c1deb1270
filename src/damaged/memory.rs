//! In-memory damaged store, primarily used for tests and development.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use futures_util::future::BoxFuture;
use itertools::Itertools;

use crate::{clock::Clock, error::Error, message::Message};

use super::{check_retry_date, DamagedRecord, DamagedStore};

#[derive(Clone)]
pub struct InMemoryDamagedStore {
    records: Arc<papaya::HashMap<i64, DamagedRecord>>,
    next_id: Arc<AtomicI64>,
    clock: Arc<dyn Clock>,
}

impl InMemoryDamagedStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(papaya::HashMap::new()),
            next_id: Arc::new(AtomicI64::new(1)),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.records.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record, in insertion order.
    pub fn records(&self) -> Vec<DamagedRecord> {
        self.records
            .pin()
            .values()
            .cloned()
            .sorted_by_key(|record| record.id)
            .collect()
    }
}

impl DamagedStore for InMemoryDamagedStore {
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

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let record = DamagedRecord {
                id,
                original_queue: original_queue.to_owned(),
                original_date: message.original_date().unwrap_or(now),
                damaged_date: now,
                retry_date,
                error: error.to_owned(),
                trace: trace.to_owned(),
                message: message.clone(),
            };
            self.records.pin().insert(id, record);

            Ok(id)
        })
    }

    fn fetch_message_by_gateway_order_id<'a>(
        &'a self,
        gateway: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<DamagedRecord>, Error>> {
        Box::pin(async move {
            let records = self.records.pin();
            let found = records
                .values()
                .filter(|record| {
                    record.message.gateway().as_deref() == Some(gateway)
                        && record.message.order_id().as_deref() == Some(order_id)
                })
                .min_by_key(|record| record.id)
                .cloned();
            Ok(found)
        })
    }

    fn fetch_retry_messages(
        &self,
        limit: u32,
        before: i64,
    ) -> BoxFuture<'_, Result<Vec<DamagedRecord>, Error>> {
        Box::pin(async move {
            let records = self.records.pin();
            let due = records
                .values()
                .filter(|record| record.retry_date.is_some_and(|retry| retry <= before))
                .sorted_by_key(|record| (record.retry_date, record.id))
                .take(limit as usize)
                .cloned()
                .collect();
            Ok(due)
        })
    }

    fn delete_message(&self, id: i64) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.records.pin().remove(&id);
            Ok(())
        })
    }

    fn delete_old_messages<'a>(
        &'a self,
        before: i64,
        original_queue: &'a str,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            let records = self.records.pin();
            let stale: Vec<i64> = records
                .values()
                .filter(|record| {
                    record.original_queue == original_queue && record.original_date < before
                })
                .map(|record| record.id)
                .collect();

            for id in &stale {
                records.remove(id);
            }

            Ok(stale.len() as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::clock::ManualClock;

    use super::*;

    fn message(order_id: &str) -> Message {
        Message::try_from(json!({
            "gateway": "adyen",
            "order_id": order_id,
            "date": 500,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_retry_date_in_the_past() {
        let store = InMemoryDamagedStore::new(Arc::new(ManualClock::new(1_000)));

        let result = store
            .store_message(&message("1"), "donations", "boom", "trace", Some(999))
            .await;

        assert!(matches!(result, Err(Error::InvalidMessage { .. })));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_retry_messages_orders_by_retry_date() {
        let store = InMemoryDamagedStore::new(Arc::new(ManualClock::new(1_000)));
        store
            .store_message(&message("late"), "donations", "e", "t", Some(1_300))
            .await
            .unwrap();
        store
            .store_message(&message("early"), "donations", "e", "t", Some(1_100))
            .await
            .unwrap();
        store
            .store_message(&message("never"), "donations", "e", "t", None)
            .await
            .unwrap();
        store
            .store_message(&message("future"), "donations", "e", "t", Some(5_000))
            .await
            .unwrap();

        let due = store.fetch_retry_messages(10, 2_000).await.unwrap();
        let order_ids: Vec<_> = due.iter().filter_map(|r| r.message.order_id()).collect();
        assert_eq!(order_ids, vec!["early", "late"]);

        let limited = store.fetch_retry_messages(1, 2_000).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_old_messages_scoped_to_queue() {
        let store = InMemoryDamagedStore::new(Arc::new(ManualClock::new(1_000)));
        store
            .store_message(&message("1"), "donations", "e", "t", None)
            .await
            .unwrap();
        store
            .store_message(&message("2"), "jobs", "e", "t", None)
            .await
            .unwrap();

        assert_eq!(store.delete_old_messages(600, "donations").await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store
            .fetch_message_by_gateway_order_id("adyen", "2")
            .await
            .unwrap()
            .is_some());
    }
}
