//! In-memory pending store, primarily used for tests and development.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use futures_util::future::BoxFuture;

use crate::{error::Error, message::Message};

use super::{marker_key, prepare, PendingStore, PENDING_ID};

#[derive(Clone)]
struct PendingRow {
    id: i64,
    date: i64,
    resolved: bool,
    message: Message,
}

impl PendingRow {
    fn matches(&self, gateway: &str, order_id: &str) -> bool {
        self.message.gateway().as_deref() == Some(gateway)
            && self.message.order_id().as_deref() == Some(order_id)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryPendingStore {
    rows: Arc<papaya::HashMap<i64, PendingRow>>,
    next_id: Arc<AtomicI64>,
}

impl InMemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingStore for InMemoryPendingStore {
    fn fetch_message_by_gateway_order_id<'a>(
        &'a self,
        gateway: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Message>, Error>> {
        Box::pin(async move {
            let rows = self.rows.pin();
            let latest = rows
                .values()
                .filter(|row| !row.resolved && row.matches(gateway, order_id))
                .max_by_key(|row| (row.date, row.id))
                .map(|row| {
                    let mut message = row.message.clone();
                    message.insert(PENDING_ID, row.id);
                    message
                });
            Ok(latest)
        })
    }

    fn store_message<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<i64, Error>> {
        Box::pin(async move {
            let (pending_id, body) = prepare(message)?;
            let id = match pending_id {
                Some(id) => id,
                None => self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            };

            self.rows.pin().insert(
                id,
                PendingRow {
                    id,
                    date: body.get_i64("date").unwrap_or_default(),
                    resolved: false,
                    message: body,
                },
            );
            Ok(id)
        })
    }

    fn delete_message<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let (Some(gateway), Some(order_id)) = (message.gateway(), message.order_id()) else {
                tracing::warn!("Not resolving pending message without gateway and order id");
                return Ok(());
            };

            let rows = self.rows.pin();
            let unresolved: Vec<PendingRow> = rows
                .values()
                .filter(|row| !row.resolved && row.matches(&gateway, &order_id))
                .cloned()
                .collect();

            for row in unresolved {
                rows.insert(
                    row.id,
                    PendingRow {
                        resolved: true,
                        ..row
                    },
                );
            }
            Ok(())
        })
    }

    fn mark_resolved<'a>(
        &'a self,
        message: &'a Message,
        date: i64,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            marker_key(message)?;

            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let mut body = message.clone();
            body.remove(PENDING_ID);
            self.rows.pin().insert(
                id,
                PendingRow {
                    id,
                    date,
                    resolved: true,
                    message: body,
                },
            );
            Ok(())
        })
    }

    fn has_resolved<'a>(
        &'a self,
        gateway: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let rows = self.rows.pin();
            let found = rows
                .values()
                .any(|row| row.resolved && row.matches(gateway, order_id));
            Ok(found)
        })
    }

    fn delete_old_messages<'a>(
        &'a self,
        before: i64,
        gateway: &'a str,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            let rows = self.rows.pin();
            let stale: Vec<i64> = rows
                .values()
                .filter(|row| {
                    row.message.gateway().as_deref() == Some(gateway) && row.date < before
                })
                .map(|row| row.id)
                .collect();

            for id in &stale {
                rows.remove(id);
            }
            Ok(stale.len() as u64)
        })
    }
}
