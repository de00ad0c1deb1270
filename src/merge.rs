//! Merging gateway notifications with the pending record stored when the payment started.
//!
//! Gateways often notify with only a subset of what is known about a payment. The rest (donor
//! details, the original amounts) was saved to the pending store at initiation time and is
//! combined with each notification here.

use std::sync::Arc;

use crate::{clock::Clock, error::Error, message::Message, pending::PendingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The payment is still in flight. The pending record is updated in place.
    Intermediate,
    /// The payment reached its final state. The pending record is consumed.
    Terminal,
}

/// Where a merged message's fields came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSource {
    /// An unresolved pending record existed and was merged with the notification.
    Pending,
    /// No pending record exists for this payment.
    NotificationOnly,
    /// The pending record was already consumed by an earlier terminal event.
    Consumed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub message: Message,
    pub source: PendingSource,
}

pub struct PendingStateMerger {
    store: Arc<dyn PendingStore>,
    clock: Arc<dyn Clock>,
}

impl PendingStateMerger {
    pub fn new(store: Arc<dyn PendingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Overlays `notification` onto the unresolved pending record for the same payment.
    ///
    /// Fields from the notification win; fields only the pending record has are kept. Nothing
    /// is written.
    pub async fn merge(&self, notification: &Message) -> Result<Merged, Error> {
        let (Some(gateway), Some(order_id)) = (notification.gateway(), notification.order_id())
        else {
            return Err(Error::invalid_message(
                "cannot merge a notification without gateway and order_id",
            ));
        };

        if let Some(mut pending) = self
            .store
            .fetch_message_by_gateway_order_id(&gateway, &order_id)
            .await?
        {
            pending.merge(notification);
            return Ok(Merged {
                message: pending,
                source: PendingSource::Pending,
            });
        }

        let source = if self.store.has_resolved(&gateway, &order_id).await? {
            PendingSource::Consumed
        } else {
            PendingSource::NotificationOnly
        };

        Ok(Merged {
            message: notification.clone(),
            source,
        })
    }

    /// Writes the outcome of a merge back to the pending store.
    ///
    /// A terminal event resolves the pending record, or leaves a resolved marker when there
    /// was none, so that a repeat of the same notification merges as
    /// [`PendingSource::Consumed`].
    pub async fn settle(&self, merged: &Merged, kind: EventKind) -> Result<(), Error> {
        match (merged.source, kind) {
            (PendingSource::Pending, EventKind::Terminal) => {
                self.store.delete_message(&merged.message).await
            }
            (PendingSource::Pending, EventKind::Intermediate) => {
                self.store.store_message(&merged.message).await.map(|_| ())
            }
            (PendingSource::NotificationOnly, EventKind::Terminal) => {
                self.store
                    .mark_resolved(&merged.message, self.clock.now())
                    .await
            }
            (PendingSource::NotificationOnly, EventKind::Intermediate)
            | (PendingSource::Consumed, _) => Ok(()),
        }
    }

    /// Merges and settles in one step.
    pub async fn merge_and_settle(
        &self,
        notification: &Message,
        kind: EventKind,
    ) -> Result<Merged, Error> {
        let merged = self.merge(notification).await?;
        self.settle(&merged, kind).await?;
        Ok(merged)
    }
}
