//! Built-in payment actions.

use futures_util::future::BoxFuture;

use crate::{
    action::Action,
    error::Error,
    job::JobEnvelope,
    merge::{EventKind, PendingSource},
    message::Message,
    pending::PENDING_ID,
    service::Service,
};

pub const UPDATE_PENDING: &str = "update-pending";
pub const RECORD_PAYMENT: &str = "record-payment";
pub const ENQUEUE_RECORD_JOB: &str = "enqueue-record-job";

/// Records a completed payment: pushes the merged message onto the donations queue and
/// consumes its pending record.
///
/// Both writes happen inside one critical section so the ambient deadline cannot split them.
/// A redelivered notification records nothing, whether or not it ever had a pending record.
pub async fn record_payment(service: &Service, message: &Message) -> Result<bool, Error> {
    let merger = service.merger();
    let merged = merger.merge(message).await?;

    if merged.source == PendingSource::Consumed {
        tracing::info!(
            gateway = ?message.gateway(),
            order_id = ?message.order_id(),
            "Payment already recorded, skipping"
        );
        return Ok(true);
    }

    let sections = service.critical_sections();
    let scope = sections.scoped_enter(RECORD_PAYMENT);

    let mut donation = merged.message.clone();
    donation.remove(PENDING_ID);
    service
        .push(&service.config().donations_queue, &donation)
        .await?;
    merger.settle(&merged, EventKind::Terminal).await?;

    scope.exit()?;

    tracing::info!(
        gateway = ?donation.gateway(),
        order_id = ?donation.order_id(),
        "Recorded payment"
    );

    Ok(true)
}

/// Merges an intermediate notification into the pending record.
pub struct UpdatePending;

impl Action for UpdatePending {
    fn execute<'a>(
        &'a self,
        service: &'a Service,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let merged = service
                .merger()
                .merge_and_settle(message, EventKind::Intermediate)
                .await?;

            if merged.source != PendingSource::Pending {
                tracing::debug!(
                    gateway = ?message.gateway(),
                    order_id = ?message.order_id(),
                    "No pending record to update"
                );
            }
            Ok(true)
        })
    }
}

pub struct RecordPayment;

impl Action for RecordPayment {
    fn execute<'a>(
        &'a self,
        service: &'a Service,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(record_payment(service, message))
    }
}

/// Defers recording to the jobs consumer.
pub struct EnqueueRecordJob;

impl Action for EnqueueRecordJob {
    fn execute<'a>(
        &'a self,
        service: &'a Service,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let envelope = JobEnvelope::new(RECORD_PAYMENT, message.clone());
            service
                .push(&service.config().jobs_queue, &envelope.to_message()?)
                .await?;
            Ok(true)
        })
    }
}
