use std::collections::HashMap;

use itertools::Itertools;

use crate::{error::Error, service::Service};

/// Moves damaged messages whose retry date is at or before `before` back onto the queues they
/// failed on, at most `limit` of them. Returns how many went to each queue.
///
/// Messages are pushed as stored, so their source fields still describe their first ingestion.
#[tracing::instrument(skip(service))]
pub async fn requeue_delayed_messages(
    service: &Service,
    limit: u32,
    before: i64,
) -> Result<HashMap<String, usize>, Error> {
    let records = service.damaged().fetch_retry_messages(limit, before).await?;

    let mut requeued = Vec::with_capacity(records.len());
    for record in records {
        service
            .queue(&record.original_queue)
            .push(&record.message)
            .await?;
        service.damaged().delete_message(record.id).await?;
        requeued.push(record.original_queue);
    }

    let counts = requeued.into_iter().counts();
    for (queue, count) in &counts {
        tracing::info!(%queue, count, "Requeued delayed messages");
    }

    Ok(counts)
}
