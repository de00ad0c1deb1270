//! In-memory queues, primarily used for tests and development.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::future::BoxFuture;

use crate::error::Error;

use super::{Disposition, DurableQueue, PopCallback, QueueProvider};

#[derive(Clone)]
pub struct InMemoryQueue {
    name: Arc<str>,
    messages: Arc<Mutex<VecDeque<String>>>,
}

impl InMemoryQueue {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            messages: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn messages(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A popped message that goes back to the front of its queue unless committed.
struct Claim<'a> {
    queue: &'a InMemoryQueue,
    body: Option<String>,
}

impl Claim<'_> {
    fn commit(mut self) {
        self.body = None;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Some(body) = self.body.take() {
            tracing::debug!(queue = %self.queue.name, "Restoring uncommitted message");
            self.queue.messages().push_front(body);
        }
    }
}

impl DurableQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn push_raw(&self, body: String) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.messages().push_back(body);
            Ok(())
        })
    }

    fn pop_atomic<'a>(
        &'a self,
        callback: PopCallback<'a>,
    ) -> BoxFuture<'a, Result<Option<Disposition>, Error>> {
        Box::pin(async move {
            let Some(body) = self.messages().pop_front() else {
                return Ok(None);
            };

            let claim = Claim {
                queue: self,
                body: Some(body.clone()),
            };

            let disposition = callback(body).await?;
            if disposition.commits() {
                claim.commit();
            }

            Ok(Some(disposition))
        })
    }

    fn len(&self) -> BoxFuture<'_, Result<u64, Error>> {
        Box::pin(async move { Ok(self.messages().len() as u64) })
    }
}

/// Thread-safe registry of in-memory queues, created on first use.
#[derive(Clone, Default)]
pub struct InMemoryQueues {
    queues: Arc<papaya::HashMap<String, Arc<InMemoryQueue>>>,
}

impl InMemoryQueues {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueProvider for InMemoryQueues {
    fn queue(&self, name: &str) -> Arc<dyn DurableQueue> {
        let queues = self.queues.pin();
        let queue = queues.get_or_insert_with(name.to_owned(), || Arc::new(InMemoryQueue::new(name)));
        queue.clone()
    }
}
