//! Durable queues with an atomic pop-with-callback primitive.
//!
//! [`DurableQueue::pop_atomic`] hands the next message to a callback and only removes it
//! from the queue once the callback has returned `Ok`. If the callback fails, or its future
//! is dropped before completing, the message becomes visible to consumers again.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::{error::Error, message::Message};

pub mod memory;
pub mod sqlite;

/// What the consumer did with a popped envelope. Every outcome except `Deferred` commits the
/// removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The envelope parsed as a message and went through the processing callback.
    Processed,
    /// The processor asked for the message to be tried again later, and an unchanged copy was
    /// pushed onto the back of the queue.
    Requeued,
    /// The envelope could not be parsed and was quarantined as-is.
    Malformed,
    /// The envelope was left where it was without being processed.
    Deferred,
}

impl Disposition {
    pub fn commits(self) -> bool {
        self != Self::Deferred
    }
}

/// Callback invoked with the raw envelope body of a popped message.
pub type PopCallback<'a> =
    Box<dyn FnOnce(String) -> BoxFuture<'a, Result<Disposition, Error>> + Send + 'a>;

/// Boxes a closure as a [`PopCallback`], pinning down its signature for inference.
pub fn pop_callback<'a, F>(f: F) -> PopCallback<'a>
where
    F: FnOnce(String) -> BoxFuture<'a, Result<Disposition, Error>> + Send + 'a,
{
    Box::new(f)
}

/// A handle to exactly one named queue.
pub trait DurableQueue: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Appends a raw envelope body.
    fn push_raw(&self, body: String) -> BoxFuture<'_, Result<(), Error>>;

    /// Pops the oldest visible message and runs `callback` on it.
    ///
    /// Returns `Ok(None)` when the queue is empty. The removal is committed iff the callback
    /// returns `Ok` with a disposition that [commits](Disposition::commits); a callback error
    /// is returned unchanged and the message stays queued.
    fn pop_atomic<'a>(
        &'a self,
        callback: PopCallback<'a>,
    ) -> BoxFuture<'a, Result<Option<Disposition>, Error>>;

    /// Number of messages on the queue, claimed or not.
    fn len(&self) -> BoxFuture<'_, Result<u64, Error>>;

    fn push<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let body = message.to_json()?;
            self.push_raw(body).await
        })
    }
}

/// Resolves queue names to queue handles.
pub trait QueueProvider: Send + Sync + 'static {
    fn queue(&self, name: &str) -> Arc<dyn DurableQueue>;
}
