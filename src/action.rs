//! Ordered, idempotent side effects run against one inbound message.
//!
//! Actions are looked up by tag in an [`ActionRegistry`] and run in configured order by an
//! [`ActionChain`]. An action returning `false` stops the chain and asks for the message to be
//! retried later; it is not an error. Since a retried message runs the whole chain again,
//! every action must be safe to repeat.

use std::{collections::HashMap, sync::Arc};

use futures_util::future::BoxFuture;

use crate::{error::Error, message::Message, payment, service::Service};

pub trait Action: Send + Sync {
    fn execute<'a>(
        &'a self,
        service: &'a Service,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<bool, Error>>;
}

pub type ActionFactory = Arc<dyn Fn() -> Box<dyn Action> + Send + Sync>;

/// Maps action tags to factories. Built once at startup.
#[derive(Clone)]
pub struct ActionRegistry {
    factories: HashMap<String, ActionFactory>,
}

impl ActionRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// The registry with every built-in action.
    pub fn builtin() -> Self {
        Self::empty()
            .register(payment::UPDATE_PENDING, Arc::new(|| {
                Box::new(payment::UpdatePending) as Box<dyn Action>
            }))
            .register(payment::RECORD_PAYMENT, Arc::new(|| {
                Box::new(payment::RecordPayment) as Box<dyn Action>
            }))
            .register(payment::ENQUEUE_RECORD_JOB, Arc::new(|| {
                Box::new(payment::EnqueueRecordJob) as Box<dyn Action>
            }))
    }

    pub fn register(mut self, tag: impl Into<String>, factory: ActionFactory) -> Self {
        self.factories.insert(tag.into(), factory);
        self
    }

    pub fn create(&self, tag: &str) -> Option<Box<dyn Action>> {
        self.factories.get(tag).map(|factory| factory())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

pub struct ActionChain {
    actions: Vec<(String, Box<dyn Action>)>,
}

impl ActionChain {
    /// Instantiates `ids` in order. Unknown ids are configuration defects: they are logged
    /// and left out of the chain.
    pub fn load<S: AsRef<str>>(registry: &ActionRegistry, ids: &[S]) -> Self {
        let actions = ids
            .iter()
            .filter_map(|id| {
                let id = id.as_ref();
                match registry.create(id) {
                    Some(action) => Some((id.to_owned(), action)),
                    None => {
                        tracing::error!(action = id, "Unknown action in configuration, skipping");
                        None
                    }
                }
            })
            .collect();

        Self { actions }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(|(id, _)| id.as_str())
    }

    /// Runs every action in order, stopping at the first that returns `false`.
    pub async fn run(&self, service: &Service, message: &Message) -> Result<bool, Error> {
        for (id, action) in &self.actions {
            tracing::debug!(action = %id, "Running action");

            if !action.execute(service, message).await? {
                tracing::info!(
                    action = %id,
                    gateway = ?message.gateway(),
                    order_id = ?message.order_id(),
                    "Action did not complete, stopping chain"
                );
                return Ok(false);
            }
        }

        Ok(true)
    }
}
