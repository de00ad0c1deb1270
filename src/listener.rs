use futures_util::future::BoxFuture;

use crate::{
    action::ActionChain,
    consumer::MessageProcessor,
    error::{Error, ProcessingError},
    message::Message,
    service::Service,
};

/// Runs the configured action chain over gateway notifications.
pub struct ListenerProcessor {
    chain: ActionChain,
}

impl ListenerProcessor {
    pub fn new(chain: ActionChain) -> Self {
        Self { chain }
    }

    /// Builds the chain from the service's action registry and configured action ids.
    pub fn from_service(service: &Service) -> Self {
        let chain = ActionChain::load(service.actions(), &service.config().actions);
        if chain.is_empty() {
            tracing::warn!("No actions configured, notifications will be consumed without effect");
        }
        Self::new(chain)
    }

    pub fn chain(&self) -> &ActionChain {
        &self.chain
    }

    pub async fn run_action_chain(
        &self,
        service: &Service,
        message: &Message,
    ) -> Result<bool, Error> {
        self.chain.run(service, message).await
    }
}

impl MessageProcessor for ListenerProcessor {
    fn process_message<'a>(
        &'a self,
        service: &'a Service,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), ProcessingError>> {
        Box::pin(async move {
            if !message.validate() {
                return Err(Error::invalid_message("missing gateway or order_id").into());
            }

            if self.run_action_chain(service, message).await? {
                Ok(())
            } else {
                tracing::info!(
                    gateway = ?message.gateway(),
                    order_id = ?message.order_id(),
                    "Action chain stopped early, requeueing"
                );
                Err(ProcessingError::Requeue {})
            }
        })
    }
}
