//! Deferred work carried on the jobs queue.
//!
//! A job envelope is a message of the form `{"class": <tag>, "payload": {...}}`. The tag is
//! resolved through a [`JobRegistry`] to a factory that builds the job from its payload.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    consumer::MessageProcessor,
    error::{Error, ProcessingError},
    message::Message,
    payment,
    service::Service,
};

pub trait Job: Send + Sync {
    /// Runs the job. `Ok(false)` means the job could not do its work and is treated as fatal.
    fn execute<'a>(&'a self, service: &'a Service) -> BoxFuture<'a, Result<bool, ProcessingError>>;
}

pub type JobFactory = Arc<dyn Fn(Message) -> Result<Box<dyn Job>, Error> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub class: String,
    pub payload: Message,
}

impl JobEnvelope {
    pub fn new(class: impl Into<String>, payload: Message) -> Self {
        Self {
            class: class.into(),
            payload,
        }
    }

    pub fn to_message(&self) -> Result<Message, Error> {
        Ok(Message::try_from(serde_json::to_value(self)?)?)
    }
}

#[derive(Clone)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        Self::empty().register(
            payment::RECORD_PAYMENT,
            Arc::new(|payload: Message| -> Result<Box<dyn Job>, Error> {
                Ok(Box::new(RecordPaymentJob { payload }))
            }),
        )
    }

    pub fn register(mut self, class: impl Into<String>, factory: JobFactory) -> Self {
        self.factories.insert(class.into(), factory);
        self
    }

    pub fn get(&self, class: &str) -> Option<&JobFactory> {
        self.factories.get(class)
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Records a payment notification that an action deferred to the jobs queue.
pub struct RecordPaymentJob {
    payload: Message,
}

impl Job for RecordPaymentJob {
    fn execute<'a>(&'a self, service: &'a Service) -> BoxFuture<'a, Result<bool, ProcessingError>> {
        Box::pin(async move {
            if !self.payload.validate() {
                return Err(ProcessingError::fatal(
                    "record-payment job payload is missing gateway or order_id",
                ));
            }
            Ok(payment::record_payment(service, &self.payload).await?)
        })
    }
}

/// Runs job envelopes popped from a queue.
#[derive(Default)]
pub struct JobProcessor {
    successes: AtomicU64,
}

impl JobProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs that ran successfully.
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    fn instantiate(service: &Service, message: &Message) -> Result<Box<dyn Job>, ProcessingError> {
        let Some(class) = message.get_string("class") else {
            return Err(ProcessingError::fatal("job envelope has no class"));
        };
        let Some(payload) = message.get("payload").and_then(|payload| payload.as_object()) else {
            return Err(ProcessingError::fatal(format!(
                "job envelope for {class} has no payload"
            )));
        };
        let Some(factory) = service.jobs().get(&class) else {
            return Err(ProcessingError::fatal(format!("unknown job class {class}")));
        };

        Ok(factory(Message::from(payload.clone()))?)
    }
}

impl MessageProcessor for JobProcessor {
    fn process_message<'a>(
        &'a self,
        service: &'a Service,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), ProcessingError>> {
        Box::pin(async move {
            let job = Self::instantiate(service, message)?;

            if !job.execute(service).await? {
                return Err(ProcessingError::fatal("job did not successfully execute"));
            }

            self.successes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Fixed(Result<bool, &'static str>);

    impl Job for Fixed {
        fn execute<'a>(
            &'a self,
            _service: &'a Service,
        ) -> BoxFuture<'a, Result<bool, ProcessingError>> {
            Box::pin(async move { self.0.map_err(ProcessingError::retryable) })
        }
    }

    fn fixed(result: Result<bool, &'static str>) -> JobFactory {
        Arc::new(move |_: Message| -> Result<Box<dyn Job>, Error> { Ok(Box::new(Fixed(result))) })
    }

    fn service() -> Service {
        let jobs = JobRegistry::empty()
            .register("ok", fixed(Ok(true)))
            .register("no", fixed(Ok(false)))
            .register("retry", fixed(Err("upstream busy")));
        Service::in_memory().jobs(jobs).call()
    }

    fn envelope(value: serde_json::Value) -> Message {
        Message::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn test_successful_job_counts() {
        let service = service();
        let processor = JobProcessor::new();

        processor
            .process_message(&service, &envelope(json!({ "class": "ok", "payload": {} })))
            .await
            .unwrap();

        assert_eq!(processor.successes(), 1);
    }

    #[tokio::test]
    async fn test_malformed_envelopes_are_fatal() {
        let service = service();
        let processor = JobProcessor::new();

        for message in [
            envelope(json!({ "payload": {} })),
            envelope(json!({ "class": "ok" })),
            envelope(json!({ "class": "missing", "payload": {} })),
            envelope(json!({ "class": "no", "payload": {} })),
        ] {
            let result = processor.process_message(&service, &message).await;
            assert!(matches!(result, Err(ProcessingError::Fatal { .. })));
        }
        assert_eq!(processor.successes(), 0);
    }

    #[tokio::test]
    async fn test_job_error_keeps_its_class() {
        let service = service();
        let processor = JobProcessor::new();

        let result = processor
            .process_message(&service, &envelope(json!({ "class": "retry", "payload": {} })))
            .await;

        assert!(matches!(result, Err(ProcessingError::Retryable { .. })));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let payload = envelope(json!({ "gateway": "adyen", "order_id": "1" }));
        let message = JobEnvelope::new("record-payment", payload).to_message().unwrap();

        assert_eq!(message.get_string("class").as_deref(), Some("record-payment"));
        assert_eq!(
            message.get("payload"),
            Some(&json!({ "gateway": "adyen", "order_id": "1" }))
        );
    }
}
