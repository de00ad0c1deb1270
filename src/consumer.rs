//! The dequeue/process/acknowledge loop.
//!
//! Every message is popped and processed inside one [`DurableQueue::pop_atomic`] call. A
//! message only leaves its queue once it has either been processed or durably written to the
//! damaged store; anything that fails before that point leaves it queued.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bon::bon;
use futures_util::{future::BoxFuture, FutureExt};
use tokio::time::Instant;

use crate::{
    error::{Error, ProcessingError},
    message::{Message, RAW_ENVELOPE},
    queue::{pop_callback, Disposition, DurableQueue},
    service::Service,
};

const EMPTY_QUEUE_POLL: Duration = Duration::from_secs(1);

pub trait MessageProcessor: Send + Sync {
    fn process_message<'a>(
        &'a self,
        service: &'a Service,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), ProcessingError>>;
}

pub struct QueueConsumer<P> {
    service: Service,
    queue: Arc<dyn DurableQueue>,
    processor: P,
    time_limit: u64,
    message_limit: u64,
    wait_for_new_messages: bool,
}

#[bon]
impl<P: MessageProcessor> QueueConsumer<P> {
    /// `time_limit` is in seconds and, like `message_limit`, 0 means unbounded. Waiting for
    /// new messages requires at least one of the two limits.
    #[builder]
    pub fn new(
        service: Service,
        #[builder(into)] queue_name: String,
        processor: P,
        #[builder(default)] time_limit: u64,
        #[builder(default)] message_limit: u64,
        #[builder(default)] wait_for_new_messages: bool,
    ) -> Result<Self, Error> {
        if wait_for_new_messages && time_limit == 0 && message_limit == 0 {
            return Err(Error::configuration(
                "waiting for new messages needs a time limit or a message limit",
            ));
        }

        Ok(Self {
            queue: service.queue(&queue_name),
            service,
            processor,
            time_limit,
            message_limit,
            wait_for_new_messages,
        })
    }
}

impl<P: MessageProcessor> QueueConsumer<P> {
    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Consumes messages until a limit is reached or the queue runs dry.
    ///
    /// Returns how many messages went through the processor, including those that ended up in
    /// the damaged store or were requeued. A run also ends once it pops a message it requeued
    /// itself, since everything still queued has then been tried.
    #[tracing::instrument(skip(self), fields(queue = %self.queue.name()))]
    pub async fn dequeue_messages(&self) -> Result<u64, Error> {
        let start = Instant::now();
        let time_limit = (self.time_limit > 0).then(|| Duration::from_secs(self.time_limit));
        let time_ok = || time_limit.map_or(true, |limit| start.elapsed() <= limit);
        let requeued = Mutex::new(HashSet::new());
        let mut processed = 0;

        loop {
            if !time_ok() {
                tracing::debug!(processed, "Time limit reached");
                break;
            }
            if self.message_limit > 0 && processed >= self.message_limit {
                tracing::debug!(processed, "Message limit reached");
                break;
            }

            let requeued = &requeued;
            let popped = self
                .queue
                .pop_atomic(pop_callback(move |body: String| {
                    self.process_envelope(body, requeued).boxed()
                }))
                .await?;

            match popped {
                Some(Disposition::Processed | Disposition::Requeued) => processed += 1,
                Some(Disposition::Malformed) => {}
                Some(Disposition::Deferred) => {
                    tracing::debug!(processed, "Only requeued messages left");
                    break;
                }
                None if self.wait_for_new_messages && time_ok() => {
                    tokio::time::sleep(EMPTY_QUEUE_POLL).await;
                }
                None => {
                    tracing::debug!(processed, "Queue is empty");
                    break;
                }
            }
        }

        tracing::info!(processed, "Finished consuming");
        Ok(processed)
    }

    async fn process_envelope(
        &self,
        body: String,
        requeued: &Mutex<HashSet<String>>,
    ) -> Result<Disposition, Error> {
        let mut message = match Message::from_json(&body) {
            Ok(message) => message,
            Err(e) => {
                self.store_malformed(body, e).await?;
                return Ok(Disposition::Malformed);
            }
        };

        if lock(requeued).contains(&body) {
            return Ok(Disposition::Deferred);
        }

        let disposition = self.process_message_with_error_handling(&mut message).await?;
        if disposition == Disposition::Requeued {
            lock(requeued).insert(message.to_json()?);
        }
        Ok(disposition)
    }

    async fn store_malformed(&self, body: String, error: serde_json::Error) -> Result<(), Error> {
        tracing::error!(queue = %self.queue.name(), "Quarantining malformed envelope: {error}");

        let mut quarantined = Message::new();
        quarantined.insert(RAW_ENVELOPE, body);

        self.service
            .damaged()
            .store_message(
                &quarantined,
                self.queue.name(),
                &error.to_string(),
                &format!("{error:?}"),
                None,
            )
            .await?;
        Ok(())
    }

    /// Runs the processor on `message`, routing any failure through [`Self::handle_error`].
    ///
    /// Returns [`Disposition::Requeued`] if the processor asked for the message to be tried
    /// again, and [`Disposition::Processed`] otherwise.
    pub async fn process_message_with_error_handling(
        &self,
        message: &mut Message,
    ) -> Result<Disposition, Error> {
        match self.processor.process_message(&self.service, message).await {
            Ok(()) => Ok(Disposition::Processed),
            Err(ProcessingError::Requeue {}) => {
                self.requeue(message).await?;
                Ok(Disposition::Requeued)
            }
            Err(e) => {
                self.handle_error(message, e).await?;
                Ok(Disposition::Processed)
            }
        }
    }

    async fn requeue(&self, message: &Message) -> Result<(), Error> {
        self.queue.push(message).await?;
        tracing::info!(
            gateway = ?message.gateway(),
            order_id = ?message.order_id(),
            "Requeued message unchanged"
        );
        Ok(())
    }

    /// Sends a failed message to the damaged store.
    ///
    /// Retryable failures get a retry date while the message is younger than
    /// `requeue_max_age`. Aborts are returned instead of stored, which leaves the message on
    /// the queue. A requeue request pushes the message back untouched.
    pub async fn handle_error(
        &self,
        message: &mut Message,
        error: ProcessingError,
    ) -> Result<(), Error> {
        match error {
            ProcessingError::Abort { source } => {
                tracing::error!(queue = %self.queue.name(), "Aborting consumer: {source}");
                return Err(source);
            }
            ProcessingError::Requeue {} => return self.requeue(message).await,
            ProcessingError::Retryable { .. } | ProcessingError::Fatal { .. } => {}
        }

        let config = self.service.config();
        let now = self.service.damaged().now();

        let retry_date = if error.is_retryable() {
            match message.ensure_source_enqueued_time(now) {
                Some(enqueued) if now < enqueued + config.requeue_max_age as i64 => {
                    let retry_date = now + config.requeue_delay as i64;
                    tracing::info!(
                        gateway = ?message.gateway(),
                        order_id = ?message.order_id(),
                        retry_date,
                        "Message will be retried: {error}"
                    );
                    Some(retry_date)
                }
                enqueued => {
                    tracing::error!(
                        gateway = ?message.gateway(),
                        order_id = ?message.order_id(),
                        ?enqueued,
                        "Message is too old to retry: {error}"
                    );
                    None
                }
            }
        } else {
            tracing::error!(
                gateway = ?message.gateway(),
                order_id = ?message.order_id(),
                "Message failed: {error}"
            );
            None
        };

        let id = self
            .service
            .damaged()
            .store_message_at(
                message,
                self.queue.name(),
                &error.to_string(),
                &error.trace(),
                retry_date,
                now,
            )
            .await?;

        tracing::debug!(damaged_id = id, "Stored damaged message");
        Ok(())
    }
}

fn lock(requeued: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    requeued.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    use serde_json::json;

    use crate::{
        clock::{Clock, ManualClock},
        config::Config,
        message::SOURCE_ENQUEUED_TIME,
    };

    use super::*;

    const NOW: i64 = 1_700_000_000;

    /// Returns a fixed outcome and records every message it sees.
    struct Scripted {
        outcome: fn() -> Result<(), ProcessingError>,
        calls: AtomicUsize,
        seen: Mutex<Vec<Message>>,
    }

    impl Scripted {
        fn new(outcome: fn() -> Result<(), ProcessingError>) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl MessageProcessor for Scripted {
        fn process_message<'a>(
            &'a self,
            _service: &'a Service,
            message: &'a Message,
        ) -> BoxFuture<'a, Result<(), ProcessingError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.seen.lock().unwrap().push(message.clone());
                (self.outcome)()
            })
        }
    }

    fn service() -> (Service, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let config = Config {
            requeue_delay: 1_200,
            requeue_max_age: 86_400,
            ..Default::default()
        };
        let service = Service::in_memory()
            .config(config)
            .clock(clock.clone())
            .call();
        (service, clock)
    }

    fn consumer(service: &Service, processor: Scripted) -> QueueConsumer<Scripted> {
        QueueConsumer::builder()
            .service(service.clone())
            .queue_name("test")
            .processor(processor)
            .build()
            .unwrap()
    }

    async fn push(service: &Service, value: serde_json::Value) {
        let message = Message::try_from(value).unwrap();
        service.queue("test").push(&message).await.unwrap();
    }

    #[test]
    fn test_waiting_requires_a_limit() {
        let (service, _) = service();

        let result = QueueConsumer::builder()
            .service(service)
            .queue_name("test")
            .processor(Scripted::new(|| Ok(())))
            .wait_for_new_messages(true)
            .build();

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_processes_until_empty() {
        let (service, _) = service();
        for order_id in ["1", "2", "3"] {
            push(&service, json!({ "gateway": "adyen", "order_id": order_id })).await;
        }
        let consumer = consumer(&service, Scripted::new(|| Ok(())));

        assert_eq!(consumer.dequeue_messages().await.unwrap(), 3);
        assert_eq!(service.queue("test").len().await.unwrap(), 0);

        let seen = consumer.processor().seen.lock().unwrap();
        let order_ids: Vec<_> = seen.iter().filter_map(Message::order_id).collect();
        assert_eq!(order_ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_message_limit() {
        let (service, _) = service();
        for order_id in ["1", "2", "3"] {
            push(&service, json!({ "gateway": "adyen", "order_id": order_id })).await;
        }
        let consumer = QueueConsumer::builder()
            .service(service.clone())
            .queue_name("test")
            .processor(Scripted::new(|| Ok(())))
            .message_limit(2)
            .build()
            .unwrap();

        assert_eq!(consumer.dequeue_messages().await.unwrap(), 2);
        assert_eq!(service.queue("test").len().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_messages_until_time_limit() {
        let (service, _) = service();
        let consumer = QueueConsumer::builder()
            .service(service.clone())
            .queue_name("test")
            .processor(Scripted::new(|| Ok(())))
            .time_limit(5)
            .wait_for_new_messages(true)
            .build()
            .unwrap();

        let producer = {
            let service = service.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(2_500)).await;
                push(&service, json!({ "gateway": "adyen", "order_id": "late" })).await;
            }
        };

        let start = Instant::now();
        let (processed, ()) = tokio::join!(consumer.dequeue_messages(), producer);

        assert_eq!(processed.unwrap(), 1);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retryable_failure_is_stored_with_retry_date() {
        let (service, _) = service();
        push(&service, json!({ "gateway": "adyen", "order_id": "7" })).await;
        let consumer = consumer(
            &service,
            Scripted::new(|| Err(ProcessingError::retryable("gateway busy"))),
        );

        assert_eq!(consumer.dequeue_messages().await.unwrap(), 1);
        assert_eq!(service.queue("test").len().await.unwrap(), 0);

        let record = service
            .damaged()
            .fetch_message_by_gateway_order_id("adyen", "7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.retry_date, Some(NOW + 1_200));
        assert_eq!(record.original_queue, "test");
        assert_eq!(record.message.source_enqueued_time(), Some(NOW));
        assert!(record.trace.contains("gateway busy"));
    }

    #[tokio::test]
    async fn test_expired_retryable_failure_is_not_retried() {
        let (service, _) = service();
        push(
            &service,
            json!({
                "gateway": "adyen",
                "order_id": "8",
                "source_enqueued_time": NOW - 86_400,
            }),
        )
        .await;
        let consumer = consumer(
            &service,
            Scripted::new(|| Err(ProcessingError::retryable("gateway busy"))),
        );

        consumer.dequeue_messages().await.unwrap();

        let record = service
            .damaged()
            .fetch_message_by_gateway_order_id("adyen", "8")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.retry_date, None);
        assert_eq!(record.message.source_enqueued_time(), Some(NOW - 86_400));
    }

    #[tokio::test]
    async fn test_fatal_failure_is_stored_without_retry() {
        let (service, _) = service();
        push(&service, json!({ "gateway": "adyen", "order_id": "9" })).await;
        let consumer = consumer(
            &service,
            Scripted::new(|| Err(ProcessingError::fatal("bad amount"))),
        );

        assert_eq!(consumer.dequeue_messages().await.unwrap(), 1);

        let record = service
            .damaged()
            .fetch_message_by_gateway_order_id("adyen", "9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.retry_date, None);
        assert_eq!(record.error, "bad amount");
    }

    #[tokio::test]
    async fn test_abort_leaves_message_queued() {
        let (service, _) = service();
        push(&service, json!({ "gateway": "adyen", "order_id": "10" })).await;
        let consumer = consumer(
            &service,
            Scripted::new(|| Err(Error::configuration("no such action").into())),
        );

        let result = consumer.dequeue_messages().await;

        assert!(matches!(result, Err(Error::Configuration { .. })));
        assert_eq!(service.queue("test").len().await.unwrap(), 1);
        assert!(service
            .damaged()
            .fetch_message_by_gateway_order_id("adyen", "10")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_quarantined() {
        let (service, _) = service();
        service
            .queue("test")
            .push_raw("{not json".to_owned())
            .await
            .unwrap();
        push(&service, json!({ "gateway": "adyen", "order_id": "11" })).await;
        let consumer = consumer(&service, Scripted::new(|| Ok(())));

        assert_eq!(consumer.dequeue_messages().await.unwrap(), 1);
        assert_eq!(consumer.processor().calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.queue("test").len().await.unwrap(), 0);

        let due = service
            .damaged()
            .fetch_retry_messages(10, i64::MAX)
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_waiting_once_time_is_up() {
        let (service, _) = service();
        let consumer = QueueConsumer::builder()
            .service(service)
            .queue_name("test")
            .processor(Scripted::new(|| Ok(())))
            .time_limit(3)
            .wait_for_new_messages(true)
            .build()
            .unwrap();

        let start = Instant::now();
        assert_eq!(consumer.dequeue_messages().await.unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_requeue_pushes_message_back_unchanged() {
        let (service, _) = service();
        push(&service, json!({ "gateway": "adyen", "order_id": "12" })).await;
        push(&service, json!({ "gateway": "adyen", "order_id": "13" })).await;
        let consumer = consumer(&service, Scripted::new(|| Err(ProcessingError::Requeue {})));

        // Each message is tried once; the run ends when the first one comes back around.
        assert_eq!(consumer.dequeue_messages().await.unwrap(), 2);
        assert_eq!(consumer.processor().calls.load(Ordering::SeqCst), 2);
        assert_eq!(service.queue("test").len().await.unwrap(), 2);

        let damaged = service
            .damaged()
            .fetch_message_by_gateway_order_id("adyen", "12")
            .await
            .unwrap();
        assert!(damaged.is_none());

        let retried = Scripted::new(|| Ok(()));
        let consumer = self::consumer(&service, retried);
        assert_eq!(consumer.dequeue_messages().await.unwrap(), 2);

        let seen = consumer.processor().seen.lock().unwrap();
        assert_eq!(
            seen[0],
            Message::try_from(json!({ "gateway": "adyen", "order_id": "12" })).unwrap()
        );
        assert!(!seen[0].contains_key(SOURCE_ENQUEUED_TIME));
    }

    #[tokio::test]
    async fn test_fractional_enqueued_time_is_kept() {
        let (service, _) = service();
        push(
            &service,
            json!({
                "gateway": "adyen",
                "order_id": "14",
                "source_enqueued_time": 1_600_000_000.0,
            }),
        )
        .await;
        let consumer = consumer(
            &service,
            Scripted::new(|| Err(ProcessingError::retryable("gateway busy"))),
        );

        consumer.dequeue_messages().await.unwrap();

        let record = service
            .damaged()
            .fetch_message_by_gateway_order_id("adyen", "14")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.retry_date, None);
        assert_eq!(
            record.message.get(SOURCE_ENQUEUED_TIME),
            Some(&json!(1_600_000_000.0))
        );
    }

    #[tokio::test]
    async fn test_unreadable_enqueued_time_is_not_retried() {
        let (service, _) = service();
        push(
            &service,
            json!({
                "gateway": "adyen",
                "order_id": "15",
                "source_enqueued_time": "last tuesday",
            }),
        )
        .await;
        let consumer = consumer(
            &service,
            Scripted::new(|| Err(ProcessingError::retryable("gateway busy"))),
        );

        consumer.dequeue_messages().await.unwrap();

        let record = service
            .damaged()
            .fetch_message_by_gateway_order_id("adyen", "15")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.retry_date, None);
        assert_eq!(
            record.message.get_string(SOURCE_ENQUEUED_TIME).as_deref(),
            Some("last tuesday")
        );
    }

    /// Moves forward one second every time it is read.
    struct TickingClock(AtomicI64);

    impl Clock for TickingClock {
        fn now(&self) -> i64 {
            self.0.fetch_add(1, Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_zero_delay_retry_survives_clock_tick() {
        let service = Service::in_memory()
            .config(Config {
                requeue_delay: 0,
                ..Default::default()
            })
            .clock(Arc::new(TickingClock(AtomicI64::new(NOW))))
            .call();
        push(&service, json!({ "gateway": "adyen", "order_id": "16" })).await;
        let consumer = consumer(
            &service,
            Scripted::new(|| Err(ProcessingError::retryable("gateway busy"))),
        );

        assert_eq!(consumer.dequeue_messages().await.unwrap(), 1);

        let record = service
            .damaged()
            .fetch_message_by_gateway_order_id("adyen", "16")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.retry_date, Some(record.damaged_date));
    }
}
