use config::{Config, ConsumerKind};
use consumer::QueueConsumer;
use error::Error;
use job::JobProcessor;
use listener::ListenerProcessor;
use service::Service;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod action;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod damaged;
pub mod error;
pub mod job;
pub mod listener;
pub mod merge;
pub mod message;
pub mod payment;
pub mod pending;
pub mod queue;
pub mod requeue;
pub mod service;
pub mod timeout;

/// Returns a builder for one run of the configured consumer.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("IPNQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("IPNQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let service = Service::connect_with().config(config).call().await?;

    let timeouts = service.timeouts().clone();
    timeouts.set_ambient_limit(service.config().max_execution_time());

    timeouts.supervise(consume(&service)).await?;

    Ok(())
}

/// Runs the consumer selected by the configuration to completion.
#[tracing::instrument(skip(service), fields(consumer = %service.config().consumer))]
pub async fn consume(service: &Service) -> Result<(), Error> {
    let config = service.config();

    match config.consumer {
        ConsumerKind::Jobs => {
            let consumer = queue_consumer(service, JobProcessor::new())?;
            let processed = consumer.dequeue_messages().await?;
            tracing::info!(
                processed,
                succeeded = consumer.processor().successes(),
                "Ran jobs"
            );
        }
        ConsumerKind::Listener => {
            let consumer = queue_consumer(service, ListenerProcessor::from_service(service))?;
            consumer.dequeue_messages().await?;
        }
        ConsumerKind::Requeue => {
            requeue::requeue_delayed_messages(service, config.requeue_batch_size, service.now())
                .await?;
        }
    }

    Ok(())
}

fn queue_consumer<P: consumer::MessageProcessor>(
    service: &Service,
    processor: P,
) -> Result<QueueConsumer<P>, Error> {
    let config = service.config();
    let Some(queue) = config.consumer_queue() else {
        return Err(Error::configuration(format!(
            "the {} consumer needs IPNQ_CONSUMER_QUEUE",
            config.consumer
        )));
    };

    QueueConsumer::builder()
        .service(service.clone())
        .queue_name(queue)
        .processor(processor)
        .time_limit(config.time_limit)
        .message_limit(config.message_limit)
        .wait_for_new_messages(config.wait_for_new_messages)
        .build()
}
