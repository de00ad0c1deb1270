use std::time::Duration;

use serde::Deserialize;

/// Which processor the `ipnq` binary runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConsumerKind {
    /// Run job envelopes from the jobs queue.
    #[default]
    Jobs,
    /// Run the configured action chain over gateway notifications.
    Listener,
    /// Move due damaged messages back onto their original queues.
    Requeue,
}

/// Process configuration, read from `IPNQ_*` environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    /// Seconds between a retryable failure and the next attempt.
    #[serde(default = "default_requeue_delay")]
    pub requeue_delay: u64,
    /// Seconds after `source_enqueued_time` during which retryable failures are retried.
    #[serde(default = "default_requeue_max_age")]
    pub requeue_max_age: u64,
    /// Maximum number of damaged messages moved per requeue run.
    #[serde(default = "default_requeue_batch_size")]
    pub requeue_batch_size: u32,

    /// Ordered action identifiers for the listener chain.
    #[serde(default)]
    pub actions: Vec<String>,

    /// Seconds a critical section may stay open.
    #[serde(default = "default_emergency_limit")]
    pub emergency_limit: u64,
    /// Ambient execution deadline in seconds, 0 for none.
    #[serde(default)]
    pub max_execution_time: u64,

    #[serde(default = "default_jobs_queue")]
    pub jobs_queue: String,
    #[serde(default = "default_donations_queue")]
    pub donations_queue: String,
    /// Seconds a popped message stays claimed before another consumer may see it again.
    #[serde(default = "default_queue_lease")]
    pub queue_lease: u64,

    #[serde(default)]
    pub consumer: ConsumerKind,
    pub consumer_queue: Option<String>,
    #[serde(default)]
    pub time_limit: u64,
    #[serde(default)]
    pub message_limit: u64,
    #[serde(default)]
    pub wait_for_new_messages: bool,

    #[serde(default = "default_source_name")]
    pub source_name: String,
    #[serde(default = "default_source_type")]
    pub source_type: String,
    pub source_host: Option<String>,
}

fn default_requeue_delay() -> u64 {
    20 * 60
}

fn default_requeue_max_age() -> u64 {
    24 * 60 * 60
}

fn default_requeue_batch_size() -> u32 {
    500
}

fn default_emergency_limit() -> u64 {
    60
}

fn default_jobs_queue() -> String {
    "jobs".to_owned()
}

fn default_donations_queue() -> String {
    "donations".to_owned()
}

fn default_queue_lease() -> u64 {
    5 * 60
}

fn default_source_name() -> String {
    "ipnq".to_owned()
}

fn default_source_type() -> String {
    "listener".to_owned()
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("IPNQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    pub fn emergency_limit(&self) -> Duration {
        Duration::from_secs(self.emergency_limit)
    }

    pub fn max_execution_time(&self) -> Option<Duration> {
        (self.max_execution_time > 0).then(|| Duration::from_secs(self.max_execution_time))
    }

    /// Queue the configured consumer binds to. The jobs consumer falls back to `jobs_queue`.
    pub fn consumer_queue(&self) -> Option<&str> {
        match (&self.consumer_queue, self.consumer) {
            (Some(queue), _) => Some(queue.as_str()),
            (None, ConsumerKind::Jobs) => Some(self.jobs_queue.as_str()),
            (None, _) => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            requeue_delay: default_requeue_delay(),
            requeue_max_age: default_requeue_max_age(),
            requeue_batch_size: default_requeue_batch_size(),
            actions: Vec::new(),
            emergency_limit: default_emergency_limit(),
            max_execution_time: 0,
            jobs_queue: default_jobs_queue(),
            donations_queue: default_donations_queue(),
            queue_lease: default_queue_lease(),
            consumer: ConsumerKind::default(),
            consumer_queue: None,
            time_limit: 0,
            message_limit: 0,
            wait_for_new_messages: false,
            source_name: default_source_name(),
            source_type: default_source_type(),
            source_host: None,
        }
    }
}
