use std::sync::Arc;

use bon::bon;
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};

use crate::{
    action::ActionRegistry,
    clock::{Clock, SystemClock},
    config::Config,
    damaged::{memory::InMemoryDamagedStore, sqlite::SqliteDamagedStore, DamagedStore},
    error::Error,
    job::JobRegistry,
    merge::PendingStateMerger,
    message::{Message, SourceFields},
    pending::{memory::InMemoryPendingStore, sqlite::SqlitePendingStore, PendingStore},
    queue::{memory::InMemoryQueues, sqlite::SqliteQueues, DurableQueue, QueueProvider},
    timeout::{CriticalSectionProvider, EmergencyCallback, TimeoutRegistry},
};

/// Everything a processor needs to touch the outside world, passed explicitly to every call.
#[derive(Clone)]
pub struct Service {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    db: Option<SqlitePool>,
    queues: Arc<dyn QueueProvider>,
    damaged: Arc<dyn DamagedStore>,
    pending: Arc<dyn PendingStore>,
    timeouts: TimeoutRegistry,
    emergency_callback: Option<EmergencyCallback>,
    source: SourceFields,
    actions: ActionRegistry,
    jobs: JobRegistry,
}

#[bon]
impl Service {
    /// Connects to the SQLite database named by the config, or a private in-memory one when
    /// no path is set, and runs migrations.
    #[builder]
    pub async fn connect_with(
        config: Config,
        clock: Option<Arc<dyn Clock>>,
        #[builder(default)] actions: ActionRegistry,
        #[builder(default)] jobs: JobRegistry,
        emergency_callback: Option<EmergencyCallback>,
    ) -> Result<Self, Error> {
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));

        let (opts, max_connections) = if let Some(path) = config.db_path() {
            (
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true),
                10,
            )
        } else {
            // Every in-memory connection is its own database.
            (SqliteConnectOptions::new().in_memory(true), 1)
        };
        let opts = opts
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(db_path = ?config.db_path(), "Connected to database");

        Ok(Self {
            queues: Arc::new(SqliteQueues::new(
                pool.clone(),
                config.queue_lease,
                clock.clone(),
            )),
            damaged: Arc::new(SqliteDamagedStore::new(pool.clone(), clock.clone())),
            pending: Arc::new(SqlitePendingStore::new(pool.clone())),
            db: Some(pool),
            source: SourceFields::from_config(&config),
            config: Arc::new(config),
            clock,
            timeouts: TimeoutRegistry::new(),
            emergency_callback,
            actions,
            jobs,
        })
    }

    /// A service whose queues and stores live in process memory.
    #[builder]
    pub fn in_memory(
        #[builder(default)] config: Config,
        clock: Option<Arc<dyn Clock>>,
        #[builder(default)] actions: ActionRegistry,
        #[builder(default)] jobs: JobRegistry,
        emergency_callback: Option<EmergencyCallback>,
    ) -> Self {
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));

        Self {
            queues: Arc::new(InMemoryQueues::new()),
            damaged: Arc::new(InMemoryDamagedStore::new(clock.clone())),
            pending: Arc::new(InMemoryPendingStore::new()),
            db: None,
            source: SourceFields::from_config(&config),
            config: Arc::new(config),
            clock,
            timeouts: TimeoutRegistry::new(),
            emergency_callback,
            actions,
            jobs,
        }
    }
}

impl Service {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> Option<&SqlitePool> {
        self.db.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current wall-clock time in epoch seconds.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn queue(&self, name: &str) -> Arc<dyn DurableQueue> {
        self.queues.queue(name)
    }

    pub fn damaged(&self) -> &Arc<dyn DamagedStore> {
        &self.damaged
    }

    pub fn pending(&self) -> &Arc<dyn PendingStore> {
        &self.pending
    }

    pub fn merger(&self) -> PendingStateMerger {
        PendingStateMerger::new(self.pending.clone(), self.clock.clone())
    }

    pub fn timeouts(&self) -> &TimeoutRegistry {
        &self.timeouts
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn source(&self) -> &SourceFields {
        &self.source
    }

    /// A fresh critical-section stack using the configured emergency limit and callback.
    pub fn critical_sections(&self) -> CriticalSectionProvider {
        CriticalSectionProvider::builder()
            .registry(self.timeouts.clone())
            .emergency_limit(self.config.emergency_limit())
            .maybe_emergency_callback(self.emergency_callback.clone())
            .build()
    }

    /// Stamps missing source fields onto a copy of `message` and pushes it onto `queue`.
    pub async fn push(&self, queue: &str, message: &Message) -> Result<(), Error> {
        let mut message = message.clone();
        self.source.add_to_message(&mut message, self.now());

        self.queue(queue).push(&message).await?;

        tracing::debug!(
            queue,
            gateway = ?message.gateway(),
            order_id = ?message.order_id(),
            "Pushed message"
        );

        Ok(())
    }
}
