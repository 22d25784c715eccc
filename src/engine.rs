//! Engine orchestration.
//!
//! [`Engine`] wires every component into a running system:
//!
//! - the trigger pool, running each due monitor's query,
//! - the action pool, delivering notifications,
//! - the enqueuer, inserting trigger jobs for due monitors,
//! - one resetter per job kind, reclaiming stalled jobs,
//! - and the sweeper, deleting finished jobs past their retention.
//!
//! All of them share one [`CancellationToken`]; [`EngineHandle::shutdown`]
//! cancels it and waits for every loop to stop.
//!
//! # Example
//!
//! ```rust,no_run
//! use codemonitor::{
//!     notify::email::MemoryMailer,
//!     search::{self, Actor, Match, Searcher},
//!     Config, Engine, Metrics, MonitorId,
//! };
//! use prometheus::Registry;
//! use sqlx::PgPool;
//!
//! struct NoResults;
//!
//! impl Searcher for NoResults {
//!     async fn search(
//!         &self,
//!         _actor: Actor,
//!         _query: &str,
//!         _monitor_id: MonitorId,
//!     ) -> Result<Vec<Match>, search::Error> {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PgPool::connect(&std::env::var("DATABASE_URL")?).await?;
//! codemonitor::MIGRATOR.run(&pool).await?;
//!
//! let metrics = Metrics::register(&Registry::new())?;
//! let engine = Engine::with_pool(
//!     pool,
//!     NoResults,
//!     MemoryMailer::default(),
//!     Config::default(),
//!     metrics,
//! )?;
//!
//! let handle = engine.start()?;
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    action::ActionRunner,
    clock::{Clock, SystemClock},
    config::{self, Config},
    enqueuer::Enqueuer,
    job::{ActionJob, TriggerJob},
    metrics::Metrics,
    monitor::{MemoryMonitorStore, MonitorStore, PgMonitorStore},
    notify::{self, email::Mailer},
    periodic::{self, Periodic},
    resetter::Resetter,
    search::Searcher,
    store::{MemoryStore, PgStore, WorkQueueStore},
    sweeper::Sweeper,
    trigger::TriggerRunner,
    worker::{self, Worker},
};

/// A type alias for engine results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] config::Error),

    /// The external URL couldn't be used to build links.
    #[error(transparent)]
    Notify(#[from] notify::Error),

    /// Error returned from a worker pool.
    #[error(transparent)]
    Worker(#[from] worker::Error),

    /// Error returned from a periodic routine.
    #[error(transparent)]
    Periodic(#[from] periodic::Error),

    /// Error returned from Tokio task joins.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Stores an engine runs against.
#[derive(Debug, Clone)]
pub struct Stores<M, T, A> {
    /// Monitors and their actions.
    pub monitors: M,

    /// Trigger job queue.
    pub triggers: T,

    /// Action job queue.
    pub actions: A,
}

/// Handle returned by [`Engine::start`].
#[derive(Debug)]
pub struct EngineHandle {
    tasks: JoinSet<Result>,
    shutdown_token: CancellationToken,
}

impl EngineHandle {
    /// Signals every loop to stop and waits for them to finish.
    ///
    /// In-flight jobs are allowed to complete, bounded by their maximum
    /// runtime. The first error encountered is returned once all loops have
    /// stopped.
    pub async fn shutdown(mut self) -> Result {
        self.shutdown_token.cancel();

        let mut first_err = None;
        while let Some(joined) = self.tasks.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(err) => Error::from(err),
            };
            tracing::error!(%err, "Engine task failed");
            first_err.get_or_insert(err);
        }

        first_err.map_or(Ok(()), Err)
    }
}

/// The code monitor job engine.
#[derive(Debug)]
pub struct Engine<M, T, A, S, E> {
    config: Config,
    external_url: Url,
    monitors: Arc<M>,
    triggers: T,
    actions: A,
    searcher: Arc<S>,
    mailer: Arc<E>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    client: reqwest::Client,
}

impl<S, E> Engine<PgMonitorStore, PgStore<TriggerJob>, PgStore<ActionJob>, S, E>
where
    S: Searcher,
    E: Mailer,
{
    /// Creates an engine backed by Postgres.
    ///
    /// The pool's database must have [`MIGRATOR`](crate::MIGRATOR) applied.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn with_pool(
        pool: PgPool,
        searcher: S,
        mailer: E,
        config: Config,
        metrics: Metrics,
    ) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stores = Stores {
            monitors: PgMonitorStore::new(pool.clone()),
            triggers: PgStore::new(pool.clone(), config.trigger.store.clone(), clock.clone()),
            actions: PgStore::new(pool, config.action.store.clone(), clock.clone()),
        };

        Self::new(config, stores, searcher, mailer, clock, metrics)
    }
}

impl<S, E> Engine<MemoryMonitorStore, MemoryStore<TriggerJob>, MemoryStore<ActionJob>, S, E>
where
    S: Searcher,
    E: Mailer,
{
    /// Creates an engine keeping all state in process memory.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn in_memory(
        searcher: S,
        mailer: E,
        config: Config,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Result<Self> {
        let triggers = MemoryStore::new(config.trigger.store.clone(), clock.clone());
        let stores = Stores {
            monitors: MemoryMonitorStore::new(triggers.clone()),
            triggers,
            actions: MemoryStore::new(config.action.store.clone(), clock.clone()),
        };

        Self::new(config, stores, searcher, mailer, clock, metrics)
    }
}

impl<M, T, A, S, E> Engine<M, T, A, S, E>
where
    M: MonitorStore,
    T: WorkQueueStore<TriggerJob> + Clone,
    A: WorkQueueStore<ActionJob> + Clone,
    S: Searcher,
    E: Mailer,
{
    /// Creates an engine over the given stores.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(
        config: Config,
        stores: Stores<M, T, A>,
        searcher: S,
        mailer: E,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Result<Self> {
        config.validate()?;
        let external_url = notify::external_base(&config.external_url)?;

        Ok(Self {
            config,
            external_url,
            monitors: Arc::new(stores.monitors),
            triggers: stores.triggers,
            actions: stores.actions,
            searcher: Arc::new(searcher),
            mailer: Arc::new(mailer),
            clock,
            metrics,
            client: reqwest::Client::new(),
        })
    }

    /// Returns the monitor store.
    pub fn monitors(&self) -> &M {
        &self.monitors
    }

    /// Returns the trigger job queue.
    pub fn triggers(&self) -> &T {
        &self.triggers
    }

    /// Returns the action job queue.
    pub fn actions(&self) -> &A {
        &self.actions
    }

    /// Returns the engine's counters.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Runs the engine until one of its loops fails.
    pub async fn run(&self) -> Result {
        let shutdown_token = CancellationToken::new();
        let mut tasks = self.spawn(&shutdown_token)?;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Err(err)) => {
                    shutdown_token.cancel();
                    return Err(err);
                }
                Err(err) => {
                    shutdown_token.cancel();
                    return Err(Error::from(err));
                }
                _ => continue,
            }
        }

        Ok(())
    }

    /// Starts the engine in background tasks and returns a handle.
    ///
    /// Use [`EngineHandle::shutdown`] for graceful stop.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured interval can't be used.
    pub fn start(&self) -> Result<EngineHandle> {
        let shutdown_token = CancellationToken::new();
        let tasks = self.spawn(&shutdown_token)?;

        Ok(EngineHandle {
            tasks,
            shutdown_token,
        })
    }

    fn spawn(&self, shutdown_token: &CancellationToken) -> Result<JoinSet<Result>> {
        let config = &self.config;

        let trigger_worker: Worker<TriggerJob, _, _> = Worker::new(
            self.triggers.clone(),
            TriggerRunner::new(
                self.monitors.clone(),
                self.searcher.clone(),
                Arc::new(self.actions.clone()),
                self.clock.clone(),
                config.trigger_interval,
            ),
            &config.trigger,
            self.metrics.clone(),
        )?;

        let action_worker: Worker<ActionJob, _, _> = Worker::new(
            self.actions.clone(),
            ActionRunner::new(
                self.monitors.clone(),
                self.mailer.clone(),
                self.client.clone(),
                self.external_url.clone(),
                config.notify.clone(),
            ),
            &config.action,
            self.metrics.clone(),
        )?;

        let enqueuer = Periodic::new(
            Enqueuer::new(
                self.monitors.clone(),
                Arc::new(self.triggers.clone()),
                self.clock.clone(),
            ),
            config.enqueue_interval,
        );

        let trigger_resetter = Periodic::new(
            Resetter::<TriggerJob, _>::new(Arc::new(self.triggers.clone()), self.metrics.clone()),
            config.reset_interval,
        );

        let action_resetter = Periodic::new(
            Resetter::<ActionJob, _>::new(Arc::new(self.actions.clone()), self.metrics.clone()),
            config.reset_interval,
        );

        let sweeper = Periodic::new(
            Sweeper::new(
                Arc::new(self.actions.clone()),
                Arc::new(self.triggers.clone()),
                self.clock.clone(),
                config.retention,
                self.metrics.clone(),
            ),
            config.sweep_interval,
        );

        let mut tasks = JoinSet::new();
        let token = shutdown_token.clone();
        tasks.spawn(async move { trigger_worker.run(token).await.map_err(Error::from) });
        let token = shutdown_token.clone();
        tasks.spawn(async move { action_worker.run(token).await.map_err(Error::from) });
        let token = shutdown_token.clone();
        tasks.spawn(async move { enqueuer.run(token).await.map_err(Error::from) });
        let token = shutdown_token.clone();
        tasks.spawn(async move { trigger_resetter.run(token).await.map_err(Error::from) });
        let token = shutdown_token.clone();
        tasks.spawn(async move { action_resetter.run(token).await.map_err(Error::from) });
        let token = shutdown_token.clone();
        tasks.spawn(async move { sweeper.run(token).await.map_err(Error::from) });

        tracing::info!("Engine started");

        Ok(tasks)
    }
}
