//! # Codemonitor
//!
//! 🔭 Durable code-monitor job queues via Postgres.
//!
//! # Overview
//!
//! A code monitor is a saved search query that's re-run on a schedule. Each
//! time it finds new results, the monitor's configured actions are notified:
//! by email, by a generic JSON webhook, or by a Slack incoming webhook.
//!
//! **Codemonitor** is the background machinery behind this. It keeps two job
//! queues in PostgreSQL and runs worker pools over them:
//!
//! - **Trigger jobs** run one monitor's query. A periodic enqueuer inserts a
//!   trigger job for every enabled monitor that's due; the trigger pool runs
//!   the query, stores its results and reschedules the monitor.
//! - **Action jobs** deliver one notification. Every trigger run that found
//!   results fans out one action job per enabled action; the action pool
//!   renders and sends it.
//!
//! Jobs are claimed with `FOR UPDATE SKIP LOCKED`, so any number of
//! processes can share the queues. Handlers heartbeat while they run, and a
//! resetter returns jobs whose heartbeat went stale to the queue, failing
//! them once they've stalled too many times. Failed deliveries are retried
//! with backoff up to a configured limit. A sweeper deletes finished jobs
//! once they're past their retention.
//!
//! # Example
//!
//! The [`Engine`] wires all of this together. An embedding service supplies
//! the search backend and the mail transport:
//!
//! ```rust,no_run
//! use codemonitor::{
//!     notify::email::{Email, Mailer},
//!     notify::Error as NotifyError,
//!     search::{self, Actor, Match, Searcher},
//!     Config, Engine, Metrics, MonitorId,
//! };
//! use prometheus::Registry;
//! use sqlx::PgPool;
//!
//! struct Search;
//!
//! impl Searcher for Search {
//!     async fn search(
//!         &self,
//!         _actor: Actor,
//!         query: &str,
//!         _monitor_id: MonitorId,
//!     ) -> Result<Vec<Match>, search::Error> {
//!         println!("Searching for {query}");
//!         Ok(Vec::new())
//!     }
//! }
//!
//! struct StdoutMailer;
//!
//! impl Mailer for StdoutMailer {
//!     async fn send(&self, email: Email) -> Result<(), NotifyError> {
//!         println!("To {:?}: {}", email.to, email.subject);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::connect(&std::env::var("DATABASE_URL")?).await?;
//!     codemonitor::MIGRATOR.run(&pool).await?;
//!
//!     let config: Config = serde_json::from_str(
//!         r#"{ "external_url": "https://sourcegraph.example.com" }"#,
//!     )?;
//!     let metrics = Metrics::register(prometheus::default_registry())?;
//!
//!     let engine = Engine::with_pool(pool, Search, StdoutMailer, config, metrics)?;
//!     engine.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Components
//!
//! Each piece can also be used on its own:
//!
//! - [`WorkQueueStore`] is the queue abstraction, with [`PgStore`] and the
//!   in-process [`MemoryStore`] implementations.
//! - [`Worker`] runs a pool of handler loops for any [`Handler`].
//! - [`TriggerRunner`](trigger::TriggerRunner) and
//!   [`ActionRunner`](action::ActionRunner) are the two handlers.
//! - [`notify`] renders and delivers notifications.
//! - [`Periodic`](periodic::Periodic) drives the enqueuer, the resetters and
//!   the sweeper.
//!
//! [`Metrics`] exposes Prometheus counters for everything above.
#![warn(clippy::all, nonstandard_style, future_incompatible, missing_docs)]

use sqlx::migrate::Migrator;

pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    config::Config,
    engine::{Engine, EngineHandle, Stores},
    handler::Handler,
    job::{ActionJob, Job, JobId, JobKind, JobState, TriggerJob},
    metrics::Metrics,
    monitor::{MemoryMonitorStore, MonitorId, MonitorStore, PgMonitorStore},
    search::Searcher,
    store::{MemoryStore, PgStore, WorkQueueStore},
    worker::Worker,
};

pub mod action;
pub mod clock;
pub mod config;
pub mod engine;
pub mod enqueuer;
pub mod handler;
pub mod job;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod periodic;
pub mod resetter;
pub mod search;
pub mod store;
pub mod sweeper;
mod timestamp;
pub mod trigger;
pub mod worker;

/// A SQLx [`Migrator`] which provides the job queue and monitor schema.
///
/// These migrations must be applied before a Postgres-backed [`Engine`] or
/// [`PgStore`] is used.
///
/// # Example
///
///```rust,no_run
/// # use tokio::runtime::Runtime;
/// use std::env;
///
/// use sqlx::PgPool;
///
/// # fn main() {
/// # let rt = Runtime::new().unwrap();
/// # rt.block_on(async {
/// let database_url = &env::var("DATABASE_URL")?;
/// let pool = PgPool::connect(database_url).await?;
///
/// codemonitor::MIGRATOR.run(&pool).await?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # });
/// # }
pub static MIGRATOR: Migrator = sqlx::migrate!();
