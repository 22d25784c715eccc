//! Worker pools process claimed jobs.
//!
//! A [`Worker`] runs a fixed number of handler loops against one
//! [`WorkQueueStore`]. Each loop repeatedly claims the oldest eligible job,
//! hands it to the pool's [`Handler`], and records the outcome:
//!
//! - `Ok(())` marks the job completed,
//! - a [fatal](crate::handler::Error::Fatal) error marks it failed,
//! - any other error, including a panic inside the handler, marks it errored
//!   so it's retried after the store's backoff.
//!
//! While a handler runs, the loop refreshes the job's heartbeat so the
//! [resetter](crate::resetter) doesn't reclaim it. Handlers are bounded by a
//! maximum runtime; a handler that exceeds it is aborted and its row is left
//! in `processing`, so it's recovered by the resetter exactly like a job whose
//! process crashed.
//!
//! When no job is available a loop sleeps for the poll interval before trying
//! again.
//!
//! # Running workers
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use codemonitor::{
//!     handler::Result as HandlerResult, Config, Handler, Metrics, SystemClock, TriggerJob,
//!     MemoryStore, Worker,
//! };
//! use prometheus::Registry;
//! use tokio_util::sync::CancellationToken;
//!
//! struct LogTrigger;
//!
//! impl Handler<TriggerJob> for LogTrigger {
//!     async fn handle(&self, job: TriggerJob) -> HandlerResult {
//!         println!("Running monitor {}", job.monitor_id);
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let store: MemoryStore<TriggerJob> =
//!     MemoryStore::new(config.trigger.store.clone(), Arc::new(SystemClock));
//! let metrics = Metrics::register(&Registry::new())?;
//!
//! let worker: Worker<TriggerJob, _, _> =
//!     Worker::new(store, LogTrigger, &config.trigger, metrics)?;
//! worker.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

use std::{any::Any, marker::PhantomData, sync::Arc, time::Duration as StdDuration};

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    config::QueueConfig,
    handler::Handler,
    job::{Job, JobId},
    metrics::{Metrics, Outcome},
    store::{self, WorkQueueStore},
};

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// Worker errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned from work queue operations.
    #[error(transparent)]
    Store(#[from] store::Error),

    /// Error returned by the `jiff` crate when converting intervals.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),

    /// A handler loop couldn't be joined.
    #[error(transparent)]
    Join(#[from] JoinError),
}

/// A pool of handler loops for jobs of kind `J`.
#[derive(Debug)]
pub struct Worker<J, S, H> {
    store: Arc<S>,
    handler: Arc<H>,
    metrics: Metrics,
    handlers: usize,
    poll_interval: StdDuration,
    heartbeat_interval: StdDuration,
    max_runtime: StdDuration,
    _marker: PhantomData<fn() -> J>,
}

impl<J, S, H> Clone for Worker<J, S, H> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            handler: Arc::clone(&self.handler),
            metrics: self.metrics.clone(),
            handlers: self.handlers,
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            max_runtime: self.max_runtime,
            _marker: PhantomData,
        }
    }
}

impl<J, S, H> Worker<J, S, H>
where
    J: Job,
    S: WorkQueueStore<J>,
    H: Handler<J>,
{
    /// Creates a pool sized and timed according to `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if one of the configured spans can't be expressed as
    /// a standard duration.
    pub fn new(store: S, handler: H, config: &QueueConfig, metrics: Metrics) -> Result<Self> {
        Ok(Self {
            store: Arc::new(store),
            handler: Arc::new(handler),
            metrics,
            handlers: config.handlers,
            poll_interval: config.poll_interval.try_into()?,
            heartbeat_interval: config.heartbeat_interval.try_into()?,
            max_runtime: config.max_runtime.try_into()?,
            _marker: PhantomData,
        })
    }

    /// Returns the store the pool claims from.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs every handler loop until `token` is cancelled.
    ///
    /// Jobs already being handled when the token is cancelled are allowed to
    /// finish, bounded by the maximum runtime.
    pub async fn run(&self, token: CancellationToken) -> Result {
        let mut loops = JoinSet::new();
        for _ in 0..self.handlers {
            let worker = self.clone();
            let token = token.clone();
            loops.spawn(async move { worker.run_loop(token).await });
        }

        tracing::info!(kind = %J::KIND, handlers = self.handlers, "Worker pool started");

        while let Some(joined) = loops.join_next().await {
            joined?;
        }

        tracing::info!(kind = %J::KIND, "Worker pool stopped");

        Ok(())
    }

    async fn run_loop(&self, token: CancellationToken) {
        while !token.is_cancelled() {
            match self.process_next().await {
                // Keep draining while there's work.
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(kind = %J::KIND, %err, "Failed to process next job");
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Claims and handles the next available job.
    ///
    /// Returns `false` when there was no job to claim.
    #[instrument(
        skip(self),
        fields(job.kind = %J::KIND, job.id = tracing::field::Empty),
        err
    )]
    pub async fn process_next(&self) -> Result<bool> {
        let Some(job) = self.store.dequeue().await? else {
            return Ok(false);
        };

        let id = job.id();
        tracing::Span::current().record("job.id", id);

        let handler = Arc::clone(&self.handler);
        let mut task = tokio::spawn(async move { handler.handle(job).await });

        let deadline = tokio::time::sleep(self.max_runtime);
        tokio::pin!(deadline);

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;

        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,

                _ = &mut deadline => {
                    task.abort();
                    tracing::warn!(
                        max_runtime = ?self.max_runtime,
                        "Job exceeded its maximum runtime, leaving it for the resetter"
                    );
                    self.metrics.record_outcome(J::KIND, Outcome::TimedOut);
                    return Ok(true);
                }

                _ = heartbeat.tick() => {
                    if !self.heartbeat(id).await {
                        task.abort();
                        self.metrics.record_outcome(J::KIND, Outcome::Lost);
                        return Ok(true);
                    }
                }
            }
        };

        let (held, outcome) = match joined {
            Ok(Ok(())) => (self.store.mark_complete(id).await?, Outcome::Completed),

            Ok(Err(err)) if err.is_fatal() => {
                tracing::error!(%err, "Job failed fatally");
                (
                    self.store.mark_failed(id, &err.to_string()).await?,
                    Outcome::Failed,
                )
            }

            Ok(Err(err)) => {
                tracing::error!(%err, "Job handler returned an error");
                (
                    self.store.mark_errored(id, &err.to_string()).await?,
                    Outcome::Errored,
                )
            }

            Err(err) => {
                let message = panic_message(err);
                tracing::error!(%message, "Job handler panicked");
                (
                    self.store.mark_errored(id, &message).await?,
                    Outcome::Panicked,
                )
            }
        };

        if held {
            self.metrics.record_outcome(J::KIND, outcome);
        } else {
            tracing::warn!("Job was reset while being handled, dropping its outcome");
            self.metrics.record_outcome(J::KIND, Outcome::Lost);
        }

        Ok(true)
    }

    // Returns `false` once the claim on the job is lost.
    async fn heartbeat(&self, id: JobId) -> bool {
        match self.store.heartbeat(&[id]).await {
            Ok(held) if held.is_empty() => {
                tracing::warn!("Job was reset while being handled, aborting handler");
                false
            }
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(%err, "Failed to record heartbeat");
                true
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    let payload: Box<dyn Any + Send> = match err.try_into_panic() {
        Ok(payload) => payload,
        Err(err) => return format!("handler task failed: {err}"),
    };

    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());

    format!("handler panicked: {detail}")
}
