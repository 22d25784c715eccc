//! Work queue stores.
//!
//! A [`WorkQueueStore`] owns the rows of one job kind and implements every
//! state transition a row can go through. Stores are the only coordination
//! point between handlers: claiming a row is exclusive, so two concurrent
//! [`dequeue`](WorkQueueStore::dequeue) calls never hand out the same job.
//!
//! Two implementations are provided:
//!
//! - [`PgStore`] keeps rows in Postgres and claims them with `for update skip
//!   locked`; this is what production deployments use.
//! - [`MemoryStore`] keeps rows in process memory, which makes it suitable for
//!   tests and embedded use where durability isn't required.
//!
//! Both read time through a [`Clock`](crate::Clock) and apply the same
//! [`StoreOptions`].
//!
//! # Retries and resets
//!
//! A handler error routes through [`mark_errored`](WorkQueueStore::mark_errored),
//! which counts the failure and either schedules another attempt after
//! [`retry_after`](StoreOptions::retry_after) or, once
//! [`max_num_retries`](StoreOptions::max_num_retries) failures have been
//! recorded, fails the job for good.
//!
//! A handler that stops heartbeating (because its process died or it ran past
//! its deadline) leaves its row in `processing`. Such rows are returned to the
//! queue by [`reset_stalled`](WorkQueueStore::reset_stalled), at most
//! [`max_num_resets`](StoreOptions::max_num_resets) times, after which they
//! are failed as well.

use std::future::Future;

use jiff::{Span, Timestamp, ToSpan};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};
pub use self::{memory::MemoryStore, postgres::{PgJob, PgStore}};

mod memory;
mod postgres;

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// Failure message recorded on rows failed by
/// [`reset_stalled`](WorkQueueStore::reset_stalled).
pub const RESET_FAILURE_MESSAGE: &str =
    "job processor died while handling this job too many times";

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `serde_json` crate when serializing or
    /// deserializing job payloads.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Error returned by the `jiff` crate while computing deadlines.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),
}

/// Retry and reset policy shared by every store implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Number of recorded failures after which a job is failed for good.
    pub max_num_retries: i32,

    /// Backoff between an errored attempt and the next one.
    pub retry_after: Span,

    /// A processing job whose heartbeat is older than this is stalled.
    pub stalled_max_age: Span,

    /// Number of stall resets after which a job is failed instead.
    pub max_num_resets: i32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_num_retries: 3,
            retry_after: 10.seconds(),
            stalled_max_age: 60.seconds(),
            max_num_resets: 3,
        }
    }
}

/// Rows touched by a [`reset_stalled`](WorkQueueStore::reset_stalled) pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetOutcome {
    /// Stalled rows returned to `queued`.
    pub reset: Vec<JobId>,

    /// Stalled rows that ran out of resets and were failed.
    pub failed: Vec<JobId>,
}

/// Persistent queue of jobs of one kind.
pub trait WorkQueueStore<J: Job>: Send + Sync + 'static {
    /// Inserts a new `queued` row.
    ///
    /// Returns `None` when an existing row [blocks](Job::blocks) the request,
    /// in which case nothing is inserted.
    fn enqueue(&self, spec: J::Spec) -> impl Future<Output = Result<Option<JobId>>> + Send;

    /// Inserts several rows at once.
    ///
    /// Either every non-blocked row is inserted or none are. Returns the IDs
    /// of inserted rows in request order.
    fn enqueue_many(&self, specs: Vec<J::Spec>)
        -> impl Future<Output = Result<Vec<JobId>>> + Send;

    /// Claims the oldest eligible row, moving it to `processing`.
    ///
    /// A row is eligible when it's `queued`, or `errored` with retries left,
    /// and its `process_after` marker has passed. Returns `None` when no row
    /// is eligible.
    fn dequeue(&self) -> impl Future<Output = Result<Option<J>>> + Send;

    /// Refreshes the heartbeat of rows this store's worker is processing.
    ///
    /// Returns the IDs that are still held; a missing ID means the row was
    /// reset or finished elsewhere.
    fn heartbeat(&self, ids: &[JobId]) -> impl Future<Output = Result<Vec<JobId>>> + Send;

    /// Marks a processing row as completed.
    ///
    /// Returns `false` when the row isn't held by this store's worker.
    fn mark_complete(&self, id: JobId) -> impl Future<Output = Result<bool>> + Send;

    /// Records a failed attempt, scheduling a retry or failing the row once
    /// its retries are exhausted.
    ///
    /// Returns `false` when the row isn't held by this store's worker.
    fn mark_errored(&self, id: JobId, message: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Fails a processing row without further retries.
    ///
    /// Returns `false` when the row isn't held by this store's worker.
    fn mark_failed(&self, id: JobId, message: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Returns stalled rows to the queue, or fails those out of resets.
    fn reset_stalled(&self) -> impl Future<Output = Result<ResetOutcome>> + Send;

    /// Counts rows waiting to be claimed, and optionally those in flight.
    fn queued_count(&self, include_processing: bool) -> impl Future<Output = Result<u64>> + Send;

    /// Deletes finished rows whose `finished_at` is before `cutoff`.
    fn delete_finished_before(&self, cutoff: Timestamp)
        -> impl Future<Output = Result<u64>> + Send;
}
