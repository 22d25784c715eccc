//! Job handlers.
//!
//! A [`Handler`] processes one claimed job. Its result decides the row's
//! next state: `Ok` completes the job, [`Error::Fatal`] fails it outright,
//! and every other error records a failed attempt that's retried until the
//! store's retry budget runs out.

use std::future::Future;

use crate::{job::Job, monitor, notify, search, store};

/// A type alias for handler results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Handler errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned from work queue operations.
    #[error(transparent)]
    Store(#[from] store::Error),

    /// Error returned from monitor store operations.
    #[error(transparent)]
    Monitor(#[from] monitor::Error),

    /// Error returned by the search backend.
    #[error(transparent)]
    Search(#[from] search::Error),

    /// Error returned by the `jiff` crate while computing schedules.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),

    /// A notification couldn't be delivered.
    #[error("{channel}: {source}")]
    Delivery {
        /// Channel name, e.g. `SlackWebhook`.
        channel: &'static str,

        /// Underlying delivery error.
        #[source]
        source: notify::Error,
    },

    /// The job can never succeed; it's failed without further retries.
    #[error("{0}")]
    Fatal(String),

    /// A retriable error that doesn't fit any other variant.
    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// Returns `true` when the job shouldn't be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Processes claimed jobs of kind `J`.
pub trait Handler<J: Job>: Send + Sync + 'static {
    /// Handles a single claimed job.
    fn handle(&self, job: J) -> impl Future<Output = Result> + Send;
}
