//! Returning stalled jobs to the queue.

use std::{marker::PhantomData, sync::Arc};

use tracing::{error, info, instrument, warn};

use crate::{
    job::Job,
    metrics::Metrics,
    periodic::Routine,
    store::{self, ResetOutcome, WorkQueueStore},
};

/// Resets stalled jobs of kind `J` and counts what happened.
#[derive(Debug)]
pub struct Resetter<J, S> {
    store: Arc<S>,
    metrics: Metrics,
    _marker: PhantomData<fn() -> J>,
}

impl<J, S> Resetter<J, S>
where
    J: Job,
    S: WorkQueueStore<J>,
{
    /// Creates a resetter for `store`.
    pub fn new(store: Arc<S>, metrics: Metrics) -> Self {
        Self {
            store,
            metrics,
            _marker: PhantomData,
        }
    }

    /// Runs one reset pass.
    ///
    /// # Errors
    ///
    /// Returns the store's error; it's also counted as a reset error.
    #[instrument(skip(self), fields(job.kind = %J::KIND), err)]
    pub async fn reset_once(&self) -> Result<ResetOutcome, store::Error> {
        let outcome = self.store.reset_stalled().await.inspect_err(|_| {
            self.metrics.record_reset_error(J::KIND);
        })?;

        self.metrics
            .record_resets(J::KIND, outcome.reset.len(), outcome.failed.len());
        if !outcome.reset.is_empty() {
            info!(job.ids = ?outcome.reset, "Returned stalled jobs to the queue");
        }
        if !outcome.failed.is_empty() {
            warn!(job.ids = ?outcome.failed, "Failed jobs that stalled too many times");
        }

        Ok(outcome)
    }
}

impl<J, S> Routine for Resetter<J, S>
where
    J: Job,
    S: WorkQueueStore<J>,
{
    const NAME: &'static str = "resetter";

    async fn tick(&self) {
        if let Err(err) = self.reset_once().await {
            error!(%err, job.kind = %J::KIND, "Failed to reset stalled jobs");
        }
    }
}
