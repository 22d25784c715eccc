//! Log retention: deleting old finished jobs.

use std::sync::Arc;

use jiff::Span;
use tracing::{error, info, instrument};

use crate::{
    clock::Clock,
    job::{ActionJob, Job, TriggerJob},
    metrics::Metrics,
    periodic::Routine,
    store::{self, WorkQueueStore},
};

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Swept {
    /// Action jobs deleted.
    pub actions: u64,

    /// Trigger jobs deleted.
    pub triggers: u64,
}

/// Deletes completed and failed jobs older than the retention period.
#[derive(Debug)]
pub struct Sweeper<A, T> {
    actions: Arc<A>,
    triggers: Arc<T>,
    clock: Arc<dyn Clock>,
    retention: Span,
    metrics: Metrics,
}

impl<A, T> Sweeper<A, T>
where
    A: WorkQueueStore<ActionJob>,
    T: WorkQueueStore<TriggerJob>,
{
    /// Creates a sweeper keeping finished jobs for `retention`.
    pub fn new(
        actions: Arc<A>,
        triggers: Arc<T>,
        clock: Arc<dyn Clock>,
        retention: Span,
        metrics: Metrics,
    ) -> Self {
        Self {
            actions,
            triggers,
            clock,
            retention,
            metrics,
        }
    }

    /// Runs one sweep.
    ///
    /// Action jobs go first since they reference trigger jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the cutoff can't be computed or a delete fails.
    #[instrument(skip(self), err)]
    pub async fn sweep_once(&self) -> Result<Swept, store::Error> {
        let cutoff = self.clock.now().checked_sub(self.retention)?;

        let actions = self.actions.delete_finished_before(cutoff).await?;
        self.metrics.record_swept(ActionJob::KIND, actions);

        let triggers = self.triggers.delete_finished_before(cutoff).await?;
        self.metrics.record_swept(TriggerJob::KIND, triggers);

        Ok(Swept { actions, triggers })
    }
}

impl<A, T> Routine for Sweeper<A, T>
where
    A: WorkQueueStore<ActionJob>,
    T: WorkQueueStore<TriggerJob>,
{
    const NAME: &'static str = "sweeper";

    async fn tick(&self) {
        match self.sweep_once().await {
            Ok(Swept {
                actions: 0,
                triggers: 0,
            }) => {}
            Ok(swept) => info!(
                actions = swept.actions,
                triggers = swept.triggers,
                "Deleted finished jobs past retention"
            ),
            Err(err) => error!(%err, "Failed to sweep finished jobs"),
        }
    }
}
