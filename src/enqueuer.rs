//! Enqueuing trigger jobs for due monitors.

use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::{
    clock::Clock,
    job::{TriggerJob, TriggerSpec},
    monitor::{self, MonitorStore},
    periodic::Routine,
    store::WorkQueueStore,
};

/// Enqueues a trigger job for every due monitor.
#[derive(Debug)]
pub struct Enqueuer<M, Q> {
    monitors: Arc<M>,
    triggers: Arc<Q>,
    clock: Arc<dyn Clock>,
}

impl<M, Q> Enqueuer<M, Q>
where
    M: MonitorStore,
    Q: WorkQueueStore<TriggerJob>,
{
    /// Creates an enqueuer reading monitors from `monitors` and inserting
    /// into `triggers`.
    pub fn new(monitors: Arc<M>, triggers: Arc<Q>, clock: Arc<dyn Clock>) -> Self {
        Self {
            monitors,
            triggers,
            clock,
        }
    }

    /// Enqueues one trigger job per due monitor and returns how many were
    /// inserted.
    ///
    /// A monitor that fails to enqueue is logged and skipped; the others are
    /// still enqueued.
    ///
    /// # Errors
    ///
    /// Returns an error if due monitors can't be listed.
    #[instrument(skip(self), err)]
    pub async fn enqueue_due(&self) -> Result<usize, monitor::Error> {
        let due = self.monitors.due_monitors(self.clock.now()).await?;

        let mut enqueued = 0;
        for monitor_id in due {
            match self.triggers.enqueue(TriggerSpec { monitor_id }).await {
                Ok(Some(_)) => enqueued += 1,
                // Claimed or enqueued concurrently since the scan.
                Ok(None) => {}
                Err(err) => error!(%err, monitor.id = monitor_id, "Failed to enqueue trigger job"),
            }
        }

        Ok(enqueued)
    }
}

impl<M, Q> Routine for Enqueuer<M, Q>
where
    M: MonitorStore,
    Q: WorkQueueStore<TriggerJob>,
{
    const NAME: &'static str = "enqueuer";

    async fn tick(&self) {
        match self.enqueue_due().await {
            Ok(0) => {}
            Ok(enqueued) => info!(enqueued, "Enqueued trigger jobs"),
            Err(err) => error!(%err, "Failed to list due monitors"),
        }
    }
}
