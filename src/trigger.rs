//! Trigger job handling.
//!
//! A [`TriggerRunner`] executes a monitor's query as the monitor's owner,
//! advances the monitor's schedule, and fans any new results out into one
//! action job per enabled action.

use std::sync::Arc;

use jiff::{Span, Timestamp};
use tracing::{info, instrument, warn};

use crate::{
    clock::Clock,
    handler::{Handler, Result},
    job::{ActionJob, ActionSpec, TriggerJob},
    monitor::MonitorStore,
    search::{Actor, Searcher},
    store::WorkQueueStore,
};

/// Handles [`TriggerJob`]s.
#[derive(Debug)]
pub struct TriggerRunner<M, S, Q> {
    monitors: Arc<M>,
    searcher: Arc<S>,
    actions: Arc<Q>,
    clock: Arc<dyn Clock>,
    interval: Span,
}

impl<M, S, Q> TriggerRunner<M, S, Q> {
    /// Creates a runner that schedules each monitor `interval` after its
    /// previous run and enqueues action jobs onto `actions`.
    pub fn new(
        monitors: Arc<M>,
        searcher: Arc<S>,
        actions: Arc<Q>,
        clock: Arc<dyn Clock>,
        interval: Span,
    ) -> Self {
        Self {
            monitors,
            searcher,
            actions,
            clock,
            interval,
        }
    }
}

/// Restricts `query` to commits newer than `latest_result`.
pub fn query_with_after(query: &str, latest_result: Option<Timestamp>) -> String {
    match latest_result {
        Some(latest_result) => format!("{query} after:\"{latest_result}\""),
        None => query.to_string(),
    }
}

impl<M, S, Q> Handler<TriggerJob> for TriggerRunner<M, S, Q>
where
    M: MonitorStore,
    S: Searcher,
    Q: WorkQueueStore<ActionJob>,
{
    #[instrument(
        skip_all,
        fields(job.id = job.id, monitor.id = job.monitor_id),
        err
    )]
    async fn handle(&self, job: TriggerJob) -> Result {
        let monitor = self.monitors.monitor(job.monitor_id).await?;
        let query = query_with_after(&monitor.query, monitor.latest_result);

        let searched = self
            .searcher
            .search(
                Actor {
                    user_id: monitor.owner_id,
                },
                &query,
                monitor.id,
            )
            .await;

        let now = self.clock.now();
        let latest_result = match &searched {
            Ok(results) if !results.is_empty() => Some(
                results
                    .iter()
                    .filter_map(|result| result.timestamp)
                    .max()
                    .unwrap_or(now),
            ),
            _ => monitor.latest_result,
        };

        // The schedule advances even when the search failed.
        let next_run = now.checked_add(self.interval)?;
        self.monitors
            .set_trigger_schedule(monitor.id, next_run, latest_result)
            .await?;

        let results = searched.inspect_err(|err| {
            warn!(%err, "Search failed; retrying at the next scheduled run");
        })?;

        self.monitors
            .record_trigger_results(job.id, &query, &results)
            .await?;

        if results.is_empty() {
            return Ok(());
        }

        let specs: Vec<_> = monitor
            .enabled_actions()
            .map(|action| ActionSpec {
                trigger_job_id: job.id,
                action: action.reference(),
            })
            .collect();
        let enqueued = self.actions.enqueue_many(specs).await?;

        info!(
            results = results.len(),
            actions = enqueued.len(),
            "Enqueued action jobs"
        );

        Ok(())
    }
}
