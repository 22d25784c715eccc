use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use jiff::Timestamp;

use super::{ActionContext, Error, Monitor, MonitorId, MonitorStore, Result};
use crate::{
    job::{ActionRef, Job, JobId, TriggerJob},
    search::Match,
    store::MemoryStore,
};

/// In-process monitor store.
///
/// Trigger results are written onto the rows of the [`MemoryStore`] the
/// trigger pool claims from, so both must share the same handle.
#[derive(Debug, Clone)]
pub struct MemoryMonitorStore {
    monitors: Arc<Mutex<BTreeMap<MonitorId, Monitor>>>,
    triggers: MemoryStore<TriggerJob>,
}

impl MemoryMonitorStore {
    /// Creates an empty store backed by `triggers`.
    pub fn new(triggers: MemoryStore<TriggerJob>) -> Self {
        Self {
            monitors: Arc::default(),
            triggers,
        }
    }

    /// Adds or replaces a monitor.
    pub fn insert(&self, monitor: Monitor) {
        self.lock().insert(monitor.id, monitor);
    }

    /// Returns a copy of a monitor.
    pub fn get(&self, id: MonitorId) -> Option<Monitor> {
        self.lock().get(&id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<MonitorId, Monitor>> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MonitorStore for MemoryMonitorStore {
    async fn due_monitors(&self, now: Timestamp) -> Result<Vec<MonitorId>> {
        let in_flight: Vec<MonitorId> = self
            .triggers
            .jobs()
            .into_iter()
            .filter(|job| job.lifecycle().state.is_in_flight())
            .map(|job| job.monitor_id)
            .collect();

        Ok(self
            .lock()
            .values()
            .filter(|monitor| monitor.is_due(now) && !in_flight.contains(&monitor.id))
            .map(|monitor| monitor.id)
            .collect())
    }

    async fn monitor(&self, id: MonitorId) -> Result<Monitor> {
        self.get(id).ok_or(Error::MonitorNotFound(id))
    }

    async fn set_trigger_schedule(
        &self,
        id: MonitorId,
        next_run: Timestamp,
        latest_result: Option<Timestamp>,
    ) -> Result {
        let mut monitors = self.lock();
        let monitor = monitors.get_mut(&id).ok_or(Error::MonitorNotFound(id))?;
        monitor.next_run = Some(next_run);
        monitor.latest_result = latest_result;
        Ok(())
    }

    async fn record_trigger_results(
        &self,
        trigger_job_id: JobId,
        query_string: &str,
        results: &[Match],
    ) -> Result {
        self.triggers
            .update(trigger_job_id, |job| {
                job.query_string = Some(query_string.to_string());
                job.results = Some(results.to_vec());
            })
            .ok_or(Error::TriggerJobNotFound(trigger_job_id))
    }

    async fn action_context(&self, trigger_job_id: JobId, action: ActionRef) -> Result<ActionContext> {
        let trigger = self
            .triggers
            .get(trigger_job_id)
            .ok_or(Error::TriggerJobNotFound(trigger_job_id))?;
        let monitor = self
            .get(trigger.monitor_id)
            .ok_or(Error::MonitorNotFound(trigger.monitor_id))?;
        let found = monitor
            .actions
            .iter()
            .find(|candidate| candidate.reference() == action)
            .cloned()
            .ok_or(Error::ActionNotFound(action))?;

        Ok(ActionContext {
            monitor,
            action: found,
            results: trigger.results.unwrap_or_default(),
        })
    }

    async fn reset_trigger_timestamps(&self, id: MonitorId) -> Result {
        let mut monitors = self.lock();
        let monitor = monitors.get_mut(&id).ok_or(Error::MonitorNotFound(id))?;
        monitor.next_run = None;
        monitor.latest_result = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jiff::ToSpan;

    use super::*;
    use crate::{
        clock::ManualClock,
        job::TriggerSpec,
        monitor::{Action, ActionKind, WebhookConfig},
        search::{Content, MatchPreview},
        store::{StoreOptions, WorkQueueStore},
    };

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn now() -> Timestamp {
        "2024-06-01T00:00:00Z".parse().unwrap()
    }

    fn monitor(id: MonitorId) -> Monitor {
        Monitor {
            id,
            owner_id: 1,
            owner_name: "alice".to_string(),
            description: "New TODOs".to_string(),
            query: "TODO".to_string(),
            enabled: true,
            next_run: None,
            latest_result: None,
            actions: vec![Action {
                enabled: true,
                include_results: true,
                kind: ActionKind::Webhook(WebhookConfig {
                    id: 10,
                    url: "https://example.com/hook".to_string(),
                }),
            }],
        }
    }

    fn stores() -> (MemoryMonitorStore, MemoryStore<TriggerJob>) {
        let clock = Arc::new(ManualClock::new(now()));
        let triggers = MemoryStore::new(StoreOptions::default(), clock);
        (MemoryMonitorStore::new(triggers.clone()), triggers)
    }

    #[tokio::test]
    async fn due_monitors_skips_in_flight_and_future() -> TestResult {
        let (monitors, triggers) = stores();
        monitors.insert(monitor(1));
        monitors.insert(monitor(2));
        monitors.insert(Monitor {
            next_run: Some(now().checked_add(1.minute())?),
            ..monitor(3)
        });
        monitors.insert(Monitor {
            enabled: false,
            ..monitor(4)
        });

        triggers.enqueue(TriggerSpec { monitor_id: 2 }).await?;

        assert_eq!(monitors.due_monitors(now()).await?, vec![1]);

        Ok(())
    }

    #[tokio::test]
    async fn errored_trigger_keeps_monitor_in_flight() -> TestResult {
        let (monitors, triggers) = stores();
        monitors.insert(monitor(1));

        triggers.enqueue(TriggerSpec { monitor_id: 1 }).await?;
        let job = triggers.dequeue().await?.ok_or("a queued job")?;
        triggers.mark_errored(job.id, "search timed out").await?;

        assert!(monitors.due_monitors(now()).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn schedule_round_trip() -> TestResult {
        let (monitors, _) = stores();
        monitors.insert(monitor(1));

        let next_run = now().checked_add(5.minutes())?;
        monitors
            .set_trigger_schedule(1, next_run, Some(now()))
            .await?;
        let stored = monitors.monitor(1).await?;
        assert_eq!(stored.next_run, Some(next_run));
        assert_eq!(stored.latest_result, Some(now()));

        monitors.reset_trigger_timestamps(1).await?;
        let stored = monitors.monitor(1).await?;
        assert_eq!(stored.next_run, None);
        assert_eq!(stored.latest_result, None);

        assert!(matches!(
            monitors.monitor(99).await,
            Err(Error::MonitorNotFound(99))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn action_context_reads_recorded_results() -> TestResult {
        let (monitors, triggers) = stores();
        monitors.insert(monitor(1));

        let job_id = triggers
            .enqueue(TriggerSpec { monitor_id: 1 })
            .await?
            .expect("inserted");
        let results = vec![Match {
            repository: "github.com/test/test".to_string(),
            commit: "deadbeef".to_string(),
            timestamp: None,
            preview: MatchPreview::Message(Content::default()),
        }];
        monitors
            .record_trigger_results(job_id, "TODO", &results)
            .await?;

        let context = monitors
            .action_context(job_id, ActionRef::Webhook(10))
            .await?;
        assert_eq!(context.monitor.id, 1);
        assert_eq!(context.results, results);
        assert_eq!(context.action.reference(), ActionRef::Webhook(10));

        assert!(matches!(
            monitors.action_context(job_id, ActionRef::Email(10)).await,
            Err(Error::ActionNotFound(ActionRef::Email(10)))
        ));

        Ok(())
    }
}
