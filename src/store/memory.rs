use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use jiff::Timestamp;
use uuid::Uuid;

use super::{ResetOutcome, Result, StoreOptions, WorkQueueStore, RESET_FAILURE_MESSAGE};
use crate::{
    clock::Clock,
    job::{Job, JobId, JobState, Lifecycle},
};

/// In-process store.
///
/// Rows are kept in a map ordered by ID, which is assigned from a counter, so
/// claims are oldest-first just like with [`PgStore`](super::PgStore).
/// Cloning the store yields another handle onto the same rows.
#[derive(Debug)]
pub struct MemoryStore<J: Job> {
    rows: Arc<Mutex<Rows<J>>>,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    worker_id: Uuid,
}

#[derive(Debug)]
struct Rows<J> {
    next_id: JobId,
    jobs: BTreeMap<JobId, J>,
}

impl<J: Job> Clone for MemoryStore<J> {
    fn clone(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
            options: self.options.clone(),
            clock: Arc::clone(&self.clock),
            worker_id: self.worker_id,
        }
    }
}

impl<J: Job> MemoryStore<J> {
    /// Creates an empty store.
    pub fn new(options: StoreOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(Rows {
                next_id: 1,
                jobs: BTreeMap::new(),
            })),
            options,
            clock,
            worker_id: Uuid::new_v4(),
        }
    }

    /// Identifies claims made through this store.
    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Returns a copy of the row with the given ID.
    pub fn get(&self, id: JobId) -> Option<J> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Returns a copy of every row, oldest first.
    pub fn jobs(&self) -> Vec<J> {
        self.lock().jobs.values().cloned().collect()
    }

    /// Applies `f` to the row with the given ID, returning whatever it
    /// returns, or `None` when the row doesn't exist.
    pub fn update<R>(&self, id: JobId, f: impl FnOnce(&mut J) -> R) -> Option<R> {
        self.lock().jobs.get_mut(&id).map(f)
    }

    fn lock(&self) -> MutexGuard<'_, Rows<J>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_held(&self, job: &J) -> bool {
        let lifecycle = job.lifecycle();
        lifecycle.state == JobState::Processing && lifecycle.worker_id == Some(self.worker_id)
    }

    fn insert(&self, rows: &mut Rows<J>, spec: J::Spec, now: Timestamp) -> Option<JobId> {
        if rows.jobs.values().any(|job| job.blocks(&spec)) {
            return None;
        }

        let id = rows.next_id;
        rows.next_id += 1;
        rows.jobs
            .insert(id, J::from_spec(id, spec, Lifecycle::queued(now)));
        Some(id)
    }

    fn finish(&self, id: JobId, f: impl FnOnce(&mut Lifecycle)) -> bool {
        let now = self.clock.now();
        let mut rows = self.lock();
        match rows.jobs.get_mut(&id) {
            Some(job) if self.is_held(job) => {
                let lifecycle = job.lifecycle_mut();
                lifecycle.finished_at = Some(now);
                f(lifecycle);
                true
            }
            _ => false,
        }
    }
}

impl<J: Job> WorkQueueStore<J> for MemoryStore<J> {
    async fn enqueue(&self, spec: J::Spec) -> Result<Option<JobId>> {
        let now = self.clock.now();
        let mut rows = self.lock();
        Ok(self.insert(&mut rows, spec, now))
    }

    async fn enqueue_many(&self, specs: Vec<J::Spec>) -> Result<Vec<JobId>> {
        let now = self.clock.now();
        let mut rows = self.lock();
        Ok(specs
            .into_iter()
            .filter_map(|spec| self.insert(&mut rows, spec, now))
            .collect())
    }

    async fn dequeue(&self) -> Result<Option<J>> {
        let now = self.clock.now();
        let max_num_retries = self.options.max_num_retries;
        let mut rows = self.lock();

        let Some(job) = rows
            .jobs
            .values_mut()
            .find(|job| job.lifecycle().is_claimable(now, max_num_retries))
        else {
            return Ok(None);
        };

        let lifecycle = job.lifecycle_mut();
        lifecycle.state = JobState::Processing;
        lifecycle.started_at = Some(now);
        lifecycle.last_heartbeat_at = Some(now);
        lifecycle.worker_id = Some(self.worker_id);

        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, ids: &[JobId]) -> Result<Vec<JobId>> {
        let now = self.clock.now();
        let mut rows = self.lock();

        let mut held = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = rows.jobs.get_mut(id) {
                if self.is_held(job) {
                    job.lifecycle_mut().last_heartbeat_at = Some(now);
                    held.push(*id);
                }
            }
        }

        Ok(held)
    }

    async fn mark_complete(&self, id: JobId) -> Result<bool> {
        Ok(self.finish(id, |lifecycle| {
            lifecycle.state = JobState::Completed;
        }))
    }

    async fn mark_errored(&self, id: JobId, message: &str) -> Result<bool> {
        let retry_at = self.clock.now().checked_add(self.options.retry_after)?;
        let max_num_retries = self.options.max_num_retries;

        Ok(self.finish(id, |lifecycle| {
            lifecycle.num_failures += 1;
            lifecycle.failure_message = Some(message.to_string());
            if lifecycle.num_failures >= max_num_retries {
                lifecycle.state = JobState::Failed;
            } else {
                lifecycle.state = JobState::Errored;
                lifecycle.process_after = Some(retry_at);
            }
        }))
    }

    async fn mark_failed(&self, id: JobId, message: &str) -> Result<bool> {
        Ok(self.finish(id, |lifecycle| {
            lifecycle.state = JobState::Failed;
            lifecycle.failure_message = Some(message.to_string());
        }))
    }

    async fn reset_stalled(&self) -> Result<ResetOutcome> {
        let now = self.clock.now();
        let stalled_before = now.checked_sub(self.options.stalled_max_age)?;
        let max_num_resets = self.options.max_num_resets;
        let mut rows = self.lock();

        let mut outcome = ResetOutcome::default();
        for (id, job) in rows.jobs.iter_mut() {
            let lifecycle = job.lifecycle_mut();
            let stalled = lifecycle.state == JobState::Processing
                && lifecycle
                    .last_heartbeat_at
                    .map_or(true, |heartbeat| heartbeat < stalled_before);
            if !stalled {
                continue;
            }

            if lifecycle.num_resets < max_num_resets {
                lifecycle.state = JobState::Queued;
                lifecycle.num_resets += 1;
                lifecycle.started_at = None;
                lifecycle.worker_id = None;
                outcome.reset.push(*id);
            } else {
                lifecycle.state = JobState::Failed;
                lifecycle.finished_at = Some(now);
                lifecycle.failure_message = Some(RESET_FAILURE_MESSAGE.to_string());
                outcome.failed.push(*id);
            }
        }

        Ok(outcome)
    }

    async fn queued_count(&self, include_processing: bool) -> Result<u64> {
        let max_num_retries = self.options.max_num_retries;
        let rows = self.lock();

        let count = rows
            .jobs
            .values()
            .filter(|job| {
                let lifecycle = job.lifecycle();
                match lifecycle.state {
                    JobState::Queued => true,
                    JobState::Errored => lifecycle.num_failures < max_num_retries,
                    JobState::Processing => include_processing,
                    JobState::Completed | JobState::Failed => false,
                }
            })
            .count();

        Ok(count as u64)
    }

    async fn delete_finished_before(&self, cutoff: Timestamp) -> Result<u64> {
        let mut rows = self.lock();

        let before = rows.jobs.len();
        rows.jobs.retain(|_, job| {
            let lifecycle = job.lifecycle();
            !(lifecycle.state.is_terminal()
                && lifecycle.finished_at.is_some_and(|finished| finished < cutoff))
        });

        Ok((before - rows.jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use futures::future::try_join_all;
    use jiff::ToSpan;
    use tokio::sync::Barrier;

    use super::*;
    use crate::{
        clock::ManualClock,
        job::{ActionJob, ActionRef, ActionSpec, TriggerJob, TriggerSpec},
    };

    fn start() -> Timestamp {
        "2024-06-01T12:00:00Z".parse().unwrap()
    }

    fn trigger_store(options: StoreOptions) -> (MemoryStore<TriggerJob>, ManualClock) {
        let clock = ManualClock::new(start());
        (MemoryStore::new(options, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn dequeue_is_oldest_first() -> Result {
        let (store, _) = trigger_store(StoreOptions::default());
        let first = store.enqueue(TriggerSpec { monitor_id: 1 }).await?;
        let second = store.enqueue(TriggerSpec { monitor_id: 2 }).await?;

        let job = store.dequeue().await?.expect("a queued job");
        assert_eq!(Some(job.id), first);
        assert_eq!(job.lifecycle.state, JobState::Processing);
        assert_eq!(job.lifecycle.started_at, Some(start()));
        assert_eq!(job.lifecycle.last_heartbeat_at, Some(start()));
        assert_eq!(job.lifecycle.worker_id, Some(store.worker_id()));

        let job = store.dequeue().await?.expect("a queued job");
        assert_eq!(Some(job.id), second);

        assert!(store.dequeue().await?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn in_flight_trigger_suppresses_duplicate() -> Result {
        let (store, _) = trigger_store(StoreOptions::default());
        let spec = TriggerSpec { monitor_id: 1 };

        assert!(store.enqueue(spec).await?.is_some());
        assert!(store.enqueue(spec).await?.is_none());

        let job = store.dequeue().await?.expect("a queued job");
        assert!(store.enqueue(spec).await?.is_none());

        store.mark_complete(job.id).await?;
        assert!(store.enqueue(spec).await?.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn errored_trigger_suppresses_duplicate_until_retried() -> Result {
        let (store, clock) = trigger_store(StoreOptions::default());
        let spec = TriggerSpec { monitor_id: 1 };

        let id = store.enqueue(spec).await?.expect("inserted");
        let job = store.dequeue().await?.expect("a queued job");
        assert!(store.mark_errored(job.id, "search timed out").await?);
        assert!(store.enqueue(spec).await?.is_none());

        clock.advance(10.seconds())?;
        assert_eq!(store.dequeue().await?.map(|job| job.id), Some(id));
        assert!(store.mark_complete(id).await?);
        assert!(store.enqueue(spec).await?.is_some());

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dequeue_is_exclusive() -> Result {
        let clock = ManualClock::new(start());
        let store: MemoryStore<ActionJob> =
            MemoryStore::new(StoreOptions::default(), Arc::new(clock));
        let specs = (1..=20)
            .map(|id| ActionSpec {
                trigger_job_id: 1,
                action: ActionRef::Webhook(id),
            })
            .collect();
        store.enqueue_many(specs).await?;

        // Every claimant waits at the barrier so the claims race.
        let barrier = Arc::new(Barrier::new(40));
        let claims = (0..40).map(|_| {
            let store = store.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                store.dequeue().await
            })
        });
        let claimed: Vec<_> = try_join_all(claims)
            .await
            .expect("claim tasks don't panic")
            .into_iter()
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        let ids: HashSet<_> = claimed.iter().map(|job| job.id).collect();
        assert_eq!(claimed.len(), 20);
        assert_eq!(ids.len(), 20);

        Ok(())
    }

    #[tokio::test]
    async fn errored_job_waits_for_backoff() -> Result {
        let (store, clock) = trigger_store(StoreOptions::default());
        store.enqueue(TriggerSpec { monitor_id: 1 }).await?;

        let job = store.dequeue().await?.expect("a queued job");
        assert!(store.mark_errored(job.id, "search timed out").await?);

        let row = store.get(job.id).expect("row exists");
        assert_eq!(row.lifecycle.state, JobState::Errored);
        assert_eq!(row.lifecycle.num_failures, 1);
        assert_eq!(
            row.lifecycle.failure_message.as_deref(),
            Some("search timed out")
        );
        assert!(store.dequeue().await?.is_none());

        clock.advance(10.seconds())?;
        let retried = store.dequeue().await?.expect("retry is due");
        assert_eq!(retried.id, job.id);

        Ok(())
    }

    #[tokio::test]
    async fn retries_are_bounded() -> Result {
        let options = StoreOptions {
            max_num_retries: 3,
            retry_after: 1.second(),
            ..StoreOptions::default()
        };
        let (store, clock) = trigger_store(options);
        let id = store
            .enqueue(TriggerSpec { monitor_id: 1 })
            .await?
            .expect("inserted");

        for _ in 0..3 {
            clock.advance(1.second())?;
            let job = store.dequeue().await?.expect("job is claimable");
            store.mark_errored(job.id, "boom").await?;
        }

        let row = store.get(id).expect("row exists");
        assert_eq!(row.lifecycle.state, JobState::Failed);
        assert_eq!(row.lifecycle.num_failures, 3);

        clock.advance(1.hour())?;
        assert!(store.dequeue().await?.is_none());
        assert_eq!(store.queued_count(true).await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn stalled_jobs_are_reset_then_failed() -> Result {
        let options = StoreOptions {
            max_num_resets: 2,
            ..StoreOptions::default()
        };
        let (store, clock) = trigger_store(options);
        let id = store
            .enqueue(TriggerSpec { monitor_id: 1 })
            .await?
            .expect("inserted");

        for resets in 1..=2 {
            store.dequeue().await?.expect("job is claimable");

            // Fresh heartbeats are left alone.
            clock.advance(30.seconds())?;
            assert_eq!(store.reset_stalled().await?, ResetOutcome::default());

            clock.advance(31.seconds())?;
            let outcome = store.reset_stalled().await?;
            assert_eq!(outcome.reset, vec![id]);

            let row = store.get(id).expect("row exists");
            assert_eq!(row.lifecycle.state, JobState::Queued);
            assert_eq!(row.lifecycle.num_resets, resets);
            assert_eq!(row.lifecycle.started_at, None);
        }

        store.dequeue().await?.expect("job is claimable");
        clock.advance(61.seconds())?;
        let outcome = store.reset_stalled().await?;
        assert_eq!(outcome.failed, vec![id]);

        let row = store.get(id).expect("row exists");
        assert_eq!(row.lifecycle.state, JobState::Failed);
        assert_eq!(
            row.lifecycle.failure_message.as_deref(),
            Some(RESET_FAILURE_MESSAGE)
        );

        Ok(())
    }

    #[tokio::test]
    async fn heartbeat_keeps_job_alive() -> Result {
        let (store, clock) = trigger_store(StoreOptions::default());
        store.enqueue(TriggerSpec { monitor_id: 1 }).await?;
        let job = store.dequeue().await?.expect("a queued job");

        clock.advance(50.seconds())?;
        assert_eq!(store.heartbeat(&[job.id, 999]).await?, vec![job.id]);

        clock.advance(50.seconds())?;
        assert!(store.reset_stalled().await?.reset.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn stale_claim_cannot_finish_reset_job() -> Result {
        let (store, clock) = trigger_store(StoreOptions::default());
        store.enqueue(TriggerSpec { monitor_id: 1 }).await?;
        let job = store.dequeue().await?.expect("a queued job");

        clock.advance(2.minutes())?;
        store.reset_stalled().await?;

        assert!(!store.mark_complete(job.id).await?);
        assert!(store.heartbeat(&[job.id]).await?.is_empty());
        assert_eq!(
            store.get(job.id).map(|job| job.lifecycle.state),
            Some(JobState::Queued)
        );

        Ok(())
    }

    #[tokio::test]
    async fn queued_count_optionally_includes_processing() -> Result {
        let (store, _) = trigger_store(StoreOptions::default());
        for monitor_id in 1..=3 {
            store.enqueue(TriggerSpec { monitor_id }).await?;
        }
        store.dequeue().await?;

        assert_eq!(store.queued_count(false).await?, 2);
        assert_eq!(store.queued_count(true).await?, 3);

        Ok(())
    }

    #[tokio::test]
    async fn deletes_only_old_finished_jobs() -> Result {
        let (store, clock) = trigger_store(StoreOptions::default());
        for monitor_id in 1..=3 {
            store.enqueue(TriggerSpec { monitor_id }).await?;
        }

        let done = store.dequeue().await?.expect("a queued job");
        store.mark_complete(done.id).await?;
        let failed = store.dequeue().await?.expect("a queued job");
        store.mark_failed(failed.id, "invalid").await?;

        clock.advance(2.hours())?;
        let cutoff = clock.now().checked_sub(1.hour())?;
        assert_eq!(store.delete_finished_before(cutoff).await?, 2);

        let remaining: Vec<_> = store.jobs().into_iter().map(|job| job.id).collect();
        assert_eq!(remaining.len(), 1);
        assert!(!remaining.contains(&done.id));

        Ok(())
    }
}
