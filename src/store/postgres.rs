use std::{marker::PhantomData, sync::Arc};

use jiff::Timestamp;
use sqlx::{
    postgres::{PgArguments, PgRow},
    query::Query,
    types::Json,
    PgPool, Postgres, Row,
};
use tracing::instrument;
use uuid::Uuid;

use super::{ResetOutcome, Result, StoreOptions, WorkQueueStore, RESET_FAILURE_MESSAGE};
use crate::{
    clock::Clock,
    job::{ActionChannel, ActionJob, ActionSpec, Job, JobId, Lifecycle, TriggerJob, TriggerSpec},
    search::Match,
    timestamp::PgTimestamp,
};

/// A job kind that lives in its own Postgres table.
pub trait PgJob: Job {
    /// Fully qualified table name.
    const TABLE: &'static str;

    /// Builds the insert for `spec`, returning the new row's `id`.
    ///
    /// The insert may yield no row, which means an existing row blocks it.
    fn insert(spec: &Self::Spec, now: Timestamp) -> Query<'static, Postgres, PgArguments>;

    /// Decodes a full row.
    fn from_row(row: &PgRow) -> sqlx::Result<Self>;
}

impl PgJob for TriggerJob {
    const TABLE: &'static str = "codemonitor.trigger_job";

    // The partial unique index on in-flight rows turns a duplicate into a
    // no-op.
    fn insert(
        TriggerSpec { monitor_id }: &TriggerSpec,
        now: Timestamp,
    ) -> Query<'static, Postgres, PgArguments> {
        sqlx::query(
            r#"
            insert into codemonitor.trigger_job (monitor_id, state, queued_at)
            values ($1, 'queued', $2)
            on conflict do nothing
            returning id
            "#,
        )
        .bind(*monitor_id)
        .bind(PgTimestamp(now))
    }

    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let results: Option<Json<Vec<Match>>> = row.try_get("results")?;
        Ok(Self {
            id: row.try_get("id")?,
            monitor_id: row.try_get("monitor_id")?,
            query_string: row.try_get("query_string")?,
            results: results.map(|Json(results)| results),
            lifecycle: lifecycle_from_row(row)?,
        })
    }
}

impl PgJob for ActionJob {
    const TABLE: &'static str = "codemonitor.action_job";

    fn insert(spec: &ActionSpec, now: Timestamp) -> Query<'static, Postgres, PgArguments> {
        let channel = ActionChannel::from(spec.action);
        sqlx::query(
            r#"
            insert into codemonitor.action_job (
                trigger_job_id,
                email_id,
                webhook_id,
                slack_webhook_id,
                state,
                queued_at
            )
            values ($1, $2, $3, $4, 'queued', $5)
            returning id
            "#,
        )
        .bind(spec.trigger_job_id)
        .bind(channel.email_id)
        .bind(channel.webhook_id)
        .bind(channel.slack_webhook_id)
        .bind(PgTimestamp(now))
    }

    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            trigger_job_id: row.try_get("trigger_job_id")?,
            channel: ActionChannel {
                email_id: row.try_get("email_id")?,
                webhook_id: row.try_get("webhook_id")?,
                slack_webhook_id: row.try_get("slack_webhook_id")?,
            },
            lifecycle: lifecycle_from_row(row)?,
        })
    }
}

fn lifecycle_from_row(row: &PgRow) -> sqlx::Result<Lifecycle> {
    let timestamp = |column: &str| -> sqlx::Result<Option<Timestamp>> {
        Ok(row.try_get::<Option<PgTimestamp>, _>(column)?.map(Into::into))
    };

    Ok(Lifecycle {
        state: row.try_get("state")?,
        failure_message: row.try_get("failure_message")?,
        worker_id: row.try_get("worker_id")?,
        num_resets: row.try_get("num_resets")?,
        num_failures: row.try_get("num_failures")?,
        queued_at: row.try_get::<PgTimestamp, _>("queued_at")?.into(),
        started_at: timestamp("started_at")?,
        finished_at: timestamp("finished_at")?,
        last_heartbeat_at: timestamp("last_heartbeat_at")?,
        process_after: timestamp("process_after")?,
    })
}

/// Postgres-backed store.
///
/// Each store carries a worker ID that's recorded on every row it claims;
/// heartbeats and mark operations only apply to rows claimed through the
/// same store, so a handler whose job was reset can't clobber the next
/// attempt.
#[derive(Debug)]
pub struct PgStore<J: PgJob> {
    pool: PgPool,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    worker_id: Uuid,
    _marker: PhantomData<J>,
}

impl<J: PgJob> Clone for PgStore<J> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: self.options.clone(),
            clock: Arc::clone(&self.clock),
            worker_id: self.worker_id,
            _marker: PhantomData,
        }
    }
}

impl<J: PgJob> PgStore<J> {
    /// Creates a store over `pool` with a fresh worker ID.
    pub fn new(pool: PgPool, options: StoreOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            options,
            clock,
            worker_id: Uuid::new_v4(),
            _marker: PhantomData,
        }
    }

    /// Identifies claims made through this store.
    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fetches a row by ID.
    #[instrument(skip(self), fields(job.kind = %J::KIND), err)]
    pub async fn get(&self, id: JobId) -> Result<Option<J>> {
        let sql = format!("select * from {} where id = $1", J::TABLE);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(J::from_row).transpose()?)
    }

    fn now(&self) -> PgTimestamp {
        PgTimestamp(self.clock.now())
    }
}

impl<J: PgJob> WorkQueueStore<J> for PgStore<J> {
    #[instrument(
        skip(self, spec),
        fields(job.kind = %J::KIND, job.id = tracing::field::Empty),
        err
    )]
    async fn enqueue(&self, spec: J::Spec) -> Result<Option<JobId>> {
        let id: Option<JobId> = J::insert(&spec, self.clock.now())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get("id"))
            .transpose()?;

        if let Some(id) = id {
            tracing::Span::current().record("job.id", id);
        }

        Ok(id)
    }

    #[instrument(
        skip(self, specs),
        fields(job.kind = %J::KIND, jobs.count = specs.len()),
        err
    )]
    async fn enqueue_many(&self, specs: Vec<J::Spec>) -> Result<Vec<JobId>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let mut ids = Vec::with_capacity(specs.len());
        for spec in &specs {
            if let Some(row) = J::insert(spec, now).fetch_optional(&mut *tx).await? {
                ids.push(row.try_get("id")?);
            }
        }

        tx.commit().await?;

        Ok(ids)
    }

    #[instrument(
        skip(self),
        fields(job.kind = %J::KIND, job.id = tracing::field::Empty),
        err
    )]
    async fn dequeue(&self) -> Result<Option<J>> {
        let sql = format!(
            r#"
            with candidate as (
                select id
                from {table}
                where (
                    -- Find queued jobs...
                    state = 'queued'
                    -- ...Or errored jobs with retries left.
                    or (state = 'errored' and num_failures < $2)
                )
                  and (process_after is null or process_after <= $1)
                order by id
                limit 1
                for update skip locked
            )
            update {table} j
            set state = 'processing',
                started_at = $1,
                last_heartbeat_at = $1,
                worker_id = $3
            from candidate
            where j.id = candidate.id
            returning j.*
            "#,
            table = J::TABLE
        );

        let job = sqlx::query(&sql)
            .bind(self.now())
            .bind(self.options.max_num_retries)
            .bind(self.worker_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(J::from_row)
            .transpose()?;

        if let Some(job) = &job {
            tracing::Span::current().record("job.id", job.id());
        }

        Ok(job)
    }

    #[instrument(skip(self, ids), fields(job.kind = %J::KIND, jobs.count = ids.len()), err)]
    async fn heartbeat(&self, ids: &[JobId]) -> Result<Vec<JobId>> {
        let sql = format!(
            r#"
            update {}
            set last_heartbeat_at = $1
            where id = any($2)
              and state = 'processing'
              and worker_id = $3
            returning id
            "#,
            J::TABLE
        );

        let held = sqlx::query_scalar(&sql)
            .bind(self.now())
            .bind(ids)
            .bind(self.worker_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(held)
    }

    #[instrument(skip(self), fields(job.kind = %J::KIND), err)]
    async fn mark_complete(&self, id: JobId) -> Result<bool> {
        let sql = format!(
            r#"
            update {}
            set state = 'completed',
                finished_at = $2
            where id = $1
              and state = 'processing'
              and worker_id = $3
            "#,
            J::TABLE
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(self.now())
            .bind(self.worker_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(job.kind = %J::KIND), err)]
    async fn mark_errored(&self, id: JobId, message: &str) -> Result<bool> {
        let now = self.clock.now();
        let retry_at = now.checked_add(self.options.retry_after)?;
        let sql = format!(
            r#"
            update {}
            set state = case
                    when num_failures + 1 >= $5 then 'failed'::codemonitor.job_state
                    else 'errored'::codemonitor.job_state
                end,
                process_after = case
                    when num_failures + 1 >= $5 then process_after
                    else $4
                end,
                num_failures = num_failures + 1,
                failure_message = $2,
                finished_at = $3
            where id = $1
              and state = 'processing'
              and worker_id = $6
            "#,
            J::TABLE
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(message)
            .bind(PgTimestamp(now))
            .bind(PgTimestamp(retry_at))
            .bind(self.options.max_num_retries)
            .bind(self.worker_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(job.kind = %J::KIND), err)]
    async fn mark_failed(&self, id: JobId, message: &str) -> Result<bool> {
        let sql = format!(
            r#"
            update {}
            set state = 'failed',
                failure_message = $2,
                finished_at = $3
            where id = $1
              and state = 'processing'
              and worker_id = $4
            "#,
            J::TABLE
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(message)
            .bind(self.now())
            .bind(self.worker_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(job.kind = %J::KIND), err)]
    async fn reset_stalled(&self) -> Result<ResetOutcome> {
        let now = self.clock.now();
        let stalled_before = now.checked_sub(self.options.stalled_max_age)?;
        let mut tx = self.pool.begin().await?;

        let reset_sql = format!(
            r#"
            update {table}
            set state = 'queued',
                num_resets = num_resets + 1,
                started_at = null,
                worker_id = null
            where id in (
                select id
                from {table}
                where state = 'processing'
                  and last_heartbeat_at < $1
                  and num_resets < $2
                for update skip locked
            )
            returning id
            "#,
            table = J::TABLE
        );
        let reset = sqlx::query_scalar(&reset_sql)
            .bind(PgTimestamp(stalled_before))
            .bind(self.options.max_num_resets)
            .fetch_all(&mut *tx)
            .await?;

        let failed_sql = format!(
            r#"
            update {table}
            set state = 'failed',
                finished_at = $3,
                failure_message = $4
            where id in (
                select id
                from {table}
                where state = 'processing'
                  and last_heartbeat_at < $1
                  and num_resets >= $2
                for update skip locked
            )
            returning id
            "#,
            table = J::TABLE
        );
        let failed = sqlx::query_scalar(&failed_sql)
            .bind(PgTimestamp(stalled_before))
            .bind(self.options.max_num_resets)
            .bind(PgTimestamp(now))
            .bind(RESET_FAILURE_MESSAGE)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(ResetOutcome { reset, failed })
    }

    #[instrument(skip(self), fields(job.kind = %J::KIND), err)]
    async fn queued_count(&self, include_processing: bool) -> Result<u64> {
        let sql = format!(
            r#"
            select count(*)
            from {}
            where state = 'queued'
               or (state = 'errored' and num_failures < $1)
               or ($2 and state = 'processing')
            "#,
            J::TABLE
        );

        let count: i64 = sqlx::query_scalar(&sql)
            .bind(self.options.max_num_retries)
            .bind(include_processing)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.unsigned_abs())
    }

    #[instrument(skip(self), fields(job.kind = %J::KIND), err)]
    async fn delete_finished_before(&self, cutoff: Timestamp) -> Result<u64> {
        let sql = format!(
            r#"
            delete from {}
            where state in ('completed', 'failed')
              and finished_at < $1
            "#,
            J::TABLE
        );

        let result = sqlx::query(&sql)
            .bind(PgTimestamp(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
