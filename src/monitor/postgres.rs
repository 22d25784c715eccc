use jiff::Timestamp;
use sqlx::{postgres::PgRow, types::Json, PgConnection, PgPool, Row};
use tracing::instrument;

use super::{
    Action, ActionContext, ActionKind, EmailConfig, Error, Monitor, MonitorId, MonitorStore,
    Result, SlackConfig, WebhookConfig,
};
use crate::{
    job::{ActionRef, JobId},
    search::Match,
    timestamp::PgTimestamp,
};

/// Postgres-backed monitor store.
#[derive(Debug, Clone)]
pub struct PgMonitorStore {
    pool: PgPool,
}

impl PgMonitorStore {
    /// Creates a store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl MonitorStore for PgMonitorStore {
    #[instrument(skip(self), err)]
    async fn due_monitors(&self, now: Timestamp) -> Result<Vec<MonitorId>> {
        let ids = sqlx::query_scalar(
            r#"
            select m.id
            from codemonitor.monitor m
            where m.enabled
              and (m.next_run is null or m.next_run <= $1)
              and not exists (
                  select 1
                  from codemonitor.trigger_job j
                  where j.monitor_id = m.id
                    and j.state in ('queued', 'processing', 'errored')
              )
            order by m.id
            "#,
        )
        .bind(PgTimestamp(now))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    #[instrument(skip(self), fields(monitor.id = id), err)]
    async fn monitor(&self, id: MonitorId) -> Result<Monitor> {
        let mut conn = self.pool.acquire().await?;
        load_monitor(&mut conn, id).await
    }

    #[instrument(skip(self), fields(monitor.id = id), err)]
    async fn set_trigger_schedule(
        &self,
        id: MonitorId,
        next_run: Timestamp,
        latest_result: Option<Timestamp>,
    ) -> Result {
        let result = sqlx::query(
            r#"
            update codemonitor.monitor
            set next_run = $2,
                latest_result = $3,
                updated_at = now()
            where id = $1
            "#,
        )
        .bind(id)
        .bind(PgTimestamp(next_run))
        .bind(latest_result.map(PgTimestamp))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::MonitorNotFound(id));
        }

        Ok(())
    }

    #[instrument(skip(self, results), fields(results.count = results.len()), err)]
    async fn record_trigger_results(
        &self,
        trigger_job_id: JobId,
        query_string: &str,
        results: &[Match],
    ) -> Result {
        let result = sqlx::query(
            r#"
            update codemonitor.trigger_job
            set query_string = $2,
                results = $3
            where id = $1
            "#,
        )
        .bind(trigger_job_id)
        .bind(query_string)
        .bind(Json(results))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::TriggerJobNotFound(trigger_job_id));
        }

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn action_context(&self, trigger_job_id: JobId, action: ActionRef) -> Result<ActionContext> {
        // Sibling action jobs read the same trigger concurrently; a single
        // snapshot keeps the monitor, action, and results consistent. It
        // isn't held across delivery.
        let mut tx = self.pool.begin().await?;
        sqlx::query("set transaction isolation level repeatable read, read only")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r#"
            select monitor_id, results
            from codemonitor.trigger_job
            where id = $1
            "#,
        )
        .bind(trigger_job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::TriggerJobNotFound(trigger_job_id))?;

        let monitor_id: MonitorId = row.try_get("monitor_id")?;
        let results: Option<Json<Vec<Match>>> = row.try_get("results")?;

        let monitor = load_monitor(&mut tx, monitor_id).await?;
        let found = monitor
            .actions
            .iter()
            .find(|candidate| candidate.reference() == action)
            .cloned()
            .ok_or(Error::ActionNotFound(action))?;

        tx.commit().await?;

        Ok(ActionContext {
            monitor,
            action: found,
            results: results.map(|Json(results)| results).unwrap_or_default(),
        })
    }

    #[instrument(skip(self), fields(monitor.id = id), err)]
    async fn reset_trigger_timestamps(&self, id: MonitorId) -> Result {
        let result = sqlx::query(
            r#"
            update codemonitor.monitor
            set next_run = null,
                latest_result = null,
                updated_at = now()
            where id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::MonitorNotFound(id));
        }

        Ok(())
    }
}

async fn load_monitor(conn: &mut PgConnection, id: MonitorId) -> Result<Monitor> {
    let row = sqlx::query(
        r#"
        select id, owner_id, owner_name, description, query, enabled, next_run, latest_result
        from codemonitor.monitor
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(Error::MonitorNotFound(id))?;

    let mut actions = Vec::new();

    let emails = sqlx::query(
        r#"
        select id, enabled, include_results, priority, recipients
        from codemonitor.email_action
        where monitor_id = $1
        order by id
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    for email in &emails {
        let priority: String = email.try_get("priority")?;
        actions.push(Action {
            enabled: email.try_get("enabled")?,
            include_results: email.try_get("include_results")?,
            kind: ActionKind::Email(EmailConfig {
                id: email.try_get("id")?,
                recipients: email.try_get("recipients")?,
                priority: priority.parse()?,
            }),
        });
    }

    for table in ["webhook_action", "slack_webhook_action"] {
        let sql = format!(
            r#"
            select id, enabled, include_results, url
            from codemonitor.{table}
            where monitor_id = $1
            order by id
            "#
        );
        let rows = sqlx::query(&sql).bind(id).fetch_all(&mut *conn).await?;
        for row in &rows {
            let (action_id, url) = (row.try_get("id")?, row.try_get("url")?);
            actions.push(Action {
                enabled: row.try_get("enabled")?,
                include_results: row.try_get("include_results")?,
                kind: if table == "webhook_action" {
                    ActionKind::Webhook(WebhookConfig { id: action_id, url })
                } else {
                    ActionKind::Slack(SlackConfig { id: action_id, url })
                },
            });
        }
    }

    monitor_from_row(&row, actions)
}

fn monitor_from_row(row: &PgRow, actions: Vec<Action>) -> Result<Monitor> {
    Ok(Monitor {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        owner_name: row.try_get("owner_name")?,
        description: row.try_get("description")?,
        query: row.try_get("query")?,
        enabled: row.try_get("enabled")?,
        next_run: row
            .try_get::<Option<PgTimestamp>, _>("next_run")?
            .map(Into::into),
        latest_result: row
            .try_get::<Option<PgTimestamp>, _>("latest_result")?
            .map(Into::into),
        actions,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jiff::ToSpan;

    use super::*;
    use crate::{
        clock::ManualClock,
        job::{TriggerJob, TriggerSpec},
        monitor::Priority,
        search::{Content, MatchPreview, Range},
        store::{PgStore, StoreOptions, WorkQueueStore},
    };

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn now() -> Timestamp {
        "2024-06-01T00:00:00Z".parse().unwrap()
    }

    async fn seed(pool: &PgPool) -> sqlx::Result<MonitorId> {
        let id: MonitorId = sqlx::query_scalar(
            r#"
            insert into codemonitor.monitor (owner_id, owner_name, description, query)
            values (42, 'alice', 'New TODOs', 'TODO type:diff')
            returning id
            "#,
        )
        .fetch_one(pool)
        .await?;

        sqlx::query(
            r#"
            insert into codemonitor.email_action
                (monitor_id, include_results, priority, recipients)
            values ($1, true, 'critical', array['alice@example.com'])
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        sqlx::query(
            r#"
            insert into codemonitor.webhook_action (monitor_id, url)
            values ($1, 'https://example.com/hook')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        sqlx::query(
            r#"
            insert into codemonitor.slack_webhook_action (monitor_id, enabled, url)
            values ($1, false, 'https://hooks.slack.com/services/x')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(id)
    }

    #[sqlx::test]
    async fn loads_monitor_with_actions(pool: PgPool) -> TestResult {
        let id = seed(&pool).await?;
        let monitors = PgMonitorStore::new(pool);

        let monitor = monitors.monitor(id).await?;
        assert_eq!(monitor.owner_id, 42);
        assert_eq!(monitor.owner_name, "alice");
        assert_eq!(monitor.actions.len(), 3);
        assert_eq!(monitor.enabled_actions().count(), 2);

        let ActionKind::Email(email) = &monitor.actions[0].kind else {
            panic!("expected an email action first");
        };
        assert_eq!(email.priority, Priority::Critical);
        assert_eq!(email.recipients, vec!["alice@example.com".to_string()]);
        assert!(monitor.actions[0].include_results);

        Ok(())
    }

    #[sqlx::test]
    async fn due_monitors_respects_schedule_and_in_flight(pool: PgPool) -> TestResult {
        let first = seed(&pool).await?;
        let second = seed(&pool).await?;
        let monitors = PgMonitorStore::new(pool.clone());

        assert_eq!(monitors.due_monitors(now()).await?, vec![first, second]);

        monitors
            .set_trigger_schedule(first, now().checked_add(5.minutes())?, None)
            .await?;
        let triggers: PgStore<TriggerJob> = PgStore::new(
            pool,
            StoreOptions::default(),
            Arc::new(ManualClock::new(now())),
        );
        triggers.enqueue(TriggerSpec { monitor_id: second }).await?;
        assert!(monitors.due_monitors(now()).await?.is_empty());

        monitors.reset_trigger_timestamps(first).await?;
        assert_eq!(monitors.due_monitors(now()).await?, vec![first]);

        Ok(())
    }

    #[sqlx::test]
    async fn errored_trigger_keeps_monitor_in_flight(pool: PgPool) -> TestResult {
        let id = seed(&pool).await?;
        let monitors = PgMonitorStore::new(pool.clone());
        let clock = ManualClock::new(now());
        let triggers: PgStore<TriggerJob> =
            PgStore::new(pool, StoreOptions::default(), Arc::new(clock.clone()));

        triggers.enqueue(TriggerSpec { monitor_id: id }).await?;
        let job = triggers.dequeue().await?.ok_or("a queued job")?;
        triggers.mark_errored(job.id, "search timed out").await?;

        // Due again, but its retry hasn't run yet.
        assert!(monitors.due_monitors(now()).await?.is_empty());

        clock.advance(10.seconds())?;
        let retried = triggers.dequeue().await?.ok_or("retry is claimable")?;
        triggers.mark_complete(retried.id).await?;
        assert_eq!(monitors.due_monitors(now()).await?, vec![id]);

        Ok(())
    }

    #[sqlx::test]
    async fn action_context_snapshot(pool: PgPool) -> TestResult {
        let monitor_id = seed(&pool).await?;
        let monitors = PgMonitorStore::new(pool.clone());
        let triggers: PgStore<TriggerJob> = PgStore::new(
            pool,
            StoreOptions::default(),
            Arc::new(ManualClock::new(now())),
        );

        let job_id = triggers
            .enqueue(TriggerSpec { monitor_id })
            .await?
            .expect("inserted");
        let results = vec![Match {
            repository: "github.com/test/test".to_string(),
            commit: "0123456789abcdef".to_string(),
            timestamp: Some(now()),
            preview: MatchPreview::Diff(Content {
                content: "+// TODO\n".to_string(),
                ranges: vec![Range { start: 4, end: 8 }],
            }),
        }];
        monitors
            .record_trigger_results(job_id, "TODO type:diff", &results)
            .await?;

        let webhook = monitors.monitor(monitor_id).await?.actions[1].reference();
        let context = monitors.action_context(job_id, webhook).await?;
        assert_eq!(context.monitor.id, monitor_id);
        assert_eq!(context.action.reference(), webhook);
        assert_eq!(context.results, results);

        let job = triggers.get(job_id).await?.expect("row exists");
        assert_eq!(job.query_string.as_deref(), Some("TODO type:diff"));
        assert_eq!(job.result_count(), 1);

        assert!(matches!(
            monitors.action_context(job_id, ActionRef::Webhook(-1)).await,
            Err(Error::ActionNotFound(_))
        ));

        Ok(())
    }
}
