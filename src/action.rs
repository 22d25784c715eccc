//! Action job handling.
//!
//! An [`ActionRunner`] loads the trigger run an action job refers to,
//! builds the [`ActionArgs`] for the job's channel, and delivers the
//! notification. Delivery errors are reported with the channel's name.

use std::sync::Arc;

use tracing::{info, instrument};
use url::Url;

use crate::{
    config::NotifyConfig,
    handler::{Error, Handler, Result},
    job::ActionJob,
    monitor::{self, ActionContext, ActionKind, MonitorStore},
    notify::{
        email::{self, Mailer},
        slack, webhook, ActionArgs,
    },
};

/// Handles [`ActionJob`]s.
#[derive(Debug)]
pub struct ActionRunner<M, E> {
    monitors: Arc<M>,
    mailer: Arc<E>,
    client: reqwest::Client,
    external_url: Url,
    limits: NotifyConfig,
}

impl<M, E> ActionRunner<M, E> {
    /// Creates a runner delivering email through `mailer` and webhooks
    /// through `client`, with links resolved against `external_url`.
    pub fn new(
        monitors: Arc<M>,
        mailer: Arc<E>,
        client: reqwest::Client,
        external_url: Url,
        limits: NotifyConfig,
    ) -> Self {
        Self {
            monitors,
            mailer,
            client,
            external_url,
            limits,
        }
    }

    fn action_args(&self, trigger_job_id: i64, context: ActionContext) -> ActionArgs {
        let ActionContext {
            monitor,
            action,
            results,
        } = context;

        ActionArgs {
            monitor_description: monitor.description,
            monitor_id: monitor.id,
            trigger_job_id,
            query: monitor.query,
            monitor_owner_name: monitor.owner_name,
            external_url: self.external_url.clone(),
            utm_source: match action.kind {
                ActionKind::Email(_) => email::UTM_SOURCE,
                ActionKind::Webhook(_) => webhook::UTM_SOURCE,
                ActionKind::Slack(_) => slack::UTM_SOURCE,
            },
            include_results: action.include_results,
            results,
        }
    }
}

impl<M, E> Handler<ActionJob> for ActionRunner<M, E>
where
    M: MonitorStore,
    E: Mailer,
{
    #[instrument(
        skip_all,
        fields(job.id = job.id, trigger.id = job.trigger_job_id, channel = tracing::field::Empty),
        err
    )]
    async fn handle(&self, job: ActionJob) -> Result {
        let action = job
            .channel
            .resolve()
            .map_err(|err| Error::Fatal(err.to_string()))?;
        let channel = action.channel();
        tracing::Span::current().record("channel", channel);

        let context = match self.monitors.action_context(job.trigger_job_id, action).await {
            Ok(context) => context,
            // The action was deleted after the job was enqueued.
            Err(err @ monitor::Error::ActionNotFound(_)) => {
                return Err(Error::Fatal(err.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let kind = context.action.kind.clone();
        let args = self.action_args(job.trigger_job_id, context);
        let delivered = match &kind {
            ActionKind::Email(config) => {
                email::send_email(
                    &*self.mailer,
                    &args,
                    &config.recipients,
                    config.priority,
                    &self.limits,
                )
                .await
            }
            ActionKind::Webhook(config) => {
                webhook::send_webhook_notification(&self.client, &config.url, &args, &self.limits)
                    .await
            }
            ActionKind::Slack(config) => {
                slack::send_slack_notification(&self.client, &config.url, &args, &self.limits)
                    .await
            }
        };
        delivered.map_err(|source| Error::Delivery { channel, source })?;

        info!(results = args.results.len(), "Delivered notification");

        Ok(())
    }
}
