//! Monitors and their actions.
//!
//! A [`Monitor`] is a saved query plus the [`Action`]s to notify when the
//! query produces new results. Monitors are created and edited elsewhere;
//! the engine only reads them, advances their schedule, and records what
//! each run found, all through a [`MonitorStore`].

use std::{fmt, future::Future, str::FromStr};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::{
    job::{ActionRef, JobId},
    search::Match,
};
pub use self::{memory::MemoryMonitorStore, postgres::PgMonitorStore};

mod memory;
mod postgres;

/// Monitor identifier.
pub type MonitorId = i64;

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// Monitor store errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `serde_json` crate when encoding results.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The monitor doesn't exist.
    #[error("Monitor with ID {0} not found.")]
    MonitorNotFound(MonitorId),

    /// The trigger job doesn't exist.
    #[error("Trigger job with ID {0} not found.")]
    TriggerJobNotFound(JobId),

    /// The action doesn't exist or belongs to another monitor.
    #[error("{} action with ID {} not found.", .0.channel(), .0.action_id())]
    ActionNotFound(ActionRef),

    /// A stored email priority isn't recognized.
    #[error("Unknown email priority `{0}`.")]
    UnknownPriority(String),
}

/// Urgency of an email notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Regular notification.
    #[default]
    Normal,

    /// Highlighted in the subject line.
    Critical,
}

impl Priority {
    /// Lower-case name as stored.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Self::Normal),
            "critical" => Ok(Self::Critical),
            other => Err(Error::UnknownPriority(other.to_string())),
        }
    }
}

/// Email action settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailConfig {
    /// Action ID.
    pub id: i64,

    /// Addresses the notification is sent to.
    pub recipients: Vec<String>,

    /// Notification priority.
    pub priority: Priority,
}

/// Generic webhook action settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    /// Action ID.
    pub id: i64,

    /// Endpoint the payload is posted to.
    pub url: String,
}

/// Slack incoming-webhook action settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackConfig {
    /// Action ID.
    pub id: i64,

    /// Slack incoming-webhook URL.
    pub url: String,
}

/// Channel-specific part of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    /// Notify by email.
    Email(EmailConfig),

    /// Post a JSON payload to an arbitrary endpoint.
    Webhook(WebhookConfig),

    /// Post Block Kit sections to Slack.
    Slack(SlackConfig),
}

/// A notification configured on a monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Disabled actions are skipped when fanning out.
    pub enabled: bool,

    /// Whether notifications embed result previews.
    pub include_results: bool,

    /// Channel and its settings.
    pub kind: ActionKind,
}

impl Action {
    /// Reference stored on the action jobs created for this action.
    pub fn reference(&self) -> ActionRef {
        match &self.kind {
            ActionKind::Email(email) => ActionRef::Email(email.id),
            ActionKind::Webhook(webhook) => ActionRef::Webhook(webhook.id),
            ActionKind::Slack(slack) => ActionRef::SlackWebhook(slack.id),
        }
    }
}

/// A saved query and its notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    /// Monitor ID.
    pub id: MonitorId,

    /// User the query runs as.
    pub owner_id: i64,

    /// Display name of the owner, used in notifications.
    pub owner_name: String,

    /// Human description, used in notifications.
    pub description: String,

    /// The saved query.
    pub query: String,

    /// Disabled monitors are never scheduled.
    pub enabled: bool,

    /// When the query should run next; `None` means as soon as possible.
    pub next_run: Option<Timestamp>,

    /// Newest result timestamp seen by a previous run.
    pub latest_result: Option<Timestamp>,

    /// Configured actions.
    pub actions: Vec<Action>,
}

impl Monitor {
    /// Iterates over the actions that should be notified.
    pub fn enabled_actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|action| action.enabled)
    }

    /// Returns `true` when the monitor should run at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.enabled && self.next_run.map_or(true, |next_run| next_run <= now)
    }
}

/// Everything needed to deliver one action job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionContext {
    /// The monitor the action belongs to.
    pub monitor: Monitor,

    /// The action being delivered.
    pub action: Action,

    /// Results recorded by the trigger run.
    pub results: Vec<Match>,
}

/// Read and schedule access to monitors.
pub trait MonitorStore: Send + Sync + 'static {
    /// Enabled monitors whose next run is due and which have no trigger job
    /// waiting or in flight, ordered by ID.
    fn due_monitors(&self, now: Timestamp) -> impl Future<Output = Result<Vec<MonitorId>>> + Send;

    /// Loads a monitor with all of its actions.
    fn monitor(&self, id: MonitorId) -> impl Future<Output = Result<Monitor>> + Send;

    /// Records when the monitor runs next and the newest result seen so far.
    fn set_trigger_schedule(
        &self,
        id: MonitorId,
        next_run: Timestamp,
        latest_result: Option<Timestamp>,
    ) -> impl Future<Output = Result> + Send;

    /// Stores the executed query and its results on a trigger job.
    fn record_trigger_results(
        &self,
        trigger_job_id: JobId,
        query_string: &str,
        results: &[Match],
    ) -> impl Future<Output = Result> + Send;

    /// Loads a consistent view of a trigger run and one of its monitor's
    /// actions.
    ///
    /// The reads share one read-only snapshot, so sibling action jobs of the
    /// same run never see each other's edits half applied. The snapshot ends
    /// before delivery: the job's terminal write happens later through its
    /// [`WorkQueueStore`](crate::WorkQueueStore), guarded by the worker's
    /// claim on the row rather than by this transaction.
    fn action_context(
        &self,
        trigger_job_id: JobId,
        action: ActionRef,
    ) -> impl Future<Output = Result<ActionContext>> + Send;

    /// Clears the monitor's schedule so its next enqueuer pass runs it.
    fn reset_trigger_timestamps(&self, id: MonitorId) -> impl Future<Output = Result> + Send;
}
