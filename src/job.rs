//! Job rows managed by the work queues.
//!
//! There are exactly two kinds of job:
//!
//! - a [`TriggerJob`] is one scheduled execution of a monitor's query, and
//! - an [`ActionJob`] is one notification dispatch for one of the monitor's
//!   actions, tied to the trigger job whose results it delivers.
//!
//! Both carry the same [`Lifecycle`], which is everything a
//! [`WorkQueueStore`](crate::store::WorkQueueStore) needs to claim, heartbeat,
//! retry, and reset a row. The [`Job`] trait ties the two together so the
//! store and worker machinery is written once.
//!
//! # States
//!
//! ```text
//!            dequeue             mark_complete
//!  queued ─────────────▶ processing ─────────────▶ completed
//!    ▲                   │      │
//!    │ reset_stalled     │      │ mark_errored (retries left)
//!    └───────────────────┘      ▼
//!                              errored ──(after backoff, dequeue)──▶ processing
//!                               │
//!     mark_failed, retries or   ▼
//!     resets exhausted ───────▶ failed
//! ```

use std::fmt;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{monitor::MonitorId, search::Match};

/// Job identifiers are monotonic per table.
pub type JobId = i64;

/// Represents the possible states of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "codemonitor.job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed.
    Queued,

    /// Claimed by a handler, which proves liveness through heartbeats.
    Processing,

    /// Handled successfully.
    Completed,

    /// Handling failed; the job will be retried once its backoff elapses.
    Errored,

    /// Handling failed and will not be retried.
    Failed,
}

impl JobState {
    /// Returns `true` for states that are never left again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns `true` for rows that will still be claimed.
    ///
    /// Errored rows count: `mark_errored` moves a row to `failed` once its
    /// retries run out, so an errored row is always waiting for a retry.
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Processing | Self::Errored)
    }

    /// Public status shown for the run this job represents.
    pub const fn event_status(self) -> EventStatus {
        match self {
            Self::Completed => EventStatus::Success,
            Self::Queued | Self::Processing => EventStatus::Pending,
            Self::Errored | Self::Failed => EventStatus::Error,
        }
    }

    /// Lower-case name, matching the database enum label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing status of a trigger or action event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// The run succeeded.
    Success,

    /// The run hasn't finished yet.
    Pending,

    /// The run errored, possibly terminally.
    Error,
}

/// Discriminates the two job tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// See [`TriggerJob`].
    Trigger,

    /// See [`ActionJob`].
    Action,
}

impl JobKind {
    /// Short name used in logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Action => "action",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping columns shared by every job row.
#[derive(Debug, Clone, PartialEq)]
pub struct Lifecycle {
    /// Current state.
    pub state: JobState,

    /// Message of the most recent failure, if any.
    pub failure_message: Option<String>,

    /// Worker that last claimed the row.
    pub worker_id: Option<Uuid>,

    /// How many times the row was reclaimed from a stalled handler.
    pub num_resets: i32,

    /// How many times handling errored.
    pub num_failures: i32,

    /// When the row was inserted.
    pub queued_at: Timestamp,

    /// When the current (or last) attempt was claimed.
    pub started_at: Option<Timestamp>,

    /// When the row last left `processing` through a mark operation.
    pub finished_at: Option<Timestamp>,

    /// Most recent proof of liveness from the claiming handler.
    pub last_heartbeat_at: Option<Timestamp>,

    /// Row is not eligible for claiming before this instant.
    pub process_after: Option<Timestamp>,
}

impl Lifecycle {
    /// Lifecycle of a freshly enqueued row.
    pub fn queued(now: Timestamp) -> Self {
        Self {
            state: JobState::Queued,
            failure_message: None,
            worker_id: None,
            num_resets: 0,
            num_failures: 0,
            queued_at: now,
            started_at: None,
            finished_at: None,
            last_heartbeat_at: None,
            process_after: None,
        }
    }

    /// Whether a claim at `now` may pick this row up, given the store's
    /// retry ceiling.
    pub fn is_claimable(&self, now: Timestamp, max_num_retries: i32) -> bool {
        let ready = self.process_after.map_or(true, |after| after <= now);
        match self.state {
            JobState::Queued => ready,
            JobState::Errored => ready && self.num_failures < max_num_retries,
            _ => false,
        }
    }
}

/// A row type managed by a work queue.
pub trait Job: fmt::Debug + Clone + Send + Sync + Unpin + 'static {
    /// Which table this job lives in.
    const KIND: JobKind;

    /// Data required to enqueue a new job of this kind.
    type Spec: Clone + Send + Sync + 'static;

    /// Returns the row's ID.
    fn id(&self) -> JobId;

    /// Returns the row's lifecycle columns.
    fn lifecycle(&self) -> &Lifecycle;

    /// Returns the row's lifecycle columns mutably.
    fn lifecycle_mut(&mut self) -> &mut Lifecycle;

    /// Builds a row from an enqueue request.
    fn from_spec(id: JobId, spec: Self::Spec, lifecycle: Lifecycle) -> Self;

    /// Returns `true` when this existing row must prevent `spec` from being
    /// enqueued.
    fn blocks(&self, _spec: &Self::Spec) -> bool {
        false
    }
}

/// One scheduled execution of a monitor's query.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerJob {
    /// Row ID.
    pub id: JobId,

    /// Monitor whose query this job runs.
    pub monitor_id: MonitorId,

    /// The query that was actually executed, recorded for audit.
    pub query_string: Option<String>,

    /// Results of the run, once it completed.
    pub results: Option<Vec<Match>>,

    /// Lifecycle columns.
    pub lifecycle: Lifecycle,
}

impl TriggerJob {
    /// Number of results recorded for this run.
    pub fn result_count(&self) -> usize {
        self.results.as_ref().map_or(0, Vec::len)
    }
}

/// Enqueue request for a [`TriggerJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSpec {
    /// Monitor to run.
    pub monitor_id: MonitorId,
}

impl Job for TriggerJob {
    const KIND: JobKind = JobKind::Trigger;

    type Spec = TriggerSpec;

    fn id(&self) -> JobId {
        self.id
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn from_spec(id: JobId, TriggerSpec { monitor_id }: TriggerSpec, lifecycle: Lifecycle) -> Self {
        Self {
            id,
            monitor_id,
            query_string: None,
            results: None,
            lifecycle,
        }
    }

    // A monitor never has two runs waiting, retrying, or in flight at once.
    fn blocks(&self, spec: &TriggerSpec) -> bool {
        self.monitor_id == spec.monitor_id && self.lifecycle.state.is_in_flight()
    }
}

/// Reference to exactly one configured action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionRef {
    /// An email action.
    Email(i64),

    /// A generic webhook action.
    Webhook(i64),

    /// A Slack incoming-webhook action.
    SlackWebhook(i64),
}

impl ActionRef {
    /// Channel name used to label delivery errors.
    pub const fn channel(self) -> &'static str {
        match self {
            Self::Email(_) => "Email",
            Self::Webhook(_) => "Webhook",
            Self::SlackWebhook(_) => "SlackWebhook",
        }
    }

    /// ID of the referenced action within its channel's table.
    pub const fn action_id(self) -> i64 {
        match self {
            Self::Email(id) | Self::Webhook(id) | Self::SlackWebhook(id) => id,
        }
    }
}

/// Channel columns as stored on an action job row.
///
/// Writes always go through [`ActionRef`], so a well-formed row has exactly
/// one column set; [`ActionChannel::resolve`] re-establishes that on read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionChannel {
    /// Set for email actions.
    pub email_id: Option<i64>,

    /// Set for webhook actions.
    pub webhook_id: Option<i64>,

    /// Set for Slack webhook actions.
    pub slack_webhook_id: Option<i64>,
}

/// An action job row didn't reference exactly one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Action job must reference exactly one of email, webhook, or slack webhook, found {found}.")]
pub struct InvalidChannel {
    /// How many channel columns were set.
    pub found: usize,
}

impl ActionChannel {
    /// Converts the stored columns back into an [`ActionRef`].
    ///
    /// # Errors
    ///
    /// Returns [`InvalidChannel`] when zero or several columns are set.
    pub fn resolve(self) -> Result<ActionRef, InvalidChannel> {
        match (self.email_id, self.webhook_id, self.slack_webhook_id) {
            (Some(id), None, None) => Ok(ActionRef::Email(id)),
            (None, Some(id), None) => Ok(ActionRef::Webhook(id)),
            (None, None, Some(id)) => Ok(ActionRef::SlackWebhook(id)),
            (email, webhook, slack) => Err(InvalidChannel {
                found: [email, webhook, slack].iter().flatten().count(),
            }),
        }
    }
}

impl From<ActionRef> for ActionChannel {
    fn from(action: ActionRef) -> Self {
        match action {
            ActionRef::Email(id) => Self {
                email_id: Some(id),
                ..Self::default()
            },
            ActionRef::Webhook(id) => Self {
                webhook_id: Some(id),
                ..Self::default()
            },
            ActionRef::SlackWebhook(id) => Self {
                slack_webhook_id: Some(id),
                ..Self::default()
            },
        }
    }
}

/// One notification dispatch for one action of a monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionJob {
    /// Row ID.
    pub id: JobId,

    /// Trigger run whose results are delivered.
    pub trigger_job_id: JobId,

    /// Action to deliver through.
    pub channel: ActionChannel,

    /// Lifecycle columns.
    pub lifecycle: Lifecycle,
}

/// Enqueue request for an [`ActionJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSpec {
    /// Trigger run to deliver.
    pub trigger_job_id: JobId,

    /// Action to deliver through.
    pub action: ActionRef,
}

impl Job for ActionJob {
    const KIND: JobKind = JobKind::Action;

    type Spec = ActionSpec;

    fn id(&self) -> JobId {
        self.id
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn from_spec(
        id: JobId,
        ActionSpec {
            trigger_job_id,
            action,
        }: ActionSpec,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            id,
            trigger_job_id,
            channel: action.into(),
            lifecycle,
        }
    }
}
