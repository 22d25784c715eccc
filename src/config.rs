//! Engine configuration.
//!
//! A [`Config`] is built once by the embedding service, usually by
//! deserializing it from whatever format that service already uses, and is
//! then handed to [`Engine::new`](crate::Engine::new). Components never read
//! configuration from anywhere else.
//!
//! Durations are [`jiff::Span`]s and serialize as ISO 8601 durations:
//!
//! ```rust
//! use codemonitor::Config;
//!
//! let config: Config = serde_json::from_str(
//!     r#"{
//!         "external_url": "https://sourcegraph.example.com",
//!         "trigger": { "handlers": 8, "poll_interval": "PT2S" }
//!     }"#,
//! )?;
//!
//! assert_eq!(config.trigger.handlers, 8);
//! // Unspecified fields fall back to their defaults.
//! assert_eq!(config.action.handlers, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration as StdDuration;

use jiff::{Span, ToSpan};
use serde::{Deserialize, Serialize};

use crate::store::StoreOptions;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value is outside of its allowed range.
    #[error("Invalid configuration for `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// Error returned by the `jiff` crate while converting spans.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Base URL used to build links in notifications.
    pub external_url: String,

    /// Trigger job pool and store settings.
    pub trigger: QueueConfig,

    /// Action job pool and store settings.
    pub action: QueueConfig,

    /// How long to wait before re-running a monitor's query.
    pub trigger_interval: Span,

    /// Period of the enqueuer scan.
    pub enqueue_interval: Span,

    /// Period of both resetters.
    pub reset_interval: Span,

    /// Period of the log retention sweeper.
    pub sweep_interval: Span,

    /// Finished jobs older than this are deleted by the sweeper.
    pub retention: Span,

    /// Payload construction limits and reply settings.
    pub notify: NotifyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            external_url: "http://localhost:3080".to_string(),
            trigger: QueueConfig {
                handlers: 4,
                ..QueueConfig::default()
            },
            action: QueueConfig::default(),
            trigger_interval: 5.minutes(),
            enqueue_interval: 1.minute(),
            reset_interval: 1.minute(),
            sweep_interval: 60.minutes(),
            retention: (30 * 24).hours(),
            notify: NotifyConfig::default(),
        }
    }
}

impl Config {
    /// Checks that the configuration describes a runnable engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] when a pool has no handlers, a
    /// notification limit is zero, or the heartbeat interval isn't shorter
    /// than the stall age (which would let resetters reclaim live jobs).
    pub fn validate(&self) -> Result<(), Error> {
        if url::Url::parse(&self.external_url).is_err() {
            return Err(Error::Invalid {
                field: "external_url",
                reason: format!("`{}` is not an absolute URL", self.external_url),
            });
        }

        self.trigger.validate("trigger")?;
        self.action.validate("action")?;

        if self.notify.max_results == 0 {
            return Err(Error::Invalid {
                field: "notify.max_results",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.notify.max_content_lines < 2 {
            return Err(Error::Invalid {
                field: "notify.max_content_lines",
                reason: "must leave room for a line and the truncation marker".to_string(),
            });
        }

        Ok(())
    }
}

/// Settings shared by both job kinds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrently running handlers.
    pub handlers: usize,

    /// Sleep between polls when no job is available.
    pub poll_interval: Span,

    /// How often a running handler refreshes its heartbeat.
    pub heartbeat_interval: Span,

    /// Deadline applied to every handler invocation.
    pub max_runtime: Span,

    /// Retry and reset policy of the backing store.
    pub store: StoreOptions,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            handlers: 1,
            poll_interval: 5.seconds(),
            heartbeat_interval: 1.second(),
            max_runtime: 60.seconds(),
            store: StoreOptions::default(),
        }
    }
}

impl QueueConfig {
    fn validate(&self, prefix: &'static str) -> Result<(), Error> {
        if self.handlers == 0 {
            return Err(Error::Invalid {
                field: prefix,
                reason: "at least one handler is required".to_string(),
            });
        }

        let heartbeat = StdDuration::try_from(self.heartbeat_interval)?;
        let stalled = StdDuration::try_from(self.store.stalled_max_age)?;
        if heartbeat.is_zero() || heartbeat >= stalled {
            return Err(Error::Invalid {
                field: prefix,
                reason: format!(
                    "heartbeat interval ({heartbeat:?}) must be non-zero and shorter than the \
                     stalled max age ({stalled:?})"
                ),
            });
        }

        if StdDuration::try_from(self.poll_interval)?.is_zero() {
            return Err(Error::Invalid {
                field: prefix,
                reason: "poll interval must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Limits applied when turning search results into notifications.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Results counted into a notification; the rest are reported as
    /// "N more".
    pub max_results: usize,

    /// Results rendered into an email body.
    ///
    /// Kept separate from `max_results`: the email shows fewer results than
    /// it counts.
    pub max_display_results: usize,

    /// Line budget for a single result preview, marker included.
    pub max_content_lines: usize,

    /// Byte budget for a single result preview.
    pub max_content_bytes: usize,

    /// Reply-capable mailbox. Email threading headers and reply tokens are
    /// only produced when set.
    pub reply: Option<ReplyConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_results: 5,
            max_display_results: 3,
            max_content_lines: 10,
            max_content_bytes: 2500,
            reply: None,
        }
    }
}

/// A mailbox able to receive replies to monitor emails.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplyConfig {
    /// Address of the mailbox, e.g. `monitors@example.com`.
    pub address: String,

    /// Key used to sign reply tokens.
    pub secret: String,
}
