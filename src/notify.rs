//! Notification channel builders.
//!
//! Every channel turns an [`ActionArgs`] into a payload with a pure builder
//! function and delivers it with a separate `send` step, so payloads can be
//! checked without a live transport:
//!
//! - [`email`] renders subject, text, and HTML bodies and hands them to a
//!   [`Mailer`](email::Mailer).
//! - [`slack`] builds Block Kit sections and posts them to an incoming
//!   webhook.
//! - [`webhook`] posts a flat JSON document to an arbitrary URL.
//!
//! All of them truncate results first; see [`truncate_results`] and
//! [`truncate_content`].

use reqwest::StatusCode;
use serde::Serialize;
use url::Url;

use crate::{job::JobId, monitor::MonitorId, search::Match};

pub mod email;
pub mod slack;
mod truncate;
pub mod webhook;

pub use self::truncate::{pluralize, truncate_content, truncate_results, Truncated};
use self::truncate::kept_prefix;

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// Notification errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The receiving end answered with something other than `200 OK`.
    #[error(transparent)]
    StatusCode(#[from] StatusCodeError),

    /// Error returned by the HTTP client.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Error returned while rendering an email template.
    #[error(transparent)]
    Template(#[from] minijinja::Error),

    /// Error returned from the `serde_json` crate.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A link couldn't be built from the external URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// The Slack webhook URL doesn't point at Slack.
    #[error("Slack webhook URL must begin with 'https://hooks.slack.com/': {0}")]
    InvalidSlackUrl(String),

    /// The configured reply address isn't of the form `local@domain`.
    #[error("Invalid reply address: {0}")]
    InvalidReplyAddress(String),

    /// The reply signing key was rejected.
    #[error("Invalid reply secret")]
    InvalidReplySecret,

    /// The mail transport failed to deliver a message.
    #[error("Mail delivery failed: {0}")]
    Mail(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A non-200 response from a webhook endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unexpected response status {status}: {body}")]
pub struct StatusCodeError {
    /// Numeric status code.
    pub code: u16,

    /// Status line, e.g. `500 Internal Server Error`.
    pub status: String,

    /// Response body, verbatim.
    pub body: String,
}

/// Everything a channel builder needs to know about a monitor run.
///
/// Built fresh for every action job from the monitor and its trigger job.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionArgs {
    /// The monitor's description.
    pub monitor_description: String,

    /// ID of the monitor.
    pub monitor_id: MonitorId,

    /// ID of the trigger job whose results are being delivered.
    pub trigger_job_id: JobId,

    /// The monitor's saved query.
    pub query: String,

    /// Display name of the monitor's owner.
    pub monitor_owner_name: String,

    /// Base URL links are resolved against.
    pub external_url: Url,

    /// `utm_source` attached to outbound links.
    pub utm_source: &'static str,

    /// Whether result contents may be included in the payload.
    pub include_results: bool,

    /// Search results of the trigger run.
    pub results: Vec<Match>,
}

/// Parses `external_url` into a base links can be joined onto.
///
/// A trailing slash is added so relative links extend the path instead of
/// replacing its last segment.
pub fn external_base(external_url: &str) -> Result<Url> {
    let mut url = Url::parse(external_url)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Link to the search results of `query`.
pub fn search_url(base: &Url, query: &str, utm_source: &str) -> Result<Url> {
    let mut url = base.join("search")?;
    url.query_pairs_mut()
        .append_pair("q", query)
        .append_pair("utm_source", utm_source);
    Ok(url)
}

/// Link to the monitor's edit page.
pub fn monitor_url(base: &Url, monitor_id: MonitorId, utm_source: &str) -> Result<Url> {
    let mut url = base.join(&format!("code-monitoring/{monitor_id}"))?;
    url.query_pairs_mut().append_pair("utm_source", utm_source);
    Ok(url)
}

/// Link to the commit a result was found in.
pub fn commit_url(base: &Url, result: &Match) -> Result<Url> {
    Ok(base.join(&format!("{}/-/commit/{}", result.repository, result.commit))?)
}

/// Posts `payload` as JSON and treats anything but `200 OK` as an error.
/// Recorded as the body of an error response that couldn't be read.
pub const UNREADABLE_BODY: &str = "<unreadable body>";

pub(crate) async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    payload: &T,
) -> Result {
    let response = client.post(url).json(payload).send().await?;

    let status = response.status();
    if status != StatusCode::OK {
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(%err, %status, "Failed to read error response body");
                UNREADABLE_BODY.to_string()
            }
        };
        return Err(StatusCodeError {
            code: status.as_u16(),
            status: status.to_string(),
            body,
        }
        .into());
    }

    Ok(())
}
