//! Search boundary.
//!
//! Executing a saved query is somebody else's job. The engine only needs a
//! [`Searcher`] that runs a query on behalf of a user and returns the
//! matching commits and diffs as [`Match`]es.

use std::future::Future;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::monitor::MonitorId;

/// Search errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The search backend rejected or failed to execute the query.
    #[error("Search failed: {0}")]
    Failed(String),

    /// Any other error raised by a search backend.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Identity a search runs as.
///
/// Monitors always search as their owner so results respect the owner's
/// repository permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    /// ID of the user the search runs as.
    pub user_id: i64,
}

/// A byte range within a preview's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// Offset of the first matched byte.
    pub start: usize,

    /// Offset one past the last matched byte.
    pub end: usize,
}

/// Text of a preview along with the spans that matched the query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Content {
    /// The preview text.
    pub content: String,

    /// Matched spans within `content`.
    pub ranges: Vec<Range>,
}

/// What part of a commit matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchPreview {
    /// The commit message matched.
    Message(Content),

    /// The commit's diff matched.
    Diff(Content),
}

impl MatchPreview {
    /// Returns the preview's content regardless of kind.
    pub fn content(&self) -> &Content {
        match self {
            Self::Message(content) | Self::Diff(content) => content,
        }
    }

    /// Label used when rendering the preview, e.g. "Diff match".
    pub fn label(&self) -> &'static str {
        match self {
            Self::Message(_) => "Message",
            Self::Diff(_) => "Diff",
        }
    }
}

/// A single commit or diff search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    /// Repository name, e.g. `github.com/sourcegraph/sourcegraph`.
    pub repository: String,

    /// Full commit ID.
    pub commit: String,

    /// Author date of the commit, when known.
    pub timestamp: Option<Timestamp>,

    /// The matched text.
    pub preview: MatchPreview,
}

impl Match {
    /// Returns the first seven characters of the commit ID.
    pub fn short_commit(&self) -> &str {
        self.commit.get(..7).unwrap_or(&self.commit)
    }
}

/// Executes saved queries.
pub trait Searcher: Send + Sync + 'static {
    /// Runs `query` as `actor` for the given monitor.
    fn search(
        &self,
        actor: Actor,
        query: &str,
        monitor_id: MonitorId,
    ) -> impl Future<Output = Result<Vec<Match>, Error>> + Send;
}
