//! Prometheus counters.
//!
//! Counters are registered on a caller-supplied [`Registry`] so the
//! embedding service decides how, and whether, they're exposed.

use prometheus::{IntCounterVec, Opts, Registry};

use crate::job::JobKind;

/// Metric name prefix.
const PREFIX: &str = "codemonitor";

/// Counters shared by every engine component.
///
/// Cloning is cheap; clones update the same counters.
#[derive(Debug, Clone)]
pub struct Metrics {
    resets: IntCounterVec,
    reset_failures: IntCounterVec,
    reset_errors: IntCounterVec,
    handled: IntCounterVec,
    swept: IntCounterVec,
}

/// How a claimed job's handling ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Marked completed.
    Completed,

    /// Marked errored (or failed after its last retry).
    Errored,

    /// Marked failed by a fatal error.
    Failed,

    /// The handler panicked and the job was marked errored.
    Panicked,

    /// The handler ran past its deadline; the row is left for the resetter.
    TimedOut,

    /// The row was reset elsewhere while being handled.
    Lost,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Failed => "failed",
            Self::Panicked => "panicked",
            Self::TimedOut => "timed_out",
            Self::Lost => "lost",
        }
    }
}

impl Metrics {
    /// Creates the counters and registers them on `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a counter with the same name is already
    /// registered.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str, labels: &[&str]| {
            let counter =
                IntCounterVec::new(Opts::new(format!("{PREFIX}_{name}"), help), labels)?;
            registry.register(Box::new(counter.clone()))?;
            Ok::<_, prometheus::Error>(counter)
        };

        Ok(Self {
            resets: counter(
                "resets_total",
                "Stalled jobs returned to the queue",
                &["kind"],
            )?,
            reset_failures: counter(
                "reset_failures_total",
                "Stalled jobs failed after exhausting their resets",
                &["kind"],
            )?,
            reset_errors: counter(
                "reset_errors_total",
                "Errors encountered while resetting stalled jobs",
                &["kind"],
            )?,
            handled: counter(
                "handler_total",
                "Claimed jobs by handling outcome",
                &["kind", "outcome"],
            )?,
            swept: counter(
                "swept_total",
                "Finished jobs deleted by the retention sweeper",
                &["kind"],
            )?,
        })
    }

    pub(crate) fn record_resets(&self, kind: JobKind, reset: usize, failed: usize) {
        self.resets
            .with_label_values(&[kind.as_str()])
            .inc_by(reset as u64);
        self.reset_failures
            .with_label_values(&[kind.as_str()])
            .inc_by(failed as u64);
    }

    pub(crate) fn record_reset_error(&self, kind: JobKind) {
        self.reset_errors.with_label_values(&[kind.as_str()]).inc();
    }

    pub(crate) fn record_outcome(&self, kind: JobKind, outcome: Outcome) {
        self.handled
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .inc();
    }

    pub(crate) fn record_swept(&self, kind: JobKind, count: u64) {
        self.swept.with_label_values(&[kind.as_str()]).inc_by(count);
    }

    /// Number of jobs of `kind` that ended with `outcome`.
    pub fn handled(&self, kind: JobKind, outcome: Outcome) -> u64 {
        self.handled
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .get()
    }

    /// Number of stalled jobs of `kind` returned to the queue.
    pub fn resets(&self, kind: JobKind) -> u64 {
        self.resets.with_label_values(&[kind.as_str()]).get()
    }

    /// Number of stalled jobs of `kind` failed for good.
    pub fn reset_failures(&self, kind: JobKind) -> u64 {
        self.reset_failures.with_label_values(&[kind.as_str()]).get()
    }

    /// Number of errors while resetting jobs of `kind`.
    pub fn reset_errors(&self, kind: JobKind) -> u64 {
        self.reset_errors.with_label_values(&[kind.as_str()]).get()
    }

    /// Number of finished jobs of `kind` deleted by the sweeper.
    pub fn swept(&self, kind: JobKind) -> u64 {
        self.swept.with_label_values(&[kind.as_str()]).get()
    }
}
