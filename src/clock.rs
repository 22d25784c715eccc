//! Wall-clock abstraction.
//!
//! Every component that stamps or compares job timestamps reads time through
//! a [`Clock`], so tests can pin "now" with a [`ManualClock`] instead of
//! sleeping.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use jiff::{Span, Timestamp};

/// Source of the current time.
pub trait Clock: Debug + Send + Sync + 'static {
    /// Returns the current instant.
    fn now(&self) -> Timestamp;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    /// Creates a clock frozen at `now`.
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Moves the clock to `now`.
    pub fn set(&self, now: Timestamp) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = now;
    }

    /// Moves the clock forward by `span`.
    ///
    /// # Errors
    ///
    /// Returns an error when the result overflows or `span` carries units
    /// of days or larger.
    pub fn advance(&self, span: Span) -> Result<Timestamp, jiff::Error> {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = now.checked_add(span)?;
        Ok(*now)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
