//! Injectable wall clock
//!
//! Every expiry decision in kbroker reads time through a [`Clock`] so that
//! caches, nonces and rotation schedules can be driven deterministically in
//! tests. All times are UTC.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Source of the current UTC time
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in UTC
    fn now(&self) -> DateTime<Utc>;
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// The operating system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared handle to the system clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// A clock that only moves when told to
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

#[cfg(any(test, feature = "test-util"))]
impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: parking_lot::Mutex::new(start),
        })
    }

    /// Create a clock frozen at the given Unix timestamp
    ///
    /// # Panics
    ///
    /// Panics if `secs` is outside chrono's representable range.
    pub fn at_timestamp(secs: i64) -> Arc<Self> {
        Self::new(DateTime::from_timestamp(secs, 0).expect("timestamp in range"))
    }

    /// Move the clock forward
    ///
    /// # Panics
    ///
    /// Panics if `by` does not fit into a chrono duration.
    pub fn advance(&self, by: std::time::Duration) {
        let by = chrono::Duration::from_std(by).expect("duration in range");
        *self.now.lock() += by;
    }

    /// Jump to an absolute time
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
