//! Clock-aligned time periods
//!
//! A [`TimePeriod`] of length `L` splits the UTC timeline into windows that
//! start at multiples of `L` since the Unix epoch. Any two replicas that share
//! `L` and a synchronized clock compute the same boundaries without talking
//! to each other, which is what makes fleet-wide rotation possible.

use crate::error::PeriodError;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Fixed-length, epoch-aligned window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePeriod {
    length_secs: i64,
}

impl TimePeriod {
    /// Create a period of the given length
    ///
    /// # Errors
    ///
    /// Returns [`PeriodError::NonPositive`] for a zero length and
    /// [`PeriodError::FractionalSeconds`] when the length has a sub-second part.
    pub fn new(length: Duration) -> Result<Self, PeriodError> {
        if length.is_zero() {
            return Err(PeriodError::NonPositive);
        }
        if length.subsec_nanos() != 0 {
            return Err(PeriodError::FractionalSeconds(length));
        }
        let length_secs = i64::try_from(length.as_secs()).map_err(|_| PeriodError::NonPositive)?;
        Ok(Self { length_secs })
    }

    /// Period length
    pub fn length(&self) -> Duration {
        Duration::from_secs(self.length_secs as u64)
    }

    /// Start of the period containing `t`
    pub fn period_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = t.timestamp();
        let start = secs - secs.rem_euclid(self.length_secs);
        from_secs(start, t)
    }

    /// Start of the period after the one containing `t`
    pub fn next(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.period_start(t) + chrono::Duration::seconds(self.length_secs)
    }

    /// Start of the period before the one containing `t`
    pub fn prev(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.period_start(t) - chrono::Duration::seconds(self.length_secs)
    }
}

// Boundaries are whole seconds well inside chrono's range for any realistic
// `t`; fall back to `t` itself rather than panic on the extremes.
fn from_secs(secs: i64, fallback: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(fallback)
}
