//! Time source
//!
//! Every timestamp the subsystem writes comes from a [`Clock`] so tests and
//! the simulator can drive time explicitly.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;

/// Largest second count `chrono::Duration::seconds` accepts
const MAX_CHRONO_SECS: i64 = i64::MAX / 1_000;

/// Wall-clock source
pub trait Clock: Send + Sync + Debug {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at `at`
    #[inline]
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// Jump to `at`
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    /// Move forward by `by`
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Seconds as a chrono duration, saturating instead of panicking
#[must_use]
pub(crate) fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(MAX_CHRONO_SECS).min(MAX_CHRONO_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_on_request() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::minutes(3));
        assert_eq!(clock.now(), start + chrono::Duration::minutes(3));
    }

    #[test]
    fn chrono_secs_saturates() {
        assert_eq!(chrono_secs(90), chrono::Duration::seconds(90));
        assert_eq!(chrono_secs(u64::MAX), chrono::Duration::seconds(MAX_CHRONO_SECS));
    }
}
