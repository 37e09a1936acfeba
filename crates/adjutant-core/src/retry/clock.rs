//! Clock abstraction for deterministic testing of time-dependent code.

use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Trait for clock implementations.
///
/// Backoff, breaker, bucket, scheduler, expiry checks, and the ledger all
/// read time through this trait so tests can advance it deterministically.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current civil date, used for daily ledger rotation.
    ///
    /// The default derives it from [`Clock::now`] in UTC; the system clock
    /// overrides this with the local date so rotation happens at local
    /// midnight.
    fn today(&self) -> chrono::NaiveDate {
        self.now().date_naive()
    }
}

/// System clock that uses the real system time.
///
/// This is the default clock for production use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> chrono::NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// Manually-advanced clock for tests.
///
/// Starts at the given instant and only moves when [`FixedClock::advance`]
/// is called, so time-driven behaviour (expiry, refill, cooldown) can be
/// exercised without sleeping.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// Create a clock pinned to the given instant.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advance the clock by the given duration.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned or the duration does not fit
    /// in a `chrono::Duration` (test-only type, both indicate a broken test).
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += chrono::Duration::from_std(by).expect("duration out of range");
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_advances() {
        let start = Utc::now();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }
}
