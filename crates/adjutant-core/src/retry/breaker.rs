//! Circuit breaker for external resource calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::clock::Clock;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Resource is known bad; calls are rejected until the cooldown passes.
    Open,
    /// Cooldown elapsed; the next call probes the resource.
    HalfOpen,
}

/// Per-resource circuit breaker.
///
/// Counts consecutive failures; at the threshold the breaker opens and
/// rejects calls for the cooldown period. The first call after the cooldown
/// runs in half-open state: success closes the breaker, failure re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    half_open: bool,
}

impl CircuitBreaker {
    /// Create a breaker for the named resource.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        threshold: u32,
        cooldown: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            clock,
            consecutive_failures: 0,
            opened_at: None,
            half_open: false,
        }
    }

    /// Current state, accounting for an elapsed cooldown.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        if self.half_open {
            return BreakerState::HalfOpen;
        }
        match self.opened_at {
            None => BreakerState::Closed,
            Some(opened) => {
                let elapsed = self.clock.now().signed_duration_since(opened);
                if elapsed >= chrono::Duration::from_std(self.cooldown).unwrap_or_default() {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            },
        }
    }

    /// Whether a call may proceed. Transitions to half-open when the
    /// cooldown has elapsed.
    pub fn can_proceed(&mut self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if !self.half_open {
                    info!(breaker = %self.name, "circuit half-open, probing");
                    self.half_open = true;
                }
                true
            },
        }
    }

    /// Record a successful call, closing the breaker.
    pub fn record_success(&mut self) {
        if self.opened_at.is_some() || self.half_open {
            info!(breaker = %self.name, "circuit closed, resource recovered");
        }
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open = false;
    }

    /// Record a failed call; opens the breaker at the threshold.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.half_open || self.consecutive_failures >= self.threshold {
            if self.opened_at.is_none() || self.half_open {
                warn!(
                    breaker = %self.name,
                    failures = self.consecutive_failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    "circuit open"
                );
            }
            self.opened_at = Some(self.clock.now());
            self.half_open = false;
        }
    }

    /// Resource name this breaker guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FixedClock;

    fn breaker(clock: Arc<FixedClock>) -> CircuitBreaker {
        CircuitBreaker::new("mail", 3, Duration::from_secs(60), clock)
    }

    #[test]
    fn test_opens_at_threshold() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let mut cb = breaker(clock);

        assert!(cb.can_proceed());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.can_proceed());
    }

    #[test]
    fn test_half_open_after_cooldown_then_close() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let mut cb = breaker(Arc::clone(&clock));
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(!cb.can_proceed());

        clock.advance(Duration::from_secs(61));
        assert!(cb.can_proceed());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let mut cb = breaker(Arc::clone(&clock));
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(61));
        assert!(cb.can_proceed());

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.can_proceed());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let mut cb = breaker(clock);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
