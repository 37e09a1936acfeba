//! Exponential backoff with full jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff policy for retrying transient failures.
///
/// The delay before attempt `n` (1-based) is drawn uniformly from
/// `[0, min(max_delay, base * 2^(n-1))]` - full jitter, so independent
/// retriers hitting the same resource spread out instead of thundering.
///
/// Non-transient failures must not be retried through this policy; the
/// caller checks [`crate::error::FailureKind::is_retryable`] first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Initial delay for the first retry.
    #[serde(default = "default_base")]
    #[serde(with = "humantime_serde")]
    pub base: Duration,

    /// Cap on the exponential delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Total attempts (first call included) before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

const fn default_base() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

const fn default_max_attempts() -> u32 {
    3
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: default_base(),
            max_delay: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BackoffPolicy {
    /// Whether another attempt is allowed after `attempt` failures.
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Upper bound of the delay window for a given attempt (1-based).
    #[must_use]
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2_u32.saturating_pow(exponent);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Sample the jittered delay before the given attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempt);
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        let nanos = rand::thread_rng().gen_range(0..=ceiling.as_nanos());
        // gen_range bound came from a Duration, so the cast back is lossless.
        #[allow(clippy::cast_possible_truncation)]
        Duration::from_nanos(nanos as u64)
    }
}
