//! Token-bucket rate limiter keyed by channel name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::clock::Clock;
use crate::config::ChannelLimit;

/// Token bucket with discrete refill.
///
/// The bucket starts full. Every full `interval` elapsed since the last
/// refill adds `refill` tokens (capped at `capacity`). Refill is discrete
/// rather than proportional so that an exhausted channel stays exhausted
/// until the interval boundary - an `email (10/hour)` channel that sends
/// ten messages admits the eleventh on the next hour tick, not six minutes
/// later.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill: u32,
    interval: Duration,
    tokens: u32,
    last_refill: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket.
    #[must_use]
    pub fn new(capacity: u32, refill: u32, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let last_refill = clock.now();
        Self {
            capacity,
            refill,
            interval,
            tokens: capacity,
            last_refill,
            clock,
        }
    }

    fn refill_elapsed(&mut self) {
        let interval = chrono::Duration::from_std(self.interval).unwrap_or_default();
        if interval.is_zero() {
            return;
        }
        let now = self.clock.now();
        let elapsed = now.signed_duration_since(self.last_refill);
        let intervals = elapsed.num_milliseconds() / interval.num_milliseconds().max(1);
        if intervals > 0 {
            let added = u32::try_from(intervals)
                .unwrap_or(u32::MAX)
                .saturating_mul(self.refill);
            self.tokens = self.tokens.saturating_add(added).min(self.capacity);
            self.last_refill += interval * i32::try_from(intervals).unwrap_or(i32::MAX);
        }
    }

    /// Consume one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill_elapsed();
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently available.
    pub fn available(&mut self) -> u32 {
        self.refill_elapsed();
        self.tokens
    }
}

/// Set of token buckets, one per configured channel.
///
/// Unconfigured channels are unlimited; the caller treats a missing bucket
/// as an allow.
#[derive(Debug)]
pub struct LimiterSet {
    buckets: HashMap<String, TokenBucket>,
}

impl LimiterSet {
    /// Build buckets from the configured channel limits.
    #[must_use]
    pub fn from_limits(limits: &[ChannelLimit], clock: &Arc<dyn Clock>) -> Self {
        let buckets = limits
            .iter()
            .map(|limit| {
                (
                    limit.name.clone(),
                    TokenBucket::new(
                        limit.capacity,
                        limit.capacity,
                        limit.per,
                        Arc::clone(clock),
                    ),
                )
            })
            .collect();
        Self { buckets }
    }

    /// Consume one token for the named channel.
    ///
    /// Returns `true` when the call may proceed (including for channels with
    /// no configured limit).
    pub fn try_acquire(&mut self, channel: &str) -> bool {
        match self.buckets.get_mut(channel) {
            None => true,
            Some(bucket) => {
                let allowed = bucket.try_acquire();
                if !allowed {
                    warn!(channel, "rate limit reached, action deferred");
                }
                allowed
            },
        }
    }
}
