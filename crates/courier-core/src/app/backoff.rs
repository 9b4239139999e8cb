//! Reconnect backoff: decides the delay before each dial attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::duration_ms;

/// Exponential backoff policy for reconnecting.
///
/// delay(n) = min(base * 2^(n-1), max), retried forever.
///
/// With the defaults (base=1s, max=30s):
/// - attempt 1: 1s
/// - attempt 2: 2s
/// - attempt 3: 4s
/// - attempt 4: 8s
/// - attempt 5: 16s
/// - attempt 6+: 30s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(with = "duration_ms", rename = "base_ms")]
    pub base: Duration,

    #[serde(with = "duration_ms", rename = "max_ms")]
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Stateful iterator over a policy's delays. One per reconnect loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

/// Floor for every delay, so a zero policy never spins the dial loop.
const MIN_DELAY: Duration = Duration::from_millis(1);

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: Self::first_delay(policy),
        }
    }

    fn first_delay(policy: BackoffPolicy) -> Duration {
        policy.base.min(policy.max).max(MIN_DELAY)
    }

    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let doubled = self.current.checked_mul(2).unwrap_or(self.policy.max);
        self.current = doubled.min(self.policy.max).max(MIN_DELAY);
        delay
    }

    pub fn reset(&mut self) {
        self.current = Self::first_delay(self.policy);
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}
