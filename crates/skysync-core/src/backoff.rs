use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default initial backoff delay in milliseconds.
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;

/// Default ceiling for a single backoff delay.
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Default number of attempts, including the first one.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Exponential backoff curve: `initial_ms * 2^(attempt-1)`, capped at `max_ms`.
///
/// With `jitter` enabled the delay is drawn uniformly from `[delay/2, delay]`
/// so that many accounts retrying at once spread out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_ms: DEFAULT_MAX_BACKOFF_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// A policy with no delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_ms: 0,
            max_ms: 0,
            max_attempts,
            jitter: false,
        }
    }

    /// Upper bound of the delay before retry number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_ms);
        Duration::from_millis(ms)
    }

    /// Delay to wait after the given failed attempt, jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let ms = base.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(ms / 2..=ms);
        Duration::from_millis(jittered)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }
}
