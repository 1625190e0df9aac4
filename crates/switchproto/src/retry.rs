//! Retry policy for transient send failures.
//!
//! Exponential backoff capped at `backoff_max`, with uniform jitter in
//! `[0, backoff_base]` layered on top so a burst of failing sends to the
//! same endpoint does not retry in lockstep.

use rand::Rng;
use std::time::Duration;

/// Retry behavior for one logical operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts before giving up.
    pub max_retries: u32,
    /// Initial backoff between attempts.
    pub backoff_base: Duration,
    /// Maximum backoff between attempts (caps exponential growth).
    pub backoff_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Deterministic backoff for a given attempt number.
    ///
    /// attempt 1: backoff_base
    /// attempt 2: backoff_base * 2
    /// attempt n: min(backoff_base * 2^(n-1), backoff_max)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.backoff_base.saturating_mul(multiplier);
        std::cmp::min(delay, self.backoff_max)
    }

    /// Backoff with uniform jitter in `[0, backoff_base]` added.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff_for_attempt(attempt);
        if base.is_zero() || self.backoff_base.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.backoff_base.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }
}
