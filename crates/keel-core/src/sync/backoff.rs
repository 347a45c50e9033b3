//! Exponential backoff helpers.

use std::time::Duration;

/// Delay before a failed change may be retried: `min(2^attempt_count s, max)`.
pub fn retry_delay(attempt_count: u32, max: Duration) -> Duration {
    let secs = 2u64.checked_pow(attempt_count).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(max)
}

/// Doubling reconnect delay, capped at `max` and reset on success.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt; grows on every call.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.checked_pow(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}
