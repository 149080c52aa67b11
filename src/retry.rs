//! Retry/backoff bookkeeping consulted by the resume coordinator.

use std::time::Duration;

/// Exponential backoff policy with a hard cap.
///
/// Attempt numbering matches the coordinator: attempt 0 is the first try
/// (no delay), attempt N waits `initial * multiplier^(N-1)` capped at maximum.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry (seconds)
    pub initial: f64,
    /// Exponential backoff multiplier
    pub multiplier: f64,
    /// Maximum delay (seconds)
    pub maximum: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: 2.0,
            multiplier: 2.0,
            maximum: 60.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // Cap exponent to prevent overflow (2^16 is already way past maximum)
        let exp = (attempt - 1).min(16) as i32;
        let d = self.initial * self.multiplier.powi(exp);
        Duration::from_secs_f64(d.min(self.maximum))
    }

    /// Whether another attempt is allowed. False once attempt >= max_retries.
    pub fn should_retry(&self, attempt: u32, max_retries: u32) -> bool {
        attempt < max_retries
    }
}
