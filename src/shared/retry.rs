//! Usage: Retry decision + jittered exponential backoff for upstream attempts.

use rand::Rng;
use std::time::Duration;

use crate::error::GatewayError;

const JITTER_FRACTION: f64 = 0.30;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Whether a failed attempt should be retried. The error's own
    /// retryability flag decides; attempt exhaustion always wins.
    pub fn should_retry(&self, error: &GatewayError, attempt_number: u32) -> bool {
        if attempt_number >= self.max_attempts {
            return false;
        }
        error.is_retryable()
    }

    /// Backoff before attempt `attempt_number + 1`, with uniform jitter.
    pub fn delay(&self, attempt_number: u32) -> Duration {
        let (lo, hi) = self.delay_bounds_ms(attempt_number);
        let ms = if lo >= hi {
            hi
        } else {
            rand::thread_rng().gen_range(lo..=hi)
        };
        Duration::from_millis(ms)
    }

    /// Inclusive [lo, hi] millisecond bounds for `delay(attempt_number)`.
    pub fn delay_bounds_ms(&self, attempt_number: u32) -> (u64, u64) {
        let exp = attempt_number.saturating_sub(1).min(20);
        let nominal = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX));
        let lo = ((nominal as f64) * (1.0 - JITTER_FRACTION)) as u64;
        let hi = (((nominal as f64) * (1.0 + JITTER_FRACTION)) as u64).min(self.max_delay_ms);
        (lo.min(hi), hi)
    }
}
