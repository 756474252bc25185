//! Capped exponential backoff shared by polls and emissions.

use core::time::Duration;

use crate::{DEFAULT_BACKOFF_FACTOR, DEFAULT_RETRY_MAX_MS, DEFAULT_RETRY_MIN_MS};

/// Retry delay that grows on each consecutive failure.
///
/// After `k` consecutive failures the delay is
/// `min(min * factor^k, max)`. One success resets it to `min`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryState {
    min: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl RetryState {
    /// Create a retry state starting at `min`.
    ///
    /// A `factor` below 1 (or NaN) is treated as 1, so delays never shrink.
    #[must_use]
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        let factor = if factor >= 1.0 { factor } else { 1.0 };
        let max = max.max(min);
        Self {
            min,
            max,
            factor,
            current: min,
        }
    }

    /// Record a failure and return the delay to wait before retrying.
    pub fn fail(&mut self) -> Duration {
        let next = self.current.as_secs_f64() * self.factor;
        self.current = if next.is_finite() && next < self.max.as_secs_f64() {
            Duration::from_secs_f64(next)
        } else {
            self.max
        };
        self.current
    }

    /// Record a success.
    pub const fn reset(&mut self) {
        self.current = self.min;
    }

    /// The delay that the next retry would use without another failure.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }
}

impl Default for RetryState {
    /// 1 second doubling up to 1 minute.
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_RETRY_MIN_MS),
            Duration::from_millis(DEFAULT_RETRY_MAX_MS),
            DEFAULT_BACKOFF_FACTOR,
        )
    }
}
