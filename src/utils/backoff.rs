//! Retry backoff policy for the bundle downloader.

use crate::constants::{
    RETRY_ATTEMPTS_AT_MINIMUM, RETRY_BASE_INTERVAL, RETRY_EXPONENT, RETRY_MAXIMUM_INTERVAL,
    RETRY_MINIMUM_INTERVAL,
};
use std::time::Duration;

/// Pure mapping from an attempt count to a wait interval.
///
/// The first attempts fail fast (sub-second) to absorb transient network
/// blips, then the wait grows geometrically up to a ceiling so a flaky
/// connection neither hot-loops requests nor waits unboundedly:
///
/// ```text
/// attempt:  0      1      2     3      4      5      ...
/// wait:     100ms  100ms  1s    2.2s   4.84s  10.6s  ... capped at 30s
/// ```
///
/// The curve is deliberately deterministic (no randomization): the sequence
/// is non-decreasing, the first retry is the fastest, and the ceiling is
/// never exceeded.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Wait used for the first `attempts_at_minimum` attempts, and the floor
    /// for every later one.
    pub minimum_interval: Duration,
    /// Ceiling on the computed wait.
    pub maximum_interval: Duration,
    /// How many attempts are served at `minimum_interval` before growth starts.
    pub attempts_at_minimum: u32,
    /// Base of the growing part of the curve.
    pub base_interval: Duration,
    /// Geometric growth factor.
    pub exponent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            minimum_interval: RETRY_MINIMUM_INTERVAL,
            maximum_interval: RETRY_MAXIMUM_INTERVAL,
            attempts_at_minimum: RETRY_ATTEMPTS_AT_MINIMUM,
            base_interval: RETRY_BASE_INTERVAL,
            exponent: RETRY_EXPONENT,
        }
    }
}

impl RetryPolicy {
    /// Returns how long to wait before retry number `attempts` (0-based count
    /// of failures so far).
    pub fn interval(&self, attempts: u32) -> Duration {
        if attempts < self.attempts_at_minimum {
            return self.minimum_interval;
        }

        // Clamped as f64 seconds; far out on the curve the raw product
        // overflows what Duration arithmetic accepts.
        let growth = self.exponent.powi((attempts - self.attempts_at_minimum) as i32);
        let seconds = (self.base_interval.as_secs_f64() * growth).clamp(
            self.minimum_interval.as_secs_f64(),
            self.maximum_interval.as_secs_f64(),
        );
        Duration::from_secs_f64(seconds)
    }
}
