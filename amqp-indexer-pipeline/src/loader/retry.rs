//! Backoff schedule for ordered bulk submissions.

use std::time::Duration;

/// Bounded retry schedule with a quadratic backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_tries: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 10,
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Build a policy from a retry count, as configured by operators.
    pub fn with_retries(retries: u32, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_tries: retries.saturating_add(1),
            min_wait,
            max_wait,
        }
    }

    /// Wait before attempt `try_num` (1-based).
    ///
    /// The first attempt runs immediately. Attempt `k` waits
    /// `(k / max_tries)^2 * (max_wait - min_wait) + min_wait`.
    pub fn wait_before(&self, try_num: u32) -> Duration {
        if try_num <= 1 || self.max_tries == 0 {
            return Duration::ZERO;
        }

        let ratio = f64::from(try_num) / f64::from(self.max_tries);
        let spread = self.max_wait.saturating_sub(self.min_wait).as_secs_f64();
        self.min_wait + Duration::from_secs_f64(ratio * ratio * spread)
    }

    /// Whether another attempt may follow attempt `try_num`.
    pub fn allows_retry_after(&self, try_num: u32) -> bool {
        try_num < self.max_tries
    }
}
