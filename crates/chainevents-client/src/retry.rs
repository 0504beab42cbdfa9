//! Fixed-delay connect retry policy.

use std::time::Duration;

use chainevents_core::config::MIN_TIME_BETWEEN_CONNECT_ATTEMPTS;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, counting the first one. `0` retries forever.
    pub max_attempts: u32,
    /// Pause between two attempts.
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::from_secs(5),
        }
    }
}

/// Stateless retry policy: decides whether another attempt follows the
/// `attempt`-th failure and how long to wait before it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn is_unbounded(&self) -> bool {
        self.config.max_attempts == 0
    }

    /// Returns `true` if another attempt may follow the `attempt`-th failure (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.is_unbounded() || attempt < self.config.max_attempts
    }

    /// Returns the delay after the `attempt`-th failure, `None` when attempts are exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.should_retry(attempt)
            .then(|| self.config.delay.max(MIN_TIME_BETWEEN_CONNECT_ATTEMPTS))
    }
}
