//! Fixed-interval retry policy for startup tip resolution.
//!
//! Steady-state sync never retries; only the bounded startup path does.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay between consecutive attempts.
    pub interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: Duration::from_secs(60),
        }
    }
}

/// Stateless retry policy. Decides whether and when to try again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay to wait after the `attempt`-th failure (1-based).
    /// Returns `None` once every attempt has been used.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.should_retry(attempt) {
            Some(self.config.interval)
        } else {
            None
        }
    }

    /// Returns `true` if another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.config.max_attempts
    }
}
