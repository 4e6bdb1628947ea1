//! Retry budget and exponential backoff.
//!
//! Backoff is a pure function of the retry index so it can be checked
//! without a clock: `min(base * 2^retry, max)`.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::types::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Total attempts allowed for `task`, first attempt included.
    pub fn budget(&self, task: &Task) -> u32 {
        task.max_attempts.unwrap_or(self.max_attempts).max(1)
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        backoff_delay(self.base_delay, self.max_delay, retry)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

pub fn backoff_delay(base: Duration, max: Duration, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}
