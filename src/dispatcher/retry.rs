use crate::config::RetryConfig;

use std::time::Duration;

/// Exponential backoff between handling attempts of one event
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial_delay: Duration,
    multiplier: u32,
    max_attempts: u32,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            multiplier: config.multiplier.max(1),
            max_attempts: config.max_attempts.max(1),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep before retry number `retry` (0 for the first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = (self.multiplier as u64).checked_pow(retry).unwrap_or(u64::MAX);
        let delay_ms = (self.initial_delay.as_millis() as u64).saturating_mul(factor);
        std::cmp::min(Duration::from_millis(delay_ms), self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
