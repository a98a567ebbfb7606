//! Retry policy for multi-destination sends.
//!
//! # Responsibilities
//! - Bound the number of attempts per faulty destination
//! - Space retry rounds with exponential backoff + jitter
//!
//! # Design Decisions
//! - The count is per sender instance (configuration), not per call
//! - Only destinations that faulted are retried; successes are never resent

use std::time::Duration;

use crate::config::SenderConfig;
use crate::resilience::backoff::calculate_backoff;

/// How many times, and how far apart, a faulty destination is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Total attempts, the first send included.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        calculate_backoff(retry, self.base_delay_ms, self.max_delay_ms)
    }
}

impl From<&SenderConfig> for RetryPolicy {
    fn from(config: &SenderConfig) -> Self {
        Self::new(
            config.max_retries,
            config.retry_base_delay_ms,
            config.retry_max_delay_ms,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SenderConfig::default())
    }
}
