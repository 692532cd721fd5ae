//! Reconnect backoff
//!
//! Exponential delay with jitter, capped at `max_delay`. Attempts are
//! unbounded; the reconnect loop runs as long as the node keeps following.

use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        calculate_delay(&self.config, self.attempt)
    }

    /// Forget failures after a successful connect
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Calculate delay with exponential backoff and jitter
fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let initial = config.initial_delay_ms as f64;
    let max = config.max_delay_ms as f64;

    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let base_delay = (initial * config.backoff_multiplier.powi(exponent)).min(max);

    // Spread reconnects of many followers apart
    let jitter_range = base_delay * config.jitter_factor;
    let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;

    let final_delay = (base_delay + jitter).clamp(0.0, max);
    Duration::from_micros((final_delay * 1000.0) as u64)
}
