//! Exponential backoff policy shared by the bus and the bridge

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delivery attempts allowed before dead-lettering
    pub max_retries: u32,
    /// Delay before the first retry (seconds)
    pub base_delay_secs: f64,
    /// Upper bound on any delay (seconds)
    pub max_delay_secs: f64,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Randomize delays inside `[base, computed]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 60.0,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Bus redelivery: `2^retry_count` seconds, no jitter
    pub fn bus_default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 2.0,
            max_delay_secs: 60.0,
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    /// Whether another attempt is allowed after `retry_count` failures
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Deterministic delay before retry `attempt` (1-based):
    /// `min(base * factor^(attempt-1), max)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay = self.base_delay_secs * self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay_secs).max(0.0))
    }

    /// Delay before retry `attempt`, jittered when enabled.
    ///
    /// The result always lies in `[base_delay_secs, max_delay_secs]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let computed = self.base_delay(attempt);
        if !self.jitter {
            return computed;
        }

        let scale = 0.5 + rand::thread_rng().gen::<f64>() * 0.5;
        let jittered = computed.as_secs_f64() * scale;
        let lower = self.base_delay_secs.min(self.max_delay_secs).max(0.0);
        Duration::from_secs_f64(jittered.clamp(lower, self.max_delay_secs.max(lower)))
    }

    pub fn validate(&self, path: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.base_delay_secs < 0.0 {
            errors.push(format!("{path}.base_delay_secs must not be negative"));
        }
        if self.max_delay_secs < self.base_delay_secs {
            errors.push(format!("{path}.max_delay_secs must be >= base_delay_secs"));
        }
        if self.backoff_factor < 1.0 {
            errors.push(format!("{path}.backoff_factor must be >= 1.0"));
        }
        errors
    }
}
