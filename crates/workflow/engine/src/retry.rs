//! Backoff schedule for failing service tasks.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a cap, plus the failure count that stalls an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures on one step that move the instance to Stalled
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Growth factor between consecutive retries
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            initial_delay_secs: default_initial_delay(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay(),
        }
    }
}

fn default_max_failures() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    1
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_delay() -> u64 {
    3600
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based):
    /// `min(initial * multiplier^(attempt - 1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier).saturating_pow(exponent);
        let secs = self
            .initial_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// Whether `failures` consecutive failures exhaust the policy
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_failures
    }

    /// A policy with no waiting, for tests and local tooling.
    pub fn immediate(max_failures: u32) -> Self {
        Self {
            max_failures,
            initial_delay_secs: 0,
            multiplier: 1,
            max_delay_secs: 0,
        }
    }
}
