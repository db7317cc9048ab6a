//! Shared retry policy for stage invocations.
//!
//! One policy object is injected into the orchestrator and reused for every
//! stage: bounded attempts, exponential backoff with jitter, and a
//! retryable-class predicate. Only transient protocol failures are retried;
//! terminal failures surface immediately.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

/// Retry policy for failed stage invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between attempts in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum delay between attempts in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each attempt)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter fraction in [0, 1]: each delay is scaled by a random factor
    /// in [1 - jitter, 1]
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Calculate the backoff delay after a given attempt (1-indexed),
    /// with jitter applied
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let base = self.base_delay_ms as f64 * self.multiplier.powi(exp as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 - jitter * rand::thread_rng().gen::<f64>()
        } else {
            1.0
        };

        Duration::from_millis((capped * factor) as u64)
    }

    /// Whether a failed attempt should be retried: the error class must be
    /// transient and the attempt budget not exhausted
    pub fn should_retry(&self, attempt: u32, error: &ProtocolError) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }
}
