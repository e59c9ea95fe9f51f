//! Retry policy: backoff curves and the retry/fail decision.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::failure::ErrorClass;

/// Longest back-off a retry is ever scheduled with, whatever the policy or an
/// analyzer's `Retry-After` asks for.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to `pending`, eligible again after `delay`.
    Retry { delay: Duration },
    /// Move the job to `failed`.
    Fail,
}

/// Retry policy configuration (one per job kind).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to spread retries of jobs that failed together
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with linear backoff.
    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Merge an analyzer's back-off hint into a computed delay.
    ///
    /// The longer of the two wins, saturating at [`MAX_RETRY_DELAY`].
    pub fn honor_hint(&self, delay: Duration, hint: Option<Duration>) -> Duration {
        hint.map_or(delay, |hint| hint.max(delay)).min(MAX_RETRY_DELAY)
    }

    /// Decide what happens after a failed attempt.
    ///
    /// `attempts` is the number of attempts consumed *including* the one that
    /// just failed. `ResourceExhausted` backs off one step further along the
    /// curve than `Transient`.
    pub fn decide(&self, attempts: u32, max_attempts: u32, class: ErrorClass) -> RetryDecision {
        match class {
            ErrorClass::Validation => RetryDecision::Fail,
            ErrorClass::Transient | ErrorClass::ResourceExhausted if attempts < max_attempts => {
                let step = if class == ErrorClass::ResourceExhausted {
                    attempts + 1
                } else {
                    attempts
                };
                RetryDecision::Retry {
                    delay: self.delay_for_attempt(step),
                }
            }
            _ => RetryDecision::Fail,
        }
    }
}
