//! Retry policies for transient instrument failures.
//
// Single readings, source commands and setpoint commands are retried with an
// exponential backoff. The caller owns the loop so every backoff delay can be
// spent inside a cancellable wait.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// The maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// The delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Factor applied to the delay after every retry.
    pub multiplier: f64,
    /// Upper bound for a single delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }

    /// Starts a fresh backoff sequence for one operation.
    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            retries: 0,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            ));
        }
        if self.max_backoff < self.initial_backoff {
            return Err("retry max_backoff must be >= initial_backoff".to_string());
        }
        Ok(())
    }
}

/// Backoff sequence for a single operation.
///
/// Yields one delay per permitted retry, then `None`.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    retries: u32,
}

impl Backoff<'_> {
    /// Number of retries handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Total attempts made if the current attempt is the last one.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay_for(self.retries);
        self.retries += 1;
        Some(delay)
    }
}
