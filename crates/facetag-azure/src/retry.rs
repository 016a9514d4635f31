//! Backoff policy for transient Face API failures.

use std::time::Duration;

/// Exponential backoff with an optional ceiling and a bounded attempt count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Multiplier applied to `initial_interval` for every past attempt.
    pub backoff_coefficient: u32,
    /// Wait before the first retry.
    pub initial_interval: Duration,
    pub maximum_interval: Option<Duration>,
    /// Total attempts including the first one. `1` disables retrying.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Wait before retrying after failed attempt number `attempt` (1-based).
    ///
    /// A server-provided `preferred` interval is honoured when it lies
    /// between the computed backoff and the ceiling.
    pub fn retry_interval(&self, attempt: u32, preferred: Option<Duration>) -> Duration {
        let candidate = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt.saturating_sub(1)));

        match (preferred, self.maximum_interval) {
            (Some(duration), Some(max)) => {
                let floor = candidate.min(max);
                if floor <= duration && duration <= max {
                    duration
                } else {
                    floor
                }
            }
            (Some(duration), None) => candidate.max(duration),
            (None, Some(max)) => candidate.min(max),
            (None, None) => candidate,
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: Duration,
    maximum_interval: Option<Duration>,
    max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(1),
            maximum_interval: Some(Duration::from_secs(30)),
            max_attempts: 3,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
        }
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
