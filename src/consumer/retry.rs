use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff for transient failures.
///
/// The attempt budget is per batch: every transient failure within one
/// batch draws from the same budget, whichever event caused it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed per batch, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay before retrying after the `failures`-th consecutive failure:
    /// `initial * multiplier^(failures - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.initial_backoff.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = nanos.min(self.max_backoff.as_nanos() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_nanos(capped.round() as u64)
        } else {
            Duration::ZERO
        }
    }

    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            policy: self.clone(),
            failures: 0,
        }
    }
}

/// Attempts left for one batch.
#[derive(Clone, Debug)]
pub struct RetryBudget {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryBudget {
    /// Record a transient failure. Returns the delay before the next attempt,
    /// or `None` once the budget is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            None
        } else {
            Some(self.policy.backoff(self.failures))
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.policy.max_attempts
    }
}
