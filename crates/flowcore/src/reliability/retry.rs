//! Retry budgets and backoff

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::duration_millis;

/// How many attempts an operation gets and how long to wait between them
///
/// Shared by the transaction gateway (transient database faults), the fault
/// handler (activity and external-call retries), the external call gateway
/// and event publishing in the service.
///
/// ```
/// use flowcore::RetryPolicy;
/// use std::time::Duration;
///
/// // External calls: 5s, 25s, then 60s
/// let policy = RetryPolicy::power_of(5.0, 5, Duration::from_secs(60));
/// assert_eq!(policy.delay_after_failures(2), Duration::from_secs(25));
/// assert!(policy.has_attempts_remaining(4));
/// assert!(!policy.has_attempts_remaining(5));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Attempts in total, first one included
    pub max_attempts: u32,

    /// Wait after the first failure
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any single wait
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth of the wait per additional failure
    pub multiplier: f64,

    /// Random spread as a fraction of the wait, 0.0 disables it
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Doubling backoff from 1s up to 60s, 5 attempts, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Deterministic backoff where the n-th failure waits `min(base^n s, cap)`
    pub fn power_of(base: f64, max_attempts: u32, cap: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::from_secs_f64(base),
            max_interval: cap,
            multiplier: base,
            jitter: 0.0,
        }
    }

    /// Same wait after every failure
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Clamped to `0.0..=1.0`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Wait before the next attempt once `failures` attempts have failed
    pub fn delay_after_failures(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = (self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max_interval.as_secs_f64());

        Duration::from_secs_f64(self.spread(secs))
    }

    /// Whether another attempt is allowed after `attempt` (1-based)
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    fn spread(&self, secs: f64) -> f64 {
        if self.jitter <= 0.0 || secs <= 0.0 {
            return secs;
        }
        let range = secs * self.jitter;
        (secs + rand::thread_rng().gen_range(-range..=range)).max(0.0)
    }
}
