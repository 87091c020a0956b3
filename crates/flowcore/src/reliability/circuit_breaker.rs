//! Circuit breakers for outbound destinations

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if service recovered - up to `success_threshold` trial calls
    /// in flight, the rest rejected
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                               ▲          failure          │
///      │                               └───────────────────────────┤
///      │              success threshold                            │
///      └───────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use flowcore::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_reset_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of failures within the window required to open the circuit
    pub failure_threshold: u32,

    /// Number of successes required to close the circuit (in half-open state)
    pub success_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,

    /// Sliding window size for failure counting
    #[serde(with = "duration_millis")]
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            window_size: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the success threshold to close the circuit
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout (time before trying again after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the sliding window size for failure counting
    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }
}

/// Error returned when a call is not allowed through
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Circuit is open, calls are not allowed
    #[error("circuit breaker '{0}' is open")]
    Open(String),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: Vec<Instant>,
    half_open_successes: u32,
    half_open_admitted: u32,
    opened_at: Option<Instant>,
}

/// In-process circuit breaker for one destination
///
/// State is local to the process. Each process learns a destination's health
/// on its own; nothing is shared through storage.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: Vec::new(),
                half_open_successes: 0,
                half_open_admitted: 0,
                opened_at: None,
            }),
        }
    }

    /// Key this breaker protects
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state, moving Open to HalfOpen once the reset timeout passed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Check whether a call may proceed
    ///
    /// In half-open state only `success_threshold` trial calls are admitted
    /// until they report back through `record_success`, `record_failure` or
    /// `release`.
    pub fn allow(&self) -> Result<(), CircuitBreakerError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if inner.half_open_admitted < self.config.success_threshold => {
                inner.half_open_admitted += 1;
                Ok(())
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                Err(CircuitBreakerError::Open(self.key.clone()))
            }
        }
    }

    /// Give back an admitted trial call that ended without a verdict
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_admitted = inner.half_open_admitted.saturating_sub(1);
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    debug!(key = %self.key, "circuit closed");
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.half_open_successes = 0;
                    inner.half_open_admitted = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(key = %self.key, "trial call failed, circuit re-opened");
                self.open(&mut inner, now);
            }
            CircuitState::Closed => {
                let window = self.config.window_size;
                inner.failures.retain(|t| now.duration_since(*t) <= window);
                inner.failures.push(now);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    warn!(
                        key = %self.key,
                        failures = inner.failures.len(),
                        "failure threshold reached, circuit opened"
                    );
                    self.open(&mut inner, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.half_open_successes = 0;
        inner.half_open_admitted = 0;
        inner.failures.clear();
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed >= self.config.reset_timeout {
                debug!(key = %self.key, "circuit half-open");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                inner.half_open_admitted = 0;
            }
        }
    }
}

/// Breakers keyed by destination, created on first use
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers share one configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `key`, creating a closed one if needed
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
    }

    /// Number of tracked destinations
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no destination has been seen yet
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(
            "api.example.com",
            CircuitBreakerConfig::new().with_failure_threshold(3),
        );

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.allow(),
            Err(CircuitBreakerError::Open(key)) if key == "api.example.com"
        ));
    }

    #[test]
    fn test_half_open_then_closed() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_success_threshold(2)
                .with_reset_timeout(Duration::ZERO),
        );

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_secs(3600)),
        );
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Force half-open without waiting an hour
        breaker.inner.lock().state = CircuitState::HalfOpen;
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_admits_limited_trial_calls() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_success_threshold(2)
                .with_reset_timeout(Duration::ZERO),
        );
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.allow().is_ok());
        assert!(breaker.allow().is_ok());
        assert!(breaker.allow().is_err());

        // A released slot can be taken again
        breaker.release();
        assert!(breaker.allow().is_ok());
        assert!(breaker.allow().is_err());

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        for _ in 0..5 {
            assert!(breaker.allow().is_ok());
        }
    }

    #[test]
    fn test_registry_isolates_destinations() {
        let registry =
            CircuitBreakerRegistry::new(CircuitBreakerConfig::new().with_failure_threshold(1));

        registry.get("http_request:bad.example.com").record_failure();

        assert!(registry.get("http_request:bad.example.com").allow().is_err());
        assert!(registry.get("http_request:good.example.com").allow().is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_serialization() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
