//! Runtime configuration
//!
//! Every setting has a default; `from_env` overrides them from `FLOWCORE_*`
//! variables (and `DATABASE_URL`). Unparseable values are logged and ignored.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::external_call::{ExternalCallGateway, ResiliencePipeline};
use crate::persistence::{TransactionGateway, WorkflowStore};
use crate::reliability::{duration_millis, CircuitBreakerConfig, RetryPolicy};
use crate::schema::SchemaLimits;
use crate::service::EventPublisher;
use crate::worker::{OutboxDispatcher, TimerSweeper, WorkerPool, WorkerPoolConfig};

/// Outbound call settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCallConfig {
    /// Per-call timeout
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Attempts per call, first one included
    pub max_attempts: u32,

    /// Breaker applied per call type and destination host
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ExternalCallConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 5,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ExternalCallConfig {
    /// Backoff between attempts: 5s, 25s, then capped at 60s
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::power_of(5.0, self.max_attempts, Duration::from_secs(60))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowcoreConfig {
    /// PostgreSQL connection string, required by the worker binary
    pub database_url: Option<String>,

    /// Retry policy for transient database faults
    pub transaction_retry: RetryPolicy,

    /// Ceilings applied to workflow schemas
    pub schema_limits: SchemaLimits,

    /// Steps one orchestration run may take before the instance is failed
    pub max_steps: usize,

    /// Start/resume attempts made by the service facade
    pub workflow_max_attempts: u32,

    pub external_calls: ExternalCallConfig,

    /// Background loops
    pub worker: WorkerPoolConfig,
}

impl Default for FlowcoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            transaction_retry: RetryPolicy::exponential()
                .with_max_attempts(3)
                .with_initial_interval(Duration::from_millis(100))
                .with_max_interval(Duration::from_secs(2)),
            schema_limits: SchemaLimits::default(),
            max_steps: 100,
            workflow_max_attempts: 3,
            external_calls: ExternalCallConfig::default(),
            worker: WorkerPoolConfig::default(),
        }
    }
}

impl FlowcoreConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `FLOWCORE_WORKER_ID`: worker identifier (default: generated)
    /// - `FLOWCORE_DB_RETRY_ATTEMPTS`: attempts per transaction (default: 3)
    /// - `FLOWCORE_SCHEMA_MAX_BYTES`: maximum schema size (default: 1 MiB)
    /// - `FLOWCORE_MAX_STEPS`: steps per orchestration run (default: 100)
    /// - `FLOWCORE_WORKFLOW_MAX_ATTEMPTS`: start/resume attempts (default: 3)
    /// - `FLOWCORE_OUTBOX_BATCH_SIZE` (default: 50)
    /// - `FLOWCORE_OUTBOX_POLL_INTERVAL_MS` (default: 5000)
    /// - `FLOWCORE_OUTBOX_MAX_ATTEMPTS` (default: 5)
    /// - `FLOWCORE_OUTBOX_RETENTION_SECS` (default: 7 days)
    /// - `FLOWCORE_SWEEPER_INTERVAL_MS` (default: 30000)
    /// - `FLOWCORE_SWEEPER_BATCH_SIZE` (default: 100)
    /// - `FLOWCORE_INSTANCE_CEILING_SECS` (default: 24 hours)
    /// - `FLOWCORE_BOOKMARK_RETENTION_SECS` (default: 30 days)
    /// - `FLOWCORE_STALE_CALL_SECS`: age of an unfinished call before it is
    ///   timed out (default: 300)
    /// - `FLOWCORE_EXTERNAL_CALL_TIMEOUT_MS` (default: 30000)
    /// - `FLOWCORE_EXTERNAL_CALL_MAX_ATTEMPTS` (default: 5)
    /// - `FLOWCORE_CIRCUIT_FAILURE_THRESHOLD` (default: 5)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let mut config = Self::default();

        config.database_url = vars.get("DATABASE_URL");
        if let Some(worker_id) = vars.get("FLOWCORE_WORKER_ID") {
            config.worker.worker_id = worker_id;
        }

        vars.set(&mut config.transaction_retry.max_attempts, "FLOWCORE_DB_RETRY_ATTEMPTS");
        vars.set(&mut config.schema_limits.max_json_bytes, "FLOWCORE_SCHEMA_MAX_BYTES");
        vars.set(&mut config.max_steps, "FLOWCORE_MAX_STEPS");
        vars.set(&mut config.workflow_max_attempts, "FLOWCORE_WORKFLOW_MAX_ATTEMPTS");

        let outbox = &mut config.worker.outbox;
        vars.set(&mut outbox.batch_size, "FLOWCORE_OUTBOX_BATCH_SIZE");
        vars.set_millis(&mut outbox.poll_interval, "FLOWCORE_OUTBOX_POLL_INTERVAL_MS");
        vars.set(&mut outbox.max_attempts, "FLOWCORE_OUTBOX_MAX_ATTEMPTS");
        vars.set_secs(&mut outbox.retention, "FLOWCORE_OUTBOX_RETENTION_SECS");

        let sweeper = &mut config.worker.sweeper;
        vars.set_millis(&mut sweeper.interval, "FLOWCORE_SWEEPER_INTERVAL_MS");
        vars.set(&mut sweeper.batch_size, "FLOWCORE_SWEEPER_BATCH_SIZE");
        vars.set_secs(&mut sweeper.instance_ceiling, "FLOWCORE_INSTANCE_CEILING_SECS");
        vars.set_secs(&mut sweeper.bookmark_retention, "FLOWCORE_BOOKMARK_RETENTION_SECS");
        vars.set_secs(&mut sweeper.stale_call_after, "FLOWCORE_STALE_CALL_SECS");

        let calls = &mut config.external_calls;
        vars.set_millis(&mut calls.timeout, "FLOWCORE_EXTERNAL_CALL_TIMEOUT_MS");
        vars.set(&mut calls.max_attempts, "FLOWCORE_EXTERNAL_CALL_MAX_ATTEMPTS");
        vars.set(
            &mut calls.circuit_breaker.failure_threshold,
            "FLOWCORE_CIRCUIT_FAILURE_THRESHOLD",
        );
        config.worker.sweeper.external_call_max_attempts = config.external_calls.max_attempts;

        config
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_transaction_retry(mut self, policy: RetryPolicy) -> Self {
        self.transaction_retry = policy;
        self
    }

    pub fn with_schema_limits(mut self, limits: SchemaLimits) -> Self {
        self.schema_limits = limits;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_external_calls(mut self, config: ExternalCallConfig) -> Self {
        self.worker.sweeper.external_call_max_attempts = config.max_attempts;
        self.external_calls = config;
        self
    }

    pub fn with_worker(mut self, config: WorkerPoolConfig) -> Self {
        self.worker = config;
        self
    }

    /// Transaction gateway over `store` with the configured retry and limits
    pub fn transaction_gateway(&self, store: Arc<dyn WorkflowStore>) -> TransactionGateway {
        TransactionGateway::new(store)
            .with_retry_policy(self.transaction_retry.clone())
            .with_schema_limits(self.schema_limits.clone())
    }

    /// External call gateway with the configured timeout, breaker and backoff
    pub fn external_call_gateway(&self, gateway: TransactionGateway) -> ExternalCallGateway {
        let calls = &self.external_calls;
        ExternalCallGateway::new(gateway)
            .with_pipeline(ResiliencePipeline::new(
                calls.circuit_breaker.clone(),
                calls.timeout,
            ))
            .with_retry_policy(calls.retry_policy())
    }

    /// Background loops publishing through `publisher`
    pub fn worker_pool(
        &self,
        gateway: TransactionGateway,
        publisher: Arc<dyn EventPublisher>,
    ) -> WorkerPool {
        let dispatcher = OutboxDispatcher::new(gateway.clone(), self.worker.outbox.clone())
            .with_publisher(publisher);
        let sweeper = TimerSweeper::new(gateway.clone(), self.worker.sweeper.clone())
            .with_external_calls(self.external_call_gateway(gateway));
        WorkerPool::new(dispatcher, sweeper, self.worker.clone())
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable configuration value");
                None
            }
        }
    }

    fn set<T: FromStr>(&self, target: &mut T, key: &str) {
        if let Some(value) = self.parse(key) {
            *target = value;
        }
    }

    fn set_millis(&self, target: &mut Duration, key: &str) {
        if let Some(millis) = self.parse::<u64>(key) {
            *target = Duration::from_millis(millis);
        }
    }

    fn set_secs(&self, target: &mut Duration, key: &str) {
        if let Some(secs) = self.parse::<u64>(key) {
            *target = Duration::from_secs(secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FlowcoreConfig::from_lookup(|_| None);
        assert!(config.database_url.is_none());
        assert_eq!(config.max_steps, 100);
        assert_eq!(config.transaction_retry.max_attempts, 3);
        assert_eq!(config.schema_limits.max_json_bytes, 1024 * 1024);
        assert_eq!(config.worker.outbox.batch_size, 50);
        assert_eq!(config.worker.outbox.poll_interval, Duration::from_secs(5));
        assert_eq!(config.worker.sweeper.instance_ceiling, Duration::from_secs(86_400));
        assert_eq!(config.external_calls.timeout, Duration::from_secs(30));
        assert_eq!(config.external_calls.max_attempts, 5);
    }

    #[test]
    fn test_overrides() {
        let config = FlowcoreConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/flowcore"),
            ("FLOWCORE_WORKER_ID", "w-1"),
            ("FLOWCORE_MAX_STEPS", "25"),
            ("FLOWCORE_OUTBOX_POLL_INTERVAL_MS", "250"),
            ("FLOWCORE_INSTANCE_CEILING_SECS", "3600"),
            ("FLOWCORE_EXTERNAL_CALL_MAX_ATTEMPTS", "3"),
            ("FLOWCORE_STALE_CALL_SECS", "120"),
        ]));

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/flowcore"));
        assert_eq!(config.worker.worker_id, "w-1");
        assert_eq!(config.max_steps, 25);
        assert_eq!(config.worker.outbox.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker.sweeper.instance_ceiling, Duration::from_secs(3600));
        assert_eq!(config.external_calls.max_attempts, 3);
        assert_eq!(config.worker.sweeper.external_call_max_attempts, 3);
        assert_eq!(config.worker.sweeper.stale_call_after, Duration::from_secs(120));
    }

    #[test]
    fn test_unparseable_values_keep_defaults() {
        let config = FlowcoreConfig::from_lookup(lookup(&[
            ("FLOWCORE_MAX_STEPS", "lots"),
            ("FLOWCORE_OUTBOX_BATCH_SIZE", ""),
        ]));
        assert_eq!(config.max_steps, 100);
        assert_eq!(config.worker.outbox.batch_size, 50);
    }

    #[test]
    fn test_external_call_backoff() {
        let policy = ExternalCallConfig::default().retry_policy();
        assert_eq!(policy.delay_after_failures(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after_failures(2), Duration::from_secs(25));
        assert_eq!(policy.delay_after_failures(3), Duration::from_secs(60));
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = FlowcoreConfig::default().with_max_steps(10);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: FlowcoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_steps, 10);
        assert_eq!(parsed.external_calls.timeout, config.external_calls.timeout);
    }
}
