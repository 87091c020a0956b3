//! Resilience pipeline around call executors
//!
//! Each dispatch passes a circuit breaker keyed by call type and destination
//! host, then runs under a per-call timeout that also honours cancellation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::executor::{CallExecutor, ExecutorError};
use crate::model::WorkflowExternalCall;
use crate::reliability::{CircuitBreakerConfig, CircuitBreakerRegistry};

/// Circuit breaker plus timeout, shared by every dispatch of one gateway
#[derive(Debug)]
pub struct ResiliencePipeline {
    breakers: CircuitBreakerRegistry,
    timeout: Duration,
}

impl Default for ResiliencePipeline {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), Duration::from_secs(30))
    }
}

impl ResiliencePipeline {
    pub fn new(breaker_config: CircuitBreakerConfig, timeout: Duration) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(breaker_config),
            timeout,
        }
    }

    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Breaker key for a call: `"<call_type>:<host>"`
    pub fn key_for(call: &WorkflowExternalCall) -> String {
        format!("{}:{}", call.call_type, call.destination_host())
    }

    /// Run `executor` for `call` through the breaker and the timeout
    pub async fn dispatch(
        &self,
        executor: Arc<dyn CallExecutor>,
        call: &WorkflowExternalCall,
        cancel: &CancellationToken,
    ) -> Result<Value, ExecutorError> {
        let key = Self::key_for(call);
        let breaker = self.breakers.get(&key);
        breaker
            .allow()
            .map_err(|_| ExecutorError::CircuitOpen(key.clone()))?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, executor.execute(call)) => {
                outcome.unwrap_or(Err(ExecutorError::Timeout(self.timeout)))
            }
        };

        match &result {
            Ok(_) => breaker.record_success(),
            // Cancellation says nothing about the destination's health
            Err(ExecutorError::Cancelled) => breaker.release(),
            Err(e) => {
                breaker.record_failure();
                warn!(breaker = %key, state = %breaker.state(), error = %e, "external call failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExternalCallStatus, ExternalCallType};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    struct Failing;

    #[async_trait]
    impl CallExecutor for Failing {
        async fn execute(&self, _call: &WorkflowExternalCall) -> Result<Value, ExecutorError> {
            Err(ExecutorError::Request("connection refused".into()))
        }
    }

    struct Slow;

    #[async_trait]
    impl CallExecutor for Slow {
        async fn execute(&self, _call: &WorkflowExternalCall) -> Result<Value, ExecutorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn call() -> WorkflowExternalCall {
        WorkflowExternalCall {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            activity_id: "charge".into(),
            call_type: ExternalCallType::HttpRequest,
            endpoint: "https://payments.example.com/charge".into(),
            method: "POST".into(),
            request_payload: None,
            headers: HashMap::new(),
            idempotency_key: "k".into(),
            status: ExternalCallStatus::Started,
            attempt_count: 1,
            response_payload: None,
            error_message: None,
            duration_ms: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_key_combines_type_and_host() {
        assert_eq!(
            ResiliencePipeline::key_for(&call()),
            "http_request:payments.example.com"
        );
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let pipeline = ResiliencePipeline::new(
            CircuitBreakerConfig::default().with_failure_threshold(2),
            Duration::from_secs(5),
        );
        let cancel = CancellationToken::new();
        let call = call();

        for _ in 0..2 {
            let err = pipeline.dispatch(Arc::new(Failing), &call, &cancel).await.unwrap_err();
            assert!(matches!(err, ExecutorError::Request(_)));
        }
        let err = pipeline.dispatch(Arc::new(Failing), &call, &cancel).await.unwrap_err();
        assert!(matches!(err, ExecutorError::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn test_cancelled_trial_call_frees_its_slot() {
        let pipeline = ResiliencePipeline::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_success_threshold(1)
                .with_reset_timeout(Duration::ZERO),
            Duration::from_secs(5),
        );
        let call = call();
        let live = CancellationToken::new();
        pipeline.dispatch(Arc::new(Failing), &call, &live).await.unwrap_err();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = pipeline.dispatch(Arc::new(Slow), &call, &cancelled).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));

        // Still half-open with the single slot free again
        let err = pipeline.dispatch(Arc::new(Failing), &call, &live).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Request(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let pipeline = ResiliencePipeline::new(CircuitBreakerConfig::default(), Duration::from_secs(1));
        let err = pipeline
            .dispatch(Arc::new(Slow), &call(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let pipeline = ResiliencePipeline::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline.dispatch(Arc::new(Slow), &call(), &cancel).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
    }
}
