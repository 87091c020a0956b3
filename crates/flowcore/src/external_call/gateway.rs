//! Two-phase external call gateway
//!
//! Phase 1 records the intent inside the step transaction. Phase 2 runs after
//! commit: it claims the call `Pending -> Started`, performs it outside any
//! transaction and records the result. A call is performed at most once per
//! claim; retries re-arm the row to `Pending` first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::executor::{ExecutorError, ExecutorRegistry};
use super::resilience::ResiliencePipeline;
use crate::model::{
    before_now, ExecutionLogEntry, ExternalCallStatus, ExternalCallType, LogEventKind,
    WorkflowExternalCall,
};
use crate::persistence::{IsolationLevel, StoreError, TransactionGateway, WorkflowTransaction};
use crate::reliability::RetryPolicy;

/// Intent to perform one outbound call
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCallRequest {
    pub instance_id: Uuid,
    pub activity_id: String,
    pub call_type: ExternalCallType,
    pub endpoint: String,
    pub method: String,
    pub payload: Option<Value>,
    pub headers: HashMap<String, String>,
}

impl ExternalCallRequest {
    pub fn new(
        instance_id: Uuid,
        activity_id: impl Into<String>,
        call_type: ExternalCallType,
        endpoint: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            instance_id,
            activity_id: activity_id.into(),
            call_type,
            endpoint: endpoint.into(),
            method: method.into().to_uppercase(),
            payload: None,
            headers: HashMap::new(),
        }
    }

    /// HTTP request intent
    pub fn http(
        instance_id: Uuid,
        activity_id: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self::new(instance_id, activity_id, ExternalCallType::HttpRequest, url, method)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Methods are compared and stored upper-cased
    fn normalized(mut self) -> Self {
        self.method = self.method.to_uppercase();
        self
    }

    /// Stable key derived from (instance, activity, method, endpoint)
    ///
    /// The same logical request always yields the same key, so a receiver
    /// can drop a redelivered attempt.
    pub fn idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.instance_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.activity_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.method.to_uppercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.endpoint.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn into_call(self) -> WorkflowExternalCall {
        let now = Utc::now();
        let idempotency_key = self.idempotency_key();
        WorkflowExternalCall {
            id: Uuid::now_v7(),
            instance_id: self.instance_id,
            activity_id: self.activity_id,
            call_type: self.call_type,
            endpoint: self.endpoint,
            method: self.method,
            request_payload: self.payload,
            headers: self.headers,
            idempotency_key,
            status: ExternalCallStatus::Pending,
            attempt_count: 0,
            response_payload: None,
            error_message: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of [`ExternalCallGateway::execute`]
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalCallOutcome {
    Completed(WorkflowExternalCall),
    Failed(WorkflowExternalCall),
    /// Timed out or cancelled mid-call
    TimedOut(WorkflowExternalCall),
    /// The call was not `Pending` (or lost the claim); nothing was sent
    Rejected {
        call_id: Uuid,
        status: ExternalCallStatus,
    },
    NotFound(Uuid),
}

impl ExternalCallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// The call as persisted after this attempt
    pub fn call(&self) -> Option<&WorkflowExternalCall> {
        match self {
            Self::Completed(call) | Self::Failed(call) | Self::TimedOut(call) => Some(call),
            Self::Rejected { .. } | Self::NotFound(_) => None,
        }
    }
}

/// Records and performs external calls
#[derive(Clone)]
pub struct ExternalCallGateway {
    transactions: TransactionGateway,
    executors: Arc<ExecutorRegistry>,
    pipeline: Arc<ResiliencePipeline>,
    retry_policy: RetryPolicy,
}

impl ExternalCallGateway {
    /// Gateway with the default executors, pipeline and a
    /// `min(5^n s, 60 s)` retry backoff
    pub fn new(transactions: TransactionGateway) -> Self {
        Self {
            transactions,
            executors: Arc::new(ExecutorRegistry::with_defaults()),
            pipeline: Arc::new(ResiliencePipeline::default()),
            retry_policy: RetryPolicy::power_of(5.0, 5, Duration::from_secs(60)),
        }
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Arc::new(executors);
        self
    }

    pub fn with_pipeline(mut self, pipeline: ResiliencePipeline) -> Self {
        self.pipeline = Arc::new(pipeline);
        self
    }

    /// Backoff between attempts of one call
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Phase 1: look up or create the call inside the caller's transaction
    pub async fn record_intent(
        tx: &mut dyn WorkflowTransaction,
        request: ExternalCallRequest,
    ) -> Result<WorkflowExternalCall, StoreError> {
        let request = request.normalized();
        if let Some(existing) = tx
            .find_external_call(
                request.instance_id,
                &request.activity_id,
                &request.endpoint,
                &request.method,
            )
            .await?
        {
            debug!(call_id = %existing.id, "external call intent already recorded");
            return Ok(existing);
        }

        let call = request.into_call();
        if !tx.insert_external_call(&call).await? {
            // A concurrent transaction committed the same call first
            let existing = tx
                .find_external_call(call.instance_id, &call.activity_id, &call.endpoint, &call.method)
                .await?
                .ok_or_else(|| {
                    StoreError::Duplicate(format!("external call {} {}", call.method, call.endpoint))
                })?;
            debug!(call_id = %existing.id, "external call intent recorded concurrently");
            return Ok(existing);
        }
        debug!(call_id = %call.id, call_type = %call.call_type, "external call intent recorded");
        Ok(call)
    }

    /// Phase 1 in a transaction of its own
    #[instrument(skip(self, request), fields(instance_id = %request.instance_id, activity_id = %request.activity_id))]
    pub async fn record_call_intent(
        &self,
        request: ExternalCallRequest,
    ) -> Result<WorkflowExternalCall, StoreError> {
        self.transactions
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let request = request.clone();
                Box::pin(async move { Self::record_intent(tx, request).await })
            })
            .await
    }

    /// Phase 2: claim a `Pending` call, perform it and record the result
    ///
    /// Must not be called from inside an open transaction.
    #[instrument(skip(self, cancel))]
    pub async fn execute(
        &self,
        call_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ExternalCallOutcome, StoreError> {
        let claimed = self
            .transactions
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { Self::claim(tx, call_id).await })
            })
            .await?;

        let call = match claimed {
            Ok(call) => call,
            Err(rejected) => {
                warn!(outcome = ?rejected, "external call not executed");
                return Ok(rejected);
            }
        };

        let mut call = call;
        let started = Instant::now();
        let result = match self.executors.get(call.call_type) {
            Ok(executor) => self.pipeline.dispatch(executor, &call, cancel).await,
            Err(e) => Err(e),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        // Nothing was sent, so the claim does not count as an attempt
        if matches!(result, Err(ExecutorError::CircuitOpen(_))) {
            call.attempt_count = call.attempt_count.saturating_sub(1);
        }

        self.finish(call, result, duration_ms).await
    }

    async fn claim(
        tx: &mut dyn WorkflowTransaction,
        call_id: Uuid,
    ) -> Result<Result<WorkflowExternalCall, ExternalCallOutcome>, StoreError> {
        let Some(call) = tx.get_external_call(call_id).await? else {
            return Ok(Err(ExternalCallOutcome::NotFound(call_id)));
        };
        if call.status != ExternalCallStatus::Pending {
            return Ok(Err(ExternalCallOutcome::Rejected {
                call_id,
                status: call.status,
            }));
        }

        let mut claimed = call.clone();
        claimed.status = ExternalCallStatus::Started;
        claimed.attempt_count += 1;
        claimed.updated_at = Utc::now();
        if !tx
            .update_external_call(&claimed, ExternalCallStatus::Pending)
            .await?
        {
            return Ok(Err(ExternalCallOutcome::Rejected {
                call_id,
                status: ExternalCallStatus::Started,
            }));
        }
        Ok(Ok(claimed))
    }

    async fn finish(
        &self,
        mut call: WorkflowExternalCall,
        result: Result<Value, ExecutorError>,
        duration_ms: u64,
    ) -> Result<ExternalCallOutcome, StoreError> {
        call.duration_ms = Some(duration_ms);
        call.updated_at = Utc::now();
        match result {
            Ok(response) => {
                call.status = ExternalCallStatus::Completed;
                call.response_payload = Some(response);
                call.error_message = None;
            }
            Err(e) if e.is_timeout() => {
                call.status = ExternalCallStatus::TimedOut;
                call.error_message = Some(e.to_string());
            }
            Err(e) => {
                call.status = ExternalCallStatus::Failed;
                call.error_message = Some(e.to_string());
            }
        }

        let stored = call.clone();
        let superseded = self
            .transactions
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let stored = stored.clone();
                Box::pin(async move { Self::record_result(tx, stored).await })
            })
            .await?;

        if let Some(status) = superseded {
            warn!(
                call_id = %call.id,
                status = %status,
                "external call left Started while in flight, result discarded"
            );
            return Ok(ExternalCallOutcome::Rejected {
                call_id: call.id,
                status,
            });
        }

        match call.status {
            ExternalCallStatus::Completed => {
                info!(call_id = %call.id, duration_ms, "external call completed");
                Ok(ExternalCallOutcome::Completed(call))
            }
            ExternalCallStatus::TimedOut => {
                warn!(call_id = %call.id, attempt = call.attempt_count, "external call timed out");
                Ok(ExternalCallOutcome::TimedOut(call))
            }
            _ => {
                warn!(
                    call_id = %call.id,
                    attempt = call.attempt_count,
                    error = call.error_message.as_deref().unwrap_or_default(),
                    "external call failed"
                );
                Ok(ExternalCallOutcome::Failed(call))
            }
        }
    }

    /// Returns the stored status when the call is no longer `Started`
    async fn record_result(
        tx: &mut dyn WorkflowTransaction,
        call: WorkflowExternalCall,
    ) -> Result<Option<ExternalCallStatus>, StoreError> {
        if !tx
            .update_external_call(&call, ExternalCallStatus::Started)
            .await?
        {
            let current = tx.get_external_call(call.id).await?;
            return Ok(Some(current.map_or(call.status, |c| c.status)));
        }

        if call.status == ExternalCallStatus::Failed {
            tx.append_log(
                &ExecutionLogEntry::new(
                    call.instance_id,
                    LogEventKind::ExternalCallFailed,
                    format!(
                        "{} {} failed: {}",
                        call.method,
                        call.endpoint,
                        call.error_message.as_deref().unwrap_or_default()
                    ),
                )
                .for_activity(&call.activity_id)
                .with_metadata(json!({
                    "CallId": call.id,
                    "Attempt": call.attempt_count,
                    "DurationMs": call.duration_ms,
                })),
            )
            .await?;
        }
        Ok(None)
    }

    /// Time out calls left `Started` for longer than `stale_after`
    ///
    /// A worker that dies between claim and result leaves its call `Started`
    /// forever. Reclaimed calls become `TimedOut` and so retryable; a late
    /// result from the original worker is then discarded.
    #[instrument(skip(self))]
    pub async fn reclaim_stale_calls(
        &self,
        stale_after: Duration,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let started_before = before_now(stale_after);
        let reclaimed = self
            .transactions
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { Self::reclaim_in(tx, started_before, stale_after, limit).await })
            })
            .await?;
        if reclaimed > 0 {
            warn!(reclaimed, "stale external calls timed out");
        }
        Ok(reclaimed)
    }

    async fn reclaim_in(
        tx: &mut dyn WorkflowTransaction,
        started_before: DateTime<Utc>,
        stale_after: Duration,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let mut reclaimed = 0;
        for mut call in tx.list_stale_external_calls(started_before, limit).await? {
            call.status = ExternalCallStatus::TimedOut;
            call.error_message = Some(format!("no result recorded within {stale_after:?}"));
            call.updated_at = Utc::now();
            if tx
                .update_external_call(&call, ExternalCallStatus::Started)
                .await?
            {
                debug!(call_id = %call.id, attempt = call.attempt_count, "stale external call reclaimed");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Whether another attempt may be made under `max_attempts`
    pub fn can_retry(&self, call: &WorkflowExternalCall, max_attempts: u32) -> bool {
        call.can_retry(max_attempts)
    }

    /// Whether the backoff after the call's last attempt has elapsed
    pub fn is_retry_due(&self, call: &WorkflowExternalCall, now: DateTime<Utc>) -> bool {
        let delay = self.retry_policy.delay_after_failures(call.attempt_count);
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| call.updated_at.checked_add_signed(delay))
            .is_some_and(|due| due <= now)
    }

    /// Failed or timed-out calls with attempts left
    pub async fn get_retryable_calls(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<WorkflowExternalCall>, StoreError> {
        self.transactions
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.list_retryable_external_calls(max_attempts, limit).await })
            })
            .await
    }

    /// Re-arm a failed or timed-out call to `Pending` and execute it again
    ///
    /// The attempt count is kept, so `max_attempts` bounds the whole history
    /// of the call.
    #[instrument(skip(self, cancel))]
    pub async fn retry(
        &self,
        call_id: Uuid,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<ExternalCallOutcome, StoreError> {
        let rearmed = self
            .transactions
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { Self::rearm(tx, call_id, max_attempts).await })
            })
            .await?;

        match rearmed {
            Some(rejected) => Ok(rejected),
            None => self.execute(call_id, cancel).await,
        }
    }

    async fn rearm(
        tx: &mut dyn WorkflowTransaction,
        call_id: Uuid,
        max_attempts: u32,
    ) -> Result<Option<ExternalCallOutcome>, StoreError> {
        let Some(call) = tx.get_external_call(call_id).await? else {
            return Ok(Some(ExternalCallOutcome::NotFound(call_id)));
        };
        if !call.can_retry(max_attempts) {
            return Ok(Some(ExternalCallOutcome::Rejected {
                call_id,
                status: call.status,
            }));
        }

        let previous = call.status;
        let mut pending = call;
        pending.status = ExternalCallStatus::Pending;
        pending.updated_at = Utc::now();
        if !tx.update_external_call(&pending, previous).await? {
            return Ok(Some(ExternalCallOutcome::Rejected {
                call_id,
                status: previous,
            }));
        }
        Ok(None)
    }
}
