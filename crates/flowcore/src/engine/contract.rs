//! Contract between the orchestrator and the activity engine
//!
//! The engine runs one activity per call and reports one of five statuses.
//! Everything it persists goes through the [`StepContext`], which writes into
//! the step's transaction so the engine's effects commit or roll back
//! together with the step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bookmark::{BookmarkRequest, BookmarkStore, CreateBookmarkOutcome};
use crate::external_call::{ExternalCallGateway, ExternalCallRequest};
use crate::model::{ExternalCallStatus, ExternalCallType, OutboxMessage, WorkflowExternalCall, WorkflowInstance};
use crate::persistence::{StoreError, WorkflowTransaction};
use crate::schema::{ActivityDefinition, WorkflowSchema};

/// Errors an engine reports for one activity
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid activity input: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("activity type not supported: {0}")]
    NotSupported(String),

    #[error("activity timed out: {0}")]
    Timeout(String),

    /// Worth retrying as is
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("external service failed: {0}")]
    ExternalService(String),

    /// Business failure; not retried
    #[error("activity failed: {0}")]
    Failed(String),

    #[error("activity cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Status reported for one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Activity still working; instance stays on it
    Running,

    /// Activity finished; move to `next_activity_id`
    StepCompleted,

    /// Waiting on a bookmark
    Pending,

    /// Workflow finished
    Completed,

    Failed,
}

impl ExecutionStatus {
    /// The orchestration loop stops on this status
    pub fn stops_loop(&self) -> bool {
        matches!(self, Self::Pending | Self::Completed | Self::Failed)
    }
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionResult {
    pub status: ExecutionStatus,
    pub next_activity_id: Option<String>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl WorkflowExecutionResult {
    fn with_status(status: ExecutionStatus) -> Self {
        Self {
            status,
            next_activity_id: None,
            output: None,
            error: None,
        }
    }

    pub fn running() -> Self {
        Self::with_status(ExecutionStatus::Running)
    }

    /// Activity done; continue with `next`, or the schema's default
    /// transition when `None`
    pub fn step_completed(next: Option<String>) -> Self {
        Self {
            next_activity_id: next,
            ..Self::with_status(ExecutionStatus::StepCompleted)
        }
    }

    pub fn pending() -> Self {
        Self::with_status(ExecutionStatus::Pending)
    }

    pub fn completed() -> Self {
        Self::with_status(ExecutionStatus::Completed)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(ExecutionStatus::Failed)
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Transaction-scoped services handed to the engine for one step
pub struct StepContext<'a> {
    tx: &'a mut dyn WorkflowTransaction,
    instance_id: Uuid,
    activity_id: String,
    variable_updates: Map<String, Value>,
    recorded_calls: Vec<Uuid>,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        tx: &'a mut dyn WorkflowTransaction,
        instance_id: Uuid,
        activity_id: impl Into<String>,
    ) -> Self {
        Self {
            tx,
            instance_id,
            activity_id: activity_id.into(),
            variable_updates: Map::new(),
            recorded_calls: Vec::new(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    /// Create (or find) a bookmark in the step transaction
    pub async fn create_bookmark(
        &mut self,
        request: BookmarkRequest,
    ) -> Result<CreateBookmarkOutcome, StoreError> {
        BookmarkStore::create_in(&mut *self.tx, request).await
    }

    /// `UserAction` bookmark on the current activity
    pub async fn wait_for_user(&mut self, key: impl Into<String>) -> Result<CreateBookmarkOutcome, StoreError> {
        let request = BookmarkRequest::user_action(self.instance_id, self.activity_id.clone(), key);
        self.create_bookmark(request).await
    }

    /// Record an external call intent; it is performed after the step commits
    pub async fn record_external_call(
        &mut self,
        request: ExternalCallRequest,
    ) -> Result<WorkflowExternalCall, StoreError> {
        let call = ExternalCallGateway::record_intent(&mut *self.tx, request).await?;
        if call.status == ExternalCallStatus::Pending && !self.recorded_calls.contains(&call.id) {
            self.recorded_calls.push(call.id);
        }
        Ok(call)
    }

    /// Record an external call of `call_type` for the current activity
    pub async fn call(
        &mut self,
        call_type: ExternalCallType,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<WorkflowExternalCall, StoreError> {
        let mut request = ExternalCallRequest::new(
            self.instance_id,
            self.activity_id.clone(),
            call_type,
            endpoint,
            method,
        );
        request.payload = payload;
        self.record_external_call(request).await
    }

    /// Set a workflow variable; written with the step
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variable_updates.insert(name.into(), value);
    }

    /// Queue an event for delivery after commit
    pub async fn enqueue(&mut self, message: OutboxMessage) -> Result<(), StoreError> {
        self.tx.enqueue_outbox(&message).await
    }

    /// The step transaction itself
    pub fn transaction(&mut self) -> &mut dyn WorkflowTransaction {
        &mut *self.tx
    }

    pub(crate) fn into_parts(self) -> (Map<String, Value>, Vec<Uuid>) {
        (self.variable_updates, self.recorded_calls)
    }
}

/// Runs one activity of a workflow
///
/// Implementations interpret activity semantics; the orchestrator only
/// persists what they report. The step may be re-run after a transient
/// fault, so anything done outside `ctx` must be idempotent.
#[async_trait]
pub trait ActivityEngine: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        ctx: &mut StepContext<'_>,
        schema: &WorkflowSchema,
        instance: &WorkflowInstance,
        activity: &ActivityDefinition,
        input: Option<Value>,
        is_resume: bool,
        cancel: &CancellationToken,
    ) -> Result<WorkflowExecutionResult, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_stops_on_suspending_statuses() {
        assert!(ExecutionStatus::Pending.stops_loop());
        assert!(ExecutionStatus::Completed.stops_loop());
        assert!(ExecutionStatus::Failed.stops_loop());
        assert!(!ExecutionStatus::StepCompleted.stops_loop());
        assert!(!ExecutionStatus::Running.stops_loop());
    }

    #[test]
    fn test_result_constructors() {
        let result = WorkflowExecutionResult::step_completed(Some("ship".into()))
            .with_output(serde_json::json!({"ok": true}));
        assert_eq!(result.status, ExecutionStatus::StepCompleted);
        assert_eq!(result.next_activity_id.as_deref(), Some("ship"));

        let failed = WorkflowExecutionResult::failed("boom");
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.next_activity_id.is_none());
    }
}
