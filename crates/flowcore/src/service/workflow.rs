//! Workflow service facade
//!
//! Entry point for hosts: start, resume and cancel instances, consume
//! bookmarks and query state. Retries faults the fault handler marks
//! retryable and publishes lifecycle events after the work commits.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::events::{EventPublisher, PublishError, TracingEventPublisher};
use crate::bookmark::{BookmarkStore, ConsumeOutcome, WORKFLOW_CLOSED_ACTOR};
use crate::engine::Orchestrator;
use crate::error::OrchestrationError;
use crate::fault::{FaultHandler, FaultHandlingResult};
use crate::model::{
    ActivityExecutionStatus, ExecutionLogEntry, InstanceStatus, LogEventKind,
    WorkflowActivityExecution, WorkflowInstance,
};
use crate::persistence::{
    load_schema_in, IsolationLevel, StoreError, TransactionGateway, WorkflowTransaction,
};
use crate::reliability::RetryPolicy;
use crate::schema::SchemaLimits;

/// Parameters for starting an instance
#[derive(Debug, Clone, PartialEq)]
pub struct StartWorkflowRequest {
    pub definition_id: Uuid,
    pub started_by: String,
    pub correlation_id: Option<String>,
    pub variables: Map<String, Value>,
    /// Caller-chosen id; starting twice with the same id yields one instance
    pub instance_id: Option<Uuid>,
}

impl StartWorkflowRequest {
    pub fn new(definition_id: Uuid, started_by: impl Into<String>) -> Self {
        Self {
            definition_id,
            started_by: started_by.into(),
            correlation_id: None,
            variables: Map::new(),
            instance_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }
}

/// Facade over the orchestrator, bookmarks and fault handling
#[derive(Clone)]
pub struct WorkflowService {
    gateway: TransactionGateway,
    orchestrator: Orchestrator,
    bookmarks: BookmarkStore,
    fault_handler: FaultHandler,
    publisher: Arc<dyn EventPublisher>,
    publish_policy: RetryPolicy,
    max_attempts: u32,
}

impl WorkflowService {
    pub fn new(gateway: TransactionGateway, orchestrator: Orchestrator) -> Self {
        Self {
            bookmarks: BookmarkStore::new(gateway.clone()),
            fault_handler: orchestrator.fault_handler().clone(),
            gateway,
            orchestrator,
            publisher: Arc::new(TracingEventPublisher),
            publish_policy: RetryPolicy::exponential()
                .with_max_attempts(3)
                .with_initial_interval(std::time::Duration::from_millis(100))
                .with_max_interval(std::time::Duration::from_secs(2)),
            max_attempts: 3,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Retry policy for publishing lifecycle events
    pub fn with_publish_policy(mut self, policy: RetryPolicy) -> Self {
        self.publish_policy = policy;
        self
    }

    /// Attempts for start and resume before a fault is surfaced
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn bookmarks(&self) -> &BookmarkStore {
        &self.bookmarks
    }

    /// Create an instance and run it until it waits, finishes or fails
    ///
    /// Creation is idempotent on the instance id, so a retried attempt picks
    /// up the instance the previous attempt created.
    #[instrument(skip(self, request, cancel), fields(definition_id = %request.definition_id))]
    pub async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkflowInstance, OrchestrationError> {
        let instance_id = request.instance_id.unwrap_or_else(Uuid::now_v7);
        let mut attempt = 1;
        let instance = loop {
            let outcome = self
                .gateway
                .execute_database_operation(|| self.start_attempt(instance_id, &request, cancel))
                .await;

            match outcome {
                Ok(instance) => break instance,
                Err(error) => {
                    let decision = self.fault_handler.handle_startup_fault(&error, attempt);
                    self.wait_or_surface(error, decision, attempt, cancel).await?;
                    attempt += 1;
                }
            }
        };

        info!(%instance_id, status = %instance.status, "workflow started");
        let correlation_id = instance.correlation_id.clone();
        self.publish("workflow_started", || {
            self.publisher.workflow_started(
                instance.id,
                &instance.name,
                &instance.started_by,
                correlation_id.as_deref(),
            )
        })
        .await;
        self.publish_outcome(&instance).await;
        Ok(instance)
    }

    async fn start_attempt(
        &self,
        instance_id: Uuid,
        request: &StartWorkflowRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkflowInstance, OrchestrationError> {
        let limits = self.gateway.schema_limits().clone();
        let request = request.clone();
        let instance = self
            .gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let (limits, request) = (limits.clone(), request.clone());
                Box::pin(async move { Self::create_instance_in(tx, instance_id, request, &limits).await })
            })
            .await?;

        if instance.status.is_runnable() {
            self.orchestrator
                .execute_complete_workflow(instance.id, self.orchestrator.max_steps(), cancel)
                .await?;
        }
        self.get_workflow_instance(instance.id).await
    }

    async fn create_instance_in(
        tx: &mut dyn WorkflowTransaction,
        instance_id: Uuid,
        request: StartWorkflowRequest,
        limits: &SchemaLimits,
    ) -> Result<WorkflowInstance, OrchestrationError> {
        if let Some(existing) = tx.get_instance(instance_id).await? {
            debug!(%instance_id, "instance already created");
            return Ok(existing);
        }

        let schema = load_schema_in(tx, request.definition_id, limits).await?;
        let instance = WorkflowInstance::new(request.definition_id, &schema.name, &request.started_by)
            .with_id(instance_id)
            .with_correlation_id(request.correlation_id)
            .with_variables(request.variables);
        tx.insert_instance(&instance).await?;
        tx.append_log(
            &ExecutionLogEntry::new(
                instance_id,
                LogEventKind::WorkflowStarted,
                format!("workflow '{}' started", schema.name),
            )
            .by(&instance.started_by),
        )
        .await?;
        Ok(instance)
    }

    /// Continue an instance from the activity whose bookmark was consumed
    #[instrument(skip(self, input, cancel))]
    pub async fn resume_workflow(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        input: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowInstance, OrchestrationError> {
        let mut attempt = 1;
        loop {
            let outcome = self
                .orchestrator
                .continue_workflow_execution(instance_id, activity_id, input.clone(), cancel)
                .await;

            match outcome {
                Ok(_) => break,
                Err(error) => {
                    let decision = self.fault_handler.handle_resume_fault(&error, attempt);
                    self.wait_or_surface(error, decision, attempt, cancel).await?;
                    attempt += 1;
                }
            }
        }

        let instance = self.get_workflow_instance(instance_id).await?;
        let executions = self.list_executions(instance_id).await?;
        let resumed_activity_completed = executions
            .iter()
            .rev()
            .find(|e| e.activity_id == activity_id)
            .is_some_and(|e| e.status == ActivityExecutionStatus::Completed);

        if resumed_activity_completed {
            self.publish("activity_completed", || {
                self.publisher.activity_completed(
                    instance_id,
                    activity_id,
                    instance.correlation_id.as_deref(),
                )
            })
            .await;
        }
        self.publish_outcome(&instance).await;
        info!(status = %instance.status, "workflow resumed");
        Ok(instance)
    }

    /// Cancel an instance and its open activity executions
    #[instrument(skip(self))]
    pub async fn cancel_workflow(
        &self,
        instance_id: Uuid,
        reason: &str,
        cancelled_by: &str,
    ) -> Result<WorkflowInstance, OrchestrationError> {
        let (reason_owned, actor) = (reason.to_string(), cancelled_by.to_string());
        let instance = self
            .gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let (reason, actor) = (reason_owned.clone(), actor.clone());
                Box::pin(async move { Self::cancel_in(tx, instance_id, &reason, &actor).await })
            })
            .await?;

        info!(%instance_id, "workflow cancelled");
        self.publish("workflow_cancelled", || {
            self.publisher.workflow_cancelled(
                instance_id,
                reason,
                cancelled_by,
                instance.correlation_id.as_deref(),
            )
        })
        .await;
        Ok(instance)
    }

    async fn cancel_in(
        tx: &mut dyn WorkflowTransaction,
        instance_id: Uuid,
        reason: &str,
        cancelled_by: &str,
    ) -> Result<WorkflowInstance, OrchestrationError> {
        let mut instance = tx
            .get_instance_for_update(instance_id)
            .await?
            .ok_or(OrchestrationError::InstanceNotFound(instance_id))?;
        if instance.status.is_terminal() {
            return Err(OrchestrationError::NotRunnable {
                instance_id,
                status: instance.status,
            });
        }

        for mut execution in tx.list_activity_executions(instance_id).await? {
            if execution.is_open() {
                execution.close(ActivityExecutionStatus::Cancelled, None, Some(reason.to_string()));
                tx.update_activity_execution(&execution).await?;
            }
        }

        instance.finish(InstanceStatus::Cancelled, None);
        tx.update_instance(&instance).await?;
        BookmarkStore::release_open_in(tx, instance_id, WORKFLOW_CLOSED_ACTOR).await?;
        tx.append_log(
            &ExecutionLogEntry::new(instance_id, LogEventKind::WorkflowCancelled, "workflow cancelled")
                .by(cancelled_by)
                .with_metadata(json!({ "Reason": reason })),
        )
        .await?;
        Ok(instance)
    }

    /// Consume the unconsumed bookmark for (instance, activity, key)
    pub async fn consume_bookmark(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        key: &str,
        consumed_by: &str,
        output: Option<Value>,
    ) -> Result<ConsumeOutcome, StoreError> {
        self.bookmarks
            .consume_bookmark(instance_id, activity_id, key, consumed_by, output)
            .await
    }

    pub async fn get_workflow_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<WorkflowInstance, OrchestrationError> {
        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.get_instance(instance_id).await })
            })
            .await?
            .ok_or(OrchestrationError::InstanceNotFound(instance_id))
    }

    /// Open activity executions assigned to `assignee` on running instances
    pub async fn get_user_tasks(
        &self,
        assignee: &str,
    ) -> Result<Vec<WorkflowActivityExecution>, StoreError> {
        let assignee = assignee.to_string();
        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let assignee = assignee.clone();
                Box::pin(async move { tx.list_open_executions_for_assignee(&assignee).await })
            })
            .await
    }

    /// Open activity executions of an instance
    pub async fn get_current_activities(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowActivityExecution>, StoreError> {
        let mut executions = self.list_executions(instance_id).await?;
        executions.retain(WorkflowActivityExecution::is_open);
        Ok(executions)
    }

    /// Execution log of an instance, oldest first
    pub async fn get_execution_log(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.list_logs(instance_id).await })
            })
            .await
    }

    async fn list_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowActivityExecution>, StoreError> {
        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.list_activity_executions(instance_id).await })
            })
            .await
    }

    /// Sleep before the next attempt, or return the fault to the caller
    async fn wait_or_surface(
        &self,
        error: OrchestrationError,
        decision: FaultHandlingResult,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestrationError> {
        if decision.should_retry && attempt < self.max_attempts {
            warn!(attempt, error = %error, delay_ms = decision.retry_delay.as_millis() as u64, "retrying after fault");
            tokio::select! {
                _ = cancel.cancelled() => return Err(OrchestrationError::Cancelled),
                _ = tokio::time::sleep(decision.retry_delay) => {}
            }
            return Ok(());
        }

        warn!(attempt, error = %error, action = %decision.recommended_action, "giving up");
        if decision.fault_kind.is_permanent() || matches!(error, OrchestrationError::Cancelled) {
            return Err(error);
        }
        Err(OrchestrationError::Exhausted {
            message: error.to_string(),
            recommendation: decision.recommended_action,
        })
    }

    async fn publish_outcome(&self, instance: &WorkflowInstance) {
        let correlation_id = instance.correlation_id.as_deref();
        match instance.status {
            InstanceStatus::Completed => {
                let completed_at = instance.completed_at.unwrap_or_else(Utc::now);
                self.publish("workflow_completed", || {
                    self.publisher
                        .workflow_completed(instance.id, completed_at, correlation_id)
                })
                .await;
            }
            InstanceStatus::Failed => {
                let error = instance.last_error.as_deref().unwrap_or("workflow failed");
                self.publish("workflow_failed", || {
                    self.publisher.workflow_failed(instance.id, error, correlation_id)
                })
                .await;
            }
            _ => {}
        }
    }

    /// Publish with retry; a final failure is logged, never surfaced
    async fn publish<F, Fut>(&self, event: &'static str, mut op: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), PublishError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return,
                Err(e) if self.publish_policy.has_attempts_remaining(attempt) => {
                    debug!(event, attempt, error = %e, "publish failed, retrying");
                    tokio::time::sleep(self.publish_policy.delay_after_failures(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(event, error = %e, "could not publish event");
                    return;
                }
            }
        }
    }
}
