//! Step-wise orchestration
//!
//! Each step is one transaction: lock the instance, load the schema, open or
//! reuse the activity execution, run the engine and persist what it reports.
//! External calls recorded by the engine are performed after commit.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::contract::{ActivityEngine, ExecutionStatus, StepContext, WorkflowExecutionResult};
use crate::bookmark::{BookmarkStore, WORKFLOW_CLOSED_ACTOR};
use crate::error::OrchestrationError;
use crate::external_call::ExternalCallGateway;
use crate::fault::{classify_engine, CompensationPlan, FaultHandler, FaultKind};
use crate::model::{
    ActivityExecutionStatus, ExecutionLogEntry, InstanceStatus, LogEventKind,
    WorkflowActivityExecution, WorkflowInstance,
};
use crate::persistence::{load_schema_in, IsolationLevel, TransactionGateway, WorkflowTransaction};
use crate::schema::SchemaLimits;

/// Default step budget of one orchestration loop
pub const DEFAULT_MAX_STEPS: usize = 100;

const INFINITE_LOOP_ERROR: &str = "possible infinite loop";

struct StepOutcome {
    result: WorkflowExecutionResult,
    recorded_calls: Vec<Uuid>,
}

/// Drives workflow instances one activity at a time
#[derive(Clone)]
pub struct Orchestrator {
    gateway: TransactionGateway,
    engine: Arc<dyn ActivityEngine>,
    fault_handler: FaultHandler,
    external_calls: Option<ExternalCallGateway>,
    max_steps: usize,
}

impl Orchestrator {
    pub fn new(gateway: TransactionGateway, engine: Arc<dyn ActivityEngine>) -> Self {
        Self {
            fault_handler: FaultHandler::new(gateway.clone()),
            gateway,
            engine,
            external_calls: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_fault_handler(mut self, fault_handler: FaultHandler) -> Self {
        self.fault_handler = fault_handler;
        self
    }

    /// Perform calls recorded during a step right after it commits
    ///
    /// Without a gateway, recorded calls stay `Pending` for another process
    /// to execute.
    pub fn with_external_calls(mut self, external_calls: ExternalCallGateway) -> Self {
        self.external_calls = Some(external_calls);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn fault_handler(&self) -> &FaultHandler {
        &self.fault_handler
    }

    /// Run one activity in one transaction
    ///
    /// Engine errors roll the step back, are logged as `ActivityFailed` and
    /// go through the fault handler, which retries the step, suspends the
    /// instance or fails it. For `StepCompleted` the result carries the
    /// resolved next activity (the engine's choice or the schema's default
    /// transition); `None` means the workflow ended with this step.
    #[instrument(skip(self, input, cancel))]
    pub async fn execute_single_step(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        input: Option<Value>,
        is_resume: bool,
        cancel: &CancellationToken,
    ) -> Result<WorkflowExecutionResult, OrchestrationError> {
        let mut attempt = 1;
        loop {
            let error = match self
                .run_step(instance_id, activity_id, input.clone(), is_resume, cancel)
                .await
            {
                Ok(outcome) => {
                    debug!(status = ?outcome.result.status, "step committed");
                    self.perform_recorded_calls(outcome.recorded_calls, cancel).await;
                    return Ok(outcome.result);
                }
                Err(OrchestrationError::Engine(error)) => error,
                Err(other) => return Err(other),
            };

            warn!(attempt, error = %error, "activity failed");
            let kind = classify_engine(&error);
            let message = error.to_string();
            self.record_activity_failure(instance_id, activity_id, &message, kind, attempt)
                .await?;

            if kind == FaultKind::Cancelled {
                return Err(OrchestrationError::Cancelled);
            }

            let error = OrchestrationError::Engine(error);
            let decision = self
                .fault_handler
                .handle_activity_fault(&error, attempt, instance_id)
                .await?;

            if decision.suspend_workflow {
                self.close_instance(instance_id, activity_id, InstanceStatus::Suspended, &message)
                    .await?;
                return Ok(WorkflowExecutionResult::failed(message));
            }

            if decision.should_retry {
                debug!(delay_ms = decision.retry_delay.as_millis() as u64, "retrying step");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OrchestrationError::Cancelled),
                    _ = tokio::time::sleep(decision.retry_delay) => {}
                }
                attempt += 1;
                continue;
            }

            self.close_instance(instance_id, activity_id, InstanceStatus::Failed, &message)
                .await?;
            return Ok(WorkflowExecutionResult::failed(message));
        }
    }

    /// Run steps from the instance's current activity until it waits,
    /// finishes or fails, or `max_steps` run out
    #[instrument(skip(self, cancel))]
    pub async fn execute_complete_workflow(
        &self,
        instance_id: Uuid,
        max_steps: usize,
        cancel: &CancellationToken,
    ) -> Result<WorkflowExecutionResult, OrchestrationError> {
        let limits = self.gateway.schema_limits().clone();
        let activity_id = self
            .gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let limits = limits.clone();
                Box::pin(async move { Self::current_activity_in(tx, instance_id, &limits).await })
            })
            .await?;

        self.run_loop(instance_id, activity_id, None, max_steps, cancel)
            .await
    }

    /// Resume from a bookmark: one resume step, then the regular loop
    #[instrument(skip(self, input, cancel))]
    pub async fn continue_workflow_execution(
        &self,
        instance_id: Uuid,
        from_activity_id: &str,
        input: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowExecutionResult, OrchestrationError> {
        let result = self
            .execute_single_step(instance_id, from_activity_id, input, true, cancel)
            .await?;

        match (result.status, result.next_activity_id.clone()) {
            (ExecutionStatus::StepCompleted, Some(next)) => {
                self.run_loop(
                    instance_id,
                    next,
                    result.output,
                    self.max_steps.saturating_sub(1),
                    cancel,
                )
                .await
            }
            (ExecutionStatus::StepCompleted, None) => Ok(Self::finished(result)),
            _ => Ok(result),
        }
    }

    async fn run_loop(
        &self,
        instance_id: Uuid,
        mut activity_id: String,
        mut input: Option<Value>,
        max_steps: usize,
        cancel: &CancellationToken,
    ) -> Result<WorkflowExecutionResult, OrchestrationError> {
        for _ in 0..max_steps {
            if cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }

            let result = self
                .execute_single_step(instance_id, &activity_id, input.take(), false, cancel)
                .await?;

            match result.status {
                ExecutionStatus::StepCompleted => match &result.next_activity_id {
                    Some(next) => {
                        activity_id = next.clone();
                        input = result.output;
                    }
                    None => return Ok(Self::finished(result)),
                },
                ExecutionStatus::Running => {}
                ExecutionStatus::Pending | ExecutionStatus::Completed | ExecutionStatus::Failed => {
                    return Ok(result)
                }
            }
        }

        warn!(%instance_id, max_steps, "step budget exhausted");
        self.close_instance(instance_id, &activity_id, InstanceStatus::Failed, INFINITE_LOOP_ERROR)
            .await?;
        Ok(WorkflowExecutionResult::failed(INFINITE_LOOP_ERROR))
    }

    fn finished(result: WorkflowExecutionResult) -> WorkflowExecutionResult {
        WorkflowExecutionResult {
            status: ExecutionStatus::Completed,
            ..result
        }
    }

    async fn run_step(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        input: Option<Value>,
        is_resume: bool,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, OrchestrationError> {
        let engine = self.engine.clone();
        let limits = self.gateway.schema_limits().clone();
        let activity_id = activity_id.to_string();
        let cancel = cancel.clone();

        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let (engine, limits, activity_id, input, cancel) = (
                    engine.clone(),
                    limits.clone(),
                    activity_id.clone(),
                    input.clone(),
                    cancel.clone(),
                );
                Box::pin(async move {
                    Self::step_in(tx, engine, &limits, instance_id, &activity_id, input, is_resume, &cancel)
                        .await
                })
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn step_in(
        tx: &mut dyn WorkflowTransaction,
        engine: Arc<dyn ActivityEngine>,
        limits: &SchemaLimits,
        instance_id: Uuid,
        activity_id: &str,
        input: Option<Value>,
        is_resume: bool,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, OrchestrationError> {
        let mut instance = tx
            .get_instance_for_update(instance_id)
            .await?
            .ok_or(OrchestrationError::InstanceNotFound(instance_id))?;
        if !instance.status.is_runnable() {
            return Err(OrchestrationError::NotRunnable {
                instance_id,
                status: instance.status,
            });
        }

        let schema = load_schema_in(tx, instance.definition_id, limits).await?;
        let activity = schema
            .activity(activity_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::ActivityNotFound {
                activity_id: activity_id.to_string(),
            })?;

        instance.status = InstanceStatus::Running;
        instance.current_activity_id = Some(activity.id.clone());

        let mut execution = match tx.find_open_activity_execution(instance_id, &activity.id).await? {
            Some(open) => open,
            None => {
                let mut execution = WorkflowActivityExecution::start(
                    instance_id,
                    &activity.id,
                    &activity.name,
                    &activity.activity_type,
                    input.clone(),
                );
                execution.assignee = activity.assignee.clone();
                tx.insert_activity_execution(&execution).await?;
                tx.append_log(
                    &ExecutionLogEntry::new(
                        instance_id,
                        LogEventKind::ActivityStarted,
                        format!("activity '{}' started", activity.id),
                    )
                    .for_activity(&activity.id),
                )
                .await?;
                execution
            }
        };

        let mut ctx = StepContext::new(&mut *tx, instance_id, activity.id.clone());
        let mut result = engine
            .execute(&mut ctx, &schema, &instance, &activity, input, is_resume, cancel)
            .await?;
        let (variable_updates, recorded_calls) = ctx.into_parts();
        instance.variables.extend(variable_updates);

        match result.status {
            ExecutionStatus::Running | ExecutionStatus::Pending => {}
            ExecutionStatus::StepCompleted => {
                Self::complete_execution(tx, &mut execution, result.output.clone()).await?;

                let next = result
                    .next_activity_id
                    .clone()
                    .or_else(|| schema.default_next(&activity.id).map(str::to_string));
                match next {
                    Some(next) => {
                        if schema.activity(&next).is_none() {
                            return Err(OrchestrationError::ActivityNotFound { activity_id: next });
                        }
                        instance.current_activity_id = Some(next.clone());
                        result.next_activity_id = Some(next);
                    }
                    None => Self::complete_instance(tx, &mut instance).await?,
                }
            }
            ExecutionStatus::Completed => {
                Self::complete_execution(tx, &mut execution, result.output.clone()).await?;
                Self::complete_instance(tx, &mut instance).await?;
            }
            ExecutionStatus::Failed => {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("activity '{}' failed", activity.id));
                execution.close(ActivityExecutionStatus::Failed, result.output.clone(), Some(error.clone()));
                tx.update_activity_execution(&execution).await?;
                tx.append_log(
                    &ExecutionLogEntry::new(instance_id, LogEventKind::ActivityFailed, &error)
                        .for_activity(&activity.id),
                )
                .await?;
                instance.finish(InstanceStatus::Failed, Some(error.clone()));
                let executions = tx.list_activity_executions(instance_id).await?;
                let plan = CompensationPlan::build(&instance, &executions);
                tx.append_log(
                    &ExecutionLogEntry::new(instance_id, LogEventKind::WorkflowFailed, &error)
                        .for_activity(&activity.id)
                        .with_metadata(json!({ "CompensationPlan": plan })),
                )
                .await?;
            }
        }

        tx.update_instance(&instance).await?;
        if instance.status.is_terminal() {
            BookmarkStore::release_open_in(tx, instance_id, WORKFLOW_CLOSED_ACTOR).await?;
        }
        info!(%instance_id, activity_id = %activity.id, status = ?result.status, "step executed");
        Ok(StepOutcome {
            result,
            recorded_calls,
        })
    }

    async fn complete_execution(
        tx: &mut dyn WorkflowTransaction,
        execution: &mut WorkflowActivityExecution,
        output: Option<Value>,
    ) -> Result<(), OrchestrationError> {
        execution.close(ActivityExecutionStatus::Completed, output, None);
        tx.update_activity_execution(execution).await?;
        tx.append_log(
            &ExecutionLogEntry::new(
                execution.instance_id,
                LogEventKind::ActivityCompleted,
                format!("activity '{}' completed", execution.activity_id),
            )
            .for_activity(&execution.activity_id),
        )
        .await?;
        Ok(())
    }

    async fn complete_instance(
        tx: &mut dyn WorkflowTransaction,
        instance: &mut WorkflowInstance,
    ) -> Result<(), OrchestrationError> {
        instance.finish(InstanceStatus::Completed, None);
        instance.current_activity_id = None;
        tx.append_log(&ExecutionLogEntry::new(
            instance.id,
            LogEventKind::WorkflowCompleted,
            "workflow completed",
        ))
        .await?;
        Ok(())
    }

    async fn current_activity_in(
        tx: &mut dyn WorkflowTransaction,
        instance_id: Uuid,
        limits: &SchemaLimits,
    ) -> Result<String, OrchestrationError> {
        let instance = tx
            .get_instance(instance_id)
            .await?
            .ok_or(OrchestrationError::InstanceNotFound(instance_id))?;
        if let Some(current) = instance.current_activity_id {
            return Ok(current);
        }

        let schema = load_schema_in(tx, instance.definition_id, limits).await?;
        schema
            .start_activity()
            .map(|a| a.id.clone())
            .ok_or_else(|| OrchestrationError::Validation(format!("schema '{}' has no activities", schema.name)))
    }

    async fn record_activity_failure(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        message: &str,
        kind: FaultKind,
        attempt: u32,
    ) -> Result<(), OrchestrationError> {
        let entry = ExecutionLogEntry::new(instance_id, LogEventKind::ActivityFailed, message)
            .for_activity(activity_id)
            .with_metadata(json!({ "Attempt": attempt, "FaultKind": kind.as_str() }));

        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let entry = entry.clone();
                Box::pin(async move { tx.append_log(&entry).await })
            })
            .await?;
        Ok(())
    }

    /// Move the instance to `Suspended` or `Failed` and close its open
    /// execution of `activity_id`
    async fn close_instance(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        status: InstanceStatus,
        error: &str,
    ) -> Result<(), OrchestrationError> {
        let activity_id = activity_id.to_string();
        let error = error.to_string();
        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let (activity_id, error) = (activity_id.clone(), error.clone());
                Box::pin(async move {
                    Self::close_instance_in(tx, instance_id, &activity_id, status, &error).await
                })
            })
            .await
    }

    async fn close_instance_in(
        tx: &mut dyn WorkflowTransaction,
        instance_id: Uuid,
        activity_id: &str,
        status: InstanceStatus,
        error: &str,
    ) -> Result<(), OrchestrationError> {
        let mut instance = tx
            .get_instance_for_update(instance_id)
            .await?
            .ok_or(OrchestrationError::InstanceNotFound(instance_id))?;
        if instance.status.is_terminal() {
            return Ok(());
        }

        if let Some(mut execution) = tx.find_open_activity_execution(instance_id, activity_id).await? {
            execution.close(ActivityExecutionStatus::Failed, None, Some(error.to_string()));
            tx.update_activity_execution(&execution).await?;
        }

        let kind = if status == InstanceStatus::Suspended {
            instance.status = InstanceStatus::Suspended;
            instance.last_error = Some(error.to_string());
            LogEventKind::WorkflowSuspended
        } else {
            instance.finish(status, Some(error.to_string()));
            LogEventKind::WorkflowFailed
        };
        tx.update_instance(&instance).await?;
        if instance.status.is_terminal() {
            BookmarkStore::release_open_in(tx, instance_id, WORKFLOW_CLOSED_ACTOR).await?;
        }

        let executions = tx.list_activity_executions(instance_id).await?;
        let plan = CompensationPlan::build(&instance, &executions);
        tx.append_log(
            &ExecutionLogEntry::new(instance_id, kind, error)
                .for_activity(activity_id)
                .with_metadata(json!({ "CompensationPlan": plan })),
        )
        .await?;

        warn!(%instance_id, status = %instance.status, strategy = %plan.strategy, "workflow stopped");
        Ok(())
    }

    async fn perform_recorded_calls(&self, call_ids: Vec<Uuid>, cancel: &CancellationToken) {
        let Some(gateway) = &self.external_calls else {
            return;
        };
        for call_id in call_ids {
            if let Err(e) = gateway.execute(call_id, cancel).await {
                // The row stays visible to the retry sweep
                warn!(%call_id, error = %e, "could not execute recorded external call");
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("max_steps", &self.max_steps)
            .field("external_calls", &self.external_calls.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::model::WorkflowDefinitionRecord;
    use crate::persistence::InMemoryWorkflowStore;
    use crate::reliability::RetryPolicy;
    use crate::schema::{ActivityDefinition, WorkflowSchema};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` calls, then completes the step
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: fn() -> EngineError,
    }

    #[async_trait]
    impl ActivityEngine for Flaky {
        async fn execute(
            &self,
            ctx: &mut StepContext<'_>,
            _schema: &WorkflowSchema,
            _instance: &WorkflowInstance,
            _activity: &ActivityDefinition,
            _input: Option<Value>,
            _is_resume: bool,
            _cancel: &CancellationToken,
        ) -> Result<WorkflowExecutionResult, EngineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.set_variable("calls", json!(call + 1));
            if call < self.failures {
                return Err((self.error)());
            }
            Ok(WorkflowExecutionResult::step_completed(None))
        }
    }

    async fn setup(
        engine: Arc<dyn ActivityEngine>,
        schema: WorkflowSchema,
    ) -> (InMemoryWorkflowStore, Orchestrator, Uuid) {
        let store = InMemoryWorkflowStore::new();
        let gateway = TransactionGateway::new(Arc::new(store.clone()))
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(1), 3));
        let definition =
            WorkflowDefinitionRecord::new(&schema.name, 1, serde_json::to_string(&schema).unwrap());
        let definition = gateway.register_definition(definition).await.unwrap();

        let instance = WorkflowInstance::new(definition.id, &schema.name, "alice");
        let id = instance.id;
        gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let instance = instance.clone();
                Box::pin(async move { tx.insert_instance(&instance).await })
            })
            .await
            .unwrap();

        (store, Orchestrator::new(gateway, engine), id)
    }

    async fn instance(orchestrator: &Orchestrator, id: Uuid) -> WorkflowInstance {
        orchestrator
            .gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.get_instance(id).await })
            })
            .await
            .unwrap()
            .unwrap()
    }

    fn single() -> WorkflowSchema {
        WorkflowSchema::new("single").with_activity(ActivityDefinition::new("only", "Task"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_engine_fault_retries_step() {
        let engine = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            error: || EngineError::Transient("flaky".into()),
        });
        let (_store, orchestrator, id) = setup(engine, single()).await;

        let result = orchestrator
            .execute_complete_workflow(id, 10, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);

        let instance = instance(&orchestrator, id).await;
        assert_eq!(instance.status, InstanceStatus::Completed);
        // Rolled-back attempts leave no variable writes behind
        assert_eq!(instance.variables["calls"], json!(3));
    }

    #[tokio::test]
    async fn test_business_failure_fails_instance() {
        let engine = Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
            error: || EngineError::Failed("rejected".into()),
        });
        let (_store, orchestrator, id) = setup(engine, single()).await;

        let result = orchestrator
            .execute_complete_workflow(id, 10, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);

        let instance = instance(&orchestrator, id).await;
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert!(instance.last_error.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_not_runnable_instance_is_rejected() {
        let engine = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
            error: || EngineError::Cancelled,
        });
        let (_store, orchestrator, id) = setup(engine, single()).await;
        let cancel = CancellationToken::new();

        orchestrator.execute_complete_workflow(id, 10, &cancel).await.unwrap();
        let err = orchestrator
            .execute_single_step(id, "only", None, false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::NotRunnable {
                status: InstanceStatus::Completed,
                ..
            }
        ));
    }
}
