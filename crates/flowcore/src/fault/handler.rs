//! Fault handler: retry, suspend or give up

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::classification::{classify, FaultKind, RecommendedAction};
use super::compensation::CompensationPlan;
use crate::error::OrchestrationError;
use crate::model::{before_now, LogEventKind};
use crate::persistence::{IsolationLevel, StoreError, TransactionGateway, WorkflowTransaction};
use crate::reliability::{duration_millis, RetryPolicy};

/// Decision for one fault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultHandlingResult {
    pub fault_kind: FaultKind,
    pub should_retry: bool,
    pub suspend_workflow: bool,
    pub requires_manual_intervention: bool,
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    pub recommended_action: RecommendedAction,
    pub compensation_plan: Option<CompensationPlan>,
}

impl FaultHandlingResult {
    fn retry(fault_kind: FaultKind, delay: Duration) -> Self {
        Self {
            fault_kind,
            should_retry: true,
            suspend_workflow: false,
            requires_manual_intervention: false,
            retry_delay: delay,
            recommended_action: RecommendedAction::Retry,
            compensation_plan: None,
        }
    }

    fn stop(fault_kind: FaultKind, recommended_action: RecommendedAction) -> Self {
        Self {
            fault_kind,
            should_retry: false,
            suspend_workflow: false,
            requires_manual_intervention: recommended_action == RecommendedAction::ManualIntervention,
            retry_delay: Duration::ZERO,
            recommended_action,
            compensation_plan: None,
        }
    }

    fn suspend(fault_kind: FaultKind) -> Self {
        Self {
            suspend_workflow: true,
            requires_manual_intervention: true,
            ..Self::stop(fault_kind, RecommendedAction::Suspend)
        }
    }
}

/// Decides what happens after a fault in each orchestration context
#[derive(Clone)]
pub struct FaultHandler {
    gateway: TransactionGateway,
    activity_policy: RetryPolicy,
    external_call_policy: RetryPolicy,
    suspension_threshold: u64,
    failure_window: Duration,
}

impl FaultHandler {
    /// Defaults: 3 attempts at `min(2^n s, 30 s)` for startup, activity and
    /// resume faults; 5 attempts at `min(5^n s, 60 s)` for external calls;
    /// suspension after 5 activity failures in 30 minutes
    pub fn new(gateway: TransactionGateway) -> Self {
        Self {
            gateway,
            activity_policy: RetryPolicy::power_of(2.0, 3, Duration::from_secs(30)),
            external_call_policy: RetryPolicy::power_of(5.0, 5, Duration::from_secs(60)),
            suspension_threshold: 5,
            failure_window: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_activity_policy(mut self, policy: RetryPolicy) -> Self {
        self.activity_policy = policy;
        self
    }

    pub fn with_external_call_policy(mut self, policy: RetryPolicy) -> Self {
        self.external_call_policy = policy;
        self
    }

    pub fn with_suspension_threshold(mut self, failures: u64, window: Duration) -> Self {
        self.suspension_threshold = failures;
        self.failure_window = window;
        self
    }

    /// Fault while creating an instance or running its first steps
    pub fn handle_startup_fault(&self, error: &OrchestrationError, attempt: u32) -> FaultHandlingResult {
        self.decide(classify(error), attempt, &self.activity_policy, false)
    }

    /// Fault while resuming an instance from a bookmark
    pub fn handle_resume_fault(&self, error: &OrchestrationError, attempt: u32) -> FaultHandlingResult {
        self.decide(classify(error), attempt, &self.activity_policy, false)
    }

    /// Fault from an external call; downstream failures are retried too
    pub fn handle_external_call_fault(
        &self,
        error: &OrchestrationError,
        attempt: u32,
    ) -> FaultHandlingResult {
        self.decide(classify(error), attempt, &self.external_call_policy, true)
    }

    /// Fault from an activity; may suspend the instance
    ///
    /// Expects the failure to be logged as `ActivityFailed` already, so it
    /// counts toward the suspension threshold.
    #[instrument(skip(self, error), fields(error = %error))]
    pub async fn handle_activity_fault(
        &self,
        error: &OrchestrationError,
        attempt: u32,
        instance_id: Uuid,
    ) -> Result<FaultHandlingResult, StoreError> {
        let kind = classify(error);
        if self.should_suspend_workflow(instance_id, kind).await? {
            warn!(%instance_id, fault = %kind, "failure threshold reached, suspending");
            return Ok(FaultHandlingResult::suspend(kind));
        }

        let mut result = self.decide(kind, attempt, &self.activity_policy, false);
        if !result.should_retry && !kind.is_permanent() && kind != FaultKind::Cancelled {
            result.recommended_action = RecommendedAction::Compensate;
        }
        Ok(result)
    }

    /// Whether the instance has failed often enough to be suspended
    ///
    /// Counts `ActivityFailed` entries of any activity of the instance within
    /// the failure window. Cancellation never suspends.
    pub async fn should_suspend_workflow(
        &self,
        instance_id: Uuid,
        fault_kind: FaultKind,
    ) -> Result<bool, StoreError> {
        if fault_kind == FaultKind::Cancelled {
            return Ok(false);
        }

        let since = before_now(self.failure_window);
        let failures = self
            .gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move {
                    tx.count_logs(instance_id, LogEventKind::ActivityFailed, since).await
                })
            })
            .await?;

        debug!(%instance_id, failures, threshold = self.suspension_threshold, "counted recent activity failures");
        Ok(failures >= self.suspension_threshold)
    }

    /// Compensation plan for the instance's completed activities
    pub async fn create_compensation_plan(
        &self,
        instance_id: Uuid,
    ) -> Result<CompensationPlan, OrchestrationError> {
        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { Self::compensation_plan_in(tx, instance_id).await })
            })
            .await
    }

    /// [`create_compensation_plan`](Self::create_compensation_plan) inside an open transaction
    pub async fn compensation_plan_in(
        tx: &mut dyn WorkflowTransaction,
        instance_id: Uuid,
    ) -> Result<CompensationPlan, OrchestrationError> {
        let instance = tx
            .get_instance(instance_id)
            .await?
            .ok_or(OrchestrationError::InstanceNotFound(instance_id))?;
        let executions = tx.list_activity_executions(instance_id).await?;
        Ok(CompensationPlan::build(&instance, &executions))
    }

    fn decide(
        &self,
        kind: FaultKind,
        attempt: u32,
        policy: &RetryPolicy,
        retry_external: bool,
    ) -> FaultHandlingResult {
        let retryable = kind.is_retryable() || (retry_external && kind == FaultKind::ExternalService);
        if retryable && policy.has_attempts_remaining(attempt) {
            return FaultHandlingResult::retry(kind, policy.delay_after_failures(attempt));
        }

        let action = match kind {
            FaultKind::Validation
            | FaultKind::Authorization
            | FaultKind::NotSupported
            | FaultKind::WorkflowState
            | FaultKind::Cancelled => RecommendedAction::Fail,
            _ => RecommendedAction::ManualIntervention,
        };
        FaultHandlingResult::stop(kind, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::model::{ExecutionLogEntry, WorkflowInstance};
    use crate::persistence::{InMemoryWorkflowStore, WorkflowStore};
    use std::sync::Arc;

    fn handler(store: &InMemoryWorkflowStore) -> FaultHandler {
        FaultHandler::new(TransactionGateway::new(Arc::new(store.clone())))
    }

    async fn log_failures(store: &InMemoryWorkflowStore, instance_id: Uuid, count: usize) {
        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        for i in 0..count {
            tx.append_log(
                &ExecutionLogEntry::new(instance_id, LogEventKind::ActivityFailed, "boom")
                    .for_activity(format!("step-{i}")),
            )
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[test]
    fn test_validation_is_never_retried() {
        let store = InMemoryWorkflowStore::new();
        let result = handler(&store).handle_startup_fault(&OrchestrationError::Validation("bad".into()), 1);
        assert!(!result.should_retry);
        assert_eq!(result.recommended_action, RecommendedAction::Fail);
    }

    #[test]
    fn test_transient_backoff_and_exhaustion() {
        let store = InMemoryWorkflowStore::new();
        let handler = handler(&store);
        let error = OrchestrationError::Store(StoreError::Transient("deadlock".into()));

        let first = handler.handle_resume_fault(&error, 1);
        assert!(first.should_retry);
        assert_eq!(first.retry_delay, Duration::from_secs(2));
        assert_eq!(handler.handle_resume_fault(&error, 2).retry_delay, Duration::from_secs(4));

        let exhausted = handler.handle_resume_fault(&error, 3);
        assert!(!exhausted.should_retry);
        assert!(exhausted.requires_manual_intervention);
    }

    #[test]
    fn test_external_service_retried_only_for_calls() {
        let store = InMemoryWorkflowStore::new();
        let handler = handler(&store);
        let error = OrchestrationError::ExternalService("502".into());

        assert!(!handler.handle_startup_fault(&error, 1).should_retry);
        let call = handler.handle_external_call_fault(&error, 2);
        assert!(call.should_retry);
        assert_eq!(call.retry_delay, Duration::from_secs(25));
        assert_eq!(handler.handle_external_call_fault(&error, 4).retry_delay, Duration::from_secs(60));
        assert!(!handler.handle_external_call_fault(&error, 5).should_retry);
    }

    #[tokio::test]
    async fn test_suspension_threshold() {
        let store = InMemoryWorkflowStore::new();
        let handler = handler(&store);
        let instance = WorkflowInstance::new(Uuid::now_v7(), "wf", "alice");

        log_failures(&store, instance.id, 4).await;
        assert!(!handler.should_suspend_workflow(instance.id, FaultKind::Unknown).await.unwrap());

        log_failures(&store, instance.id, 1).await;
        assert!(handler.should_suspend_workflow(instance.id, FaultKind::Unknown).await.unwrap());
        assert!(!handler.should_suspend_workflow(instance.id, FaultKind::Cancelled).await.unwrap());
    }

    #[tokio::test]
    async fn test_activity_fault_decisions() {
        let store = InMemoryWorkflowStore::new();
        let handler = handler(&store);
        let instance_id = Uuid::now_v7();
        let transient = OrchestrationError::Engine(EngineError::Transient("flaky".into()));
        let failed = OrchestrationError::Engine(EngineError::Failed("rejected".into()));

        let retry = handler.handle_activity_fault(&transient, 1, instance_id).await.unwrap();
        assert!(retry.should_retry);

        let give_up = handler.handle_activity_fault(&failed, 1, instance_id).await.unwrap();
        assert!(!give_up.should_retry);
        assert_eq!(give_up.recommended_action, RecommendedAction::Compensate);

        log_failures(&store, instance_id, 5).await;
        let suspend = handler.handle_activity_fault(&transient, 1, instance_id).await.unwrap();
        assert!(suspend.suspend_workflow);
        assert!(!suspend.should_retry);
        assert_eq!(suspend.recommended_action, RecommendedAction::Suspend);
    }
}
