//! Compensation plans
//!
//! A plan lists the completed activities of an instance newest-first, each
//! with the action that would unwind it. Plans are advisory: nothing here
//! executes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    text_enum, ActivityExecutionStatus, InstanceStatus, WorkflowActivityExecution,
    WorkflowInstance,
};

/// How to unwind one completed activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationAction {
    /// Send a reversing call to the system the activity talked to
    ReverseExternalEffect,
    /// Restore data the activity changed
    UndoDataMutation,
    /// Nothing to undo; record it
    LogOnly,
}

text_enum!(CompensationAction, "compensation action", {
    ReverseExternalEffect => "reverse_external_effect",
    UndoDataMutation => "undo_data_mutation",
    LogOnly => "log_only",
});

impl CompensationAction {
    /// Pick an action from the activity type name
    pub fn for_activity_type(activity_type: &str) -> Self {
        let activity_type = activity_type.to_ascii_lowercase();
        let mentions = |words: &[&str]| words.iter().any(|w| activity_type.contains(w));

        if mentions(&["http", "api", "email", "notification", "external"]) {
            Self::ReverseExternalEffect
        } else if mentions(&["data", "update", "mutation", "database"]) {
            Self::UndoDataMutation
        } else {
            Self::LogOnly
        }
    }

    /// Skipping this action leaves the instance's data inconsistent
    pub fn is_required(&self) -> bool {
        matches!(self, Self::UndoDataMutation)
    }
}

/// Overall approach for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    /// Undo completed steps, newest first
    Rollback,
    /// Fix the cause and resume from the failed step
    Forward,
    ManualIntervention,
    Ignore,
}

text_enum!(CompensationStrategy, "compensation strategy", {
    Rollback => "rollback",
    Forward => "forward",
    ManualIntervention => "manual_intervention",
    Ignore => "ignore",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStep {
    pub execution_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub action: CompensationAction,
    pub required: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationPlan {
    pub instance_id: Uuid,
    pub strategy: CompensationStrategy,
    pub steps: Vec<CompensationStep>,
    pub created_at: DateTime<Utc>,
}

impl CompensationPlan {
    /// Build a plan from an instance and its executions
    pub fn build(instance: &WorkflowInstance, executions: &[WorkflowActivityExecution]) -> Self {
        let mut completed: Vec<&WorkflowActivityExecution> = executions
            .iter()
            .filter(|e| e.status == ActivityExecutionStatus::Completed)
            .collect();
        completed.sort_by(|a, b| {
            b.completed_at
                .unwrap_or(b.started_at)
                .cmp(&a.completed_at.unwrap_or(a.started_at))
        });

        let steps: Vec<CompensationStep> = completed
            .into_iter()
            .map(|execution| {
                let action = CompensationAction::for_activity_type(&execution.activity_type);
                CompensationStep {
                    execution_id: execution.id,
                    activity_id: execution.activity_id.clone(),
                    activity_type: execution.activity_type.clone(),
                    action,
                    required: action.is_required(),
                    completed_at: execution.completed_at,
                }
            })
            .collect();

        let strategy = if steps.iter().any(|s| s.required) {
            CompensationStrategy::Rollback
        } else {
            match instance.status {
                InstanceStatus::Failed => CompensationStrategy::ManualIntervention,
                InstanceStatus::Suspended => CompensationStrategy::Forward,
                _ => CompensationStrategy::Ignore,
            }
        };

        Self {
            instance_id: instance.id,
            strategy,
            steps,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(instance_id: Uuid, activity_id: &str, activity_type: &str, offset_secs: i64) -> WorkflowActivityExecution {
        let mut execution =
            WorkflowActivityExecution::start(instance_id, activity_id, activity_id, activity_type, None);
        execution.close(ActivityExecutionStatus::Completed, None, None);
        execution.completed_at = Some(Utc::now() + chrono::Duration::seconds(offset_secs));
        execution
    }

    #[test]
    fn test_action_by_activity_type() {
        assert_eq!(
            CompensationAction::for_activity_type("HttpRequest"),
            CompensationAction::ReverseExternalEffect
        );
        assert_eq!(
            CompensationAction::for_activity_type("SendEmail"),
            CompensationAction::ReverseExternalEffect
        );
        assert_eq!(
            CompensationAction::for_activity_type("DatabaseUpdate"),
            CompensationAction::UndoDataMutation
        );
        assert_eq!(CompensationAction::for_activity_type("UserTask"), CompensationAction::LogOnly);
    }

    #[test]
    fn test_rollback_newest_first_when_data_changed() {
        let mut instance = WorkflowInstance::new(Uuid::now_v7(), "orders", "alice");
        instance.status = InstanceStatus::Failed;
        let mut failed = WorkflowActivityExecution::start(instance.id, "ship", "ship", "HttpRequest", None);
        failed.close(ActivityExecutionStatus::Failed, None, Some("502".into()));
        let executions = vec![
            completed(instance.id, "reserve", "DataUpdate", 0),
            completed(instance.id, "notify", "EmailService", 10),
            failed,
        ];

        let plan = CompensationPlan::build(&instance, &executions);
        assert_eq!(plan.strategy, CompensationStrategy::Rollback);
        let order: Vec<_> = plan.steps.iter().map(|s| s.activity_id.as_str()).collect();
        assert_eq!(order, vec!["notify", "reserve"]);
    }

    #[test]
    fn test_strategy_by_status_without_required_steps() {
        let mut instance = WorkflowInstance::new(Uuid::now_v7(), "orders", "alice");
        let executions = vec![completed(instance.id, "review", "UserTask", 0)];

        instance.status = InstanceStatus::Failed;
        assert_eq!(
            CompensationPlan::build(&instance, &executions).strategy,
            CompensationStrategy::ManualIntervention
        );
        instance.status = InstanceStatus::Suspended;
        assert_eq!(
            CompensationPlan::build(&instance, &executions).strategy,
            CompensationStrategy::Forward
        );
        instance.status = InstanceStatus::Running;
        assert_eq!(
            CompensationPlan::build(&instance, &executions).strategy,
            CompensationStrategy::Ignore
        );
    }
}
