//! Workflow instances, activity executions and stored definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Instance row written, first step not yet taken
    Created,

    /// Instance is executing or waiting on a bookmark
    Running,

    /// Execution halted after repeated failures; needs an operator
    Suspended,

    /// Workflow reached a terminal activity
    Completed,

    /// Workflow failed
    Failed,

    /// Workflow was cancelled
    Cancelled,
}

text_enum!(InstanceStatus, "instance status", {
    Created => "created",
    Running => "running",
    Suspended => "suspended",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl InstanceStatus {
    /// Terminal statuses are never left again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses from which the orchestrator may take a step
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

/// One running process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub name: String,
    pub status: InstanceStatus,
    pub current_activity_id: Option<String>,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    /// Workflow variables, keyed by name
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub last_error: Option<String>,
}

impl WorkflowInstance {
    /// Create a new instance in the `Created` state
    pub fn new(
        definition_id: Uuid,
        name: impl Into<String>,
        started_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition_id,
            name: name.into(),
            status: InstanceStatus::Created,
            current_activity_id: None,
            started_by: started_by.into(),
            started_at: Utc::now(),
            completed_at: None,
            correlation_id: None,
            variables: serde_json::Map::new(),
            last_error: None,
        }
    }

    /// Use a caller-chosen id
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Seed the variable bag
    pub fn with_variables(mut self, variables: serde_json::Map<String, serde_json::Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Move to a terminal status and stamp the completion time
    pub fn finish(&mut self, status: InstanceStatus, error: Option<String>) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        if error.is_some() {
            self.last_error = error;
        }
    }
}

/// Status of one activity attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityExecutionStatus {
    Started,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(ActivityExecutionStatus, "activity execution status", {
    Started => "started",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

/// One attempt to run one activity for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowActivityExecution {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub activity_id: String,
    pub activity_name: String,
    pub activity_type: String,
    pub status: ActivityExecutionStatus,
    pub assignee: Option<String>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowActivityExecution {
    /// Open a new execution in the `Started` state
    pub fn start(
        instance_id: Uuid,
        activity_id: impl Into<String>,
        activity_name: impl Into<String>,
        activity_type: impl Into<String>,
        input: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            activity_id: activity_id.into(),
            activity_name: activity_name.into(),
            activity_type: activity_type.into(),
            status: ActivityExecutionStatus::Started,
            assignee: None,
            input,
            output: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Whether the execution is still open
    pub fn is_open(&self) -> bool {
        self.status == ActivityExecutionStatus::Started
    }

    /// Close the execution
    pub fn close(
        &mut self,
        status: ActivityExecutionStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        if output.is_some() {
            self.output = output;
        }
        self.error_message = error;
    }
}

/// A stored workflow definition
///
/// The raw schema JSON is kept verbatim and only trusted after it passes
/// [`crate::schema::SchemaLimits`] on every load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinitionRecord {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub schema_json: String,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinitionRecord {
    /// Create a new definition record
    pub fn new(name: impl Into<String>, version: i32, schema_json: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            version,
            schema_json: schema_json.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_text() {
        for status in InstanceStatus::ALL {
            let parsed: InstanceStatus = status.as_str().parse().unwrap();
            assert_eq!(&parsed, status);
        }
        assert!("paused".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_runnable_and_terminal() {
        assert!(InstanceStatus::Running.is_runnable());
        assert!(InstanceStatus::Created.is_runnable());
        assert!(!InstanceStatus::Suspended.is_runnable());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Suspended.is_terminal());
    }

    #[test]
    fn test_close_execution_keeps_output_when_none() {
        let mut execution = WorkflowActivityExecution::start(
            Uuid::now_v7(),
            "review",
            "Review",
            "UserTask",
            None,
        );
        execution.output = Some(serde_json::json!({"draft": true}));
        execution.close(ActivityExecutionStatus::Completed, None, None);

        assert!(!execution.is_open());
        assert_eq!(execution.output, Some(serde_json::json!({"draft": true})));
        assert!(execution.completed_at.is_some());
    }
}
