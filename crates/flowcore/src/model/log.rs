//! Append-only execution log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of execution log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventKind {
    WorkflowStarted,
    ActivityStarted,
    ActivityCompleted,
    ActivityFailed,
    BookmarkCreated,
    BookmarkConsumed,
    ExternalCallFailed,
    WorkflowSuspended,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    /// The instance ran past the sweeper's ceiling
    TimeoutWarning,
}

text_enum!(LogEventKind, "log event kind", {
    WorkflowStarted => "workflow_started",
    ActivityStarted => "activity_started",
    ActivityCompleted => "activity_completed",
    ActivityFailed => "activity_failed",
    BookmarkCreated => "bookmark_created",
    BookmarkConsumed => "bookmark_consumed",
    ExternalCallFailed => "external_call_failed",
    WorkflowSuspended => "workflow_suspended",
    WorkflowCompleted => "workflow_completed",
    WorkflowFailed => "workflow_failed",
    WorkflowCancelled => "workflow_cancelled",
    TimeoutWarning => "timeout_warning",
});

/// One diagnostic entry; never mutated after insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub kind: LogEventKind,
    pub activity_id: Option<String>,
    pub message: String,
    pub actor: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLogEntry {
    /// Create a new entry
    pub fn new(instance_id: Uuid, kind: LogEventKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            kind,
            activity_id: None,
            message: message.into(),
            actor: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    /// Attach the activity id
    pub fn for_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    /// Attach the acting user or system identity
    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Attach structured metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
