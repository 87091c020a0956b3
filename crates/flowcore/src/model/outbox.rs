//! Transactional outbox messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BookmarkType;

/// Delivery status of an outbox message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processed,
    DeadLetter,
}

text_enum!(OutboxStatus, "outbox status", {
    Pending => "pending",
    Processed => "processed",
    DeadLetter => "dead_letter",
});

/// Event types the dispatcher knows how to route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxEventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    ActivityCompleted,
    TimerExpired,
    UserActionTimeout,
    ExternalMessageTimeout,
    WorkflowTimeoutWarning,
}

text_enum!(OutboxEventType, "outbox event type", {
    WorkflowStarted => "workflow_started",
    WorkflowCompleted => "workflow_completed",
    WorkflowFailed => "workflow_failed",
    WorkflowCancelled => "workflow_cancelled",
    ActivityCompleted => "activity_completed",
    TimerExpired => "timer_expired",
    UserActionTimeout => "user_action_timeout",
    ExternalMessageTimeout => "external_message_timeout",
    WorkflowTimeoutWarning => "workflow_timeout_warning",
});

impl OutboxEventType {
    /// Timeout event emitted when a bookmark of the given type expires
    pub fn timeout_for(bookmark_type: BookmarkType) -> Self {
        match bookmark_type {
            BookmarkType::Timer => Self::TimerExpired,
            BookmarkType::UserAction => Self::UserActionTimeout,
            BookmarkType::ExternalMessage => Self::ExternalMessageTimeout,
        }
    }
}

/// A queued event
///
/// `event_type` is kept as the raw stored string so that rows written by a
/// newer producer still load; the dispatcher resolves it to
/// [`OutboxEventType`] and dead-letters what it cannot route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub instance_id: Uuid,
    pub activity_id: Option<String>,
    pub attempt_count: u32,
    pub status: OutboxStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Build a pending message
    ///
    /// `fields` are merged into the payload next to `Type`,
    /// `WorkflowInstanceId` and `ActivityId`.
    pub fn new(
        event_type: OutboxEventType,
        instance_id: Uuid,
        activity_id: Option<String>,
        fields: serde_json::Value,
    ) -> Self {
        let mut payload = serde_json::Map::new();
        payload.insert("Type".into(), event_type.as_str().into());
        payload.insert("WorkflowInstanceId".into(), instance_id.to_string().into());
        payload.insert(
            "ActivityId".into(),
            activity_id
                .clone()
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        );
        if let serde_json::Value::Object(extra) = fields {
            payload.extend(extra);
        }

        Self {
            id: Uuid::now_v7(),
            event_type: event_type.as_str().to_string(),
            payload: serde_json::Value::Object(payload),
            correlation_id: None,
            instance_id,
            activity_id,
            attempt_count: 0,
            status: OutboxStatus::Pending,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}
