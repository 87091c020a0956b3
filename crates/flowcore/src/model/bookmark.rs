//! Bookmarks: "the workflow is waiting for X"

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a bookmark is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkType {
    /// A human has to act (approve, fill in a form, ...)
    UserAction,

    /// A point in time has to pass
    Timer,

    /// A message from another system has to arrive
    ExternalMessage,
}

text_enum!(BookmarkType, "bookmark type", {
    UserAction => "user_action",
    Timer => "timer",
    ExternalMessage => "external_message",
});

/// A suspension marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowBookmark {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub activity_id: String,
    pub bookmark_type: BookmarkType,
    pub key: String,
    pub correlation_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    /// Only set for `Timer` bookmarks
    pub due_at: Option<DateTime<Utc>>,
    pub consumed: bool,
    pub consumed_by: Option<String>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowBookmark {
    /// Create a new unconsumed bookmark
    pub fn new(
        instance_id: Uuid,
        activity_id: impl Into<String>,
        bookmark_type: BookmarkType,
        key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            activity_id: activity_id.into(),
            bookmark_type,
            key: key.into(),
            correlation_id: None,
            payload: None,
            due_at: None,
            consumed: false,
            consumed_by: None,
            consumed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this bookmark matches the idempotency key of a create request
    pub fn matches(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        key: &str,
        bookmark_type: Option<BookmarkType>,
    ) -> bool {
        self.instance_id == instance_id
            && self.activity_id == activity_id
            && self.key == key
            && bookmark_type.map_or(true, |t| t == self.bookmark_type)
    }

    /// Whether a timer bookmark is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.bookmark_type == BookmarkType::Timer
            && !self.consumed
            && self.due_at.is_some_and(|due| due <= now)
    }
}
