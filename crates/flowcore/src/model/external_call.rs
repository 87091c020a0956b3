//! Tracked outbound side effects

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of outbound call, selecting the executor that performs it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalCallType {
    HttpRequest,
    ThirdPartyApi,
    EmailService,
    NotificationService,
}

text_enum!(ExternalCallType, "external call type", {
    HttpRequest => "http_request",
    ThirdPartyApi => "third_party_api",
    EmailService => "email_service",
    NotificationService => "notification_service",
});

/// Status of a tracked call
///
/// ```text
/// Pending ──► Started ──► Completed
///                    ├──► Failed ───┐
///                    └──► TimedOut ─┴─► Pending (retry cycle)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalCallStatus {
    Pending,
    Started,
    Completed,
    Failed,
    TimedOut,
}

text_enum!(ExternalCallStatus, "external call status", {
    Pending => "pending",
    Started => "started",
    Completed => "completed",
    Failed => "failed",
    TimedOut => "timed_out",
});

impl ExternalCallStatus {
    /// Terminal for the current attempt cycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Whether `next` is a legal forward move from this status
    pub fn can_transition_to(&self, next: ExternalCallStatus) -> bool {
        use ExternalCallStatus::*;
        matches!(
            (self, next),
            (Pending, Started)
                | (Started, Completed)
                | (Started, Failed)
                | (Started, TimedOut)
                | (Failed, Pending)
                | (TimedOut, Pending)
        )
    }
}

/// A tracked outbound call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExternalCall {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub activity_id: String,
    pub call_type: ExternalCallType,
    pub endpoint: String,
    pub method: String,
    pub request_payload: Option<serde_json::Value>,
    pub headers: HashMap<String, String>,
    pub idempotency_key: String,
    pub status: ExternalCallStatus,
    pub attempt_count: u32,
    pub response_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExternalCall {
    /// Whether another attempt may be made under `max_attempts`
    pub fn can_retry(&self, max_attempts: u32) -> bool {
        matches!(
            self.status,
            ExternalCallStatus::Failed | ExternalCallStatus::TimedOut
        ) && self.attempt_count < max_attempts
    }

    /// Host part of the endpoint, used to key resilience state
    pub fn destination_host(&self) -> String {
        reqwest::Url::parse(&self.endpoint)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| self.endpoint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        use ExternalCallStatus::*;
        assert!(Pending.can_transition_to(Started));
        assert!(Started.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Started.can_transition_to(Pending));
    }

    #[test]
    fn test_destination_host() {
        let mut call = WorkflowExternalCall {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            activity_id: "notify".into(),
            call_type: ExternalCallType::HttpRequest,
            endpoint: "https://api.example.com/v1/orders".into(),
            method: "POST".into(),
            request_payload: None,
            headers: HashMap::new(),
            idempotency_key: "k".into(),
            status: ExternalCallStatus::Pending,
            attempt_count: 0,
            response_payload: None,
            error_message: None,
            duration_ms: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(call.destination_host(), "api.example.com");

        call.endpoint = "smtp-relay".into();
        assert_eq!(call.destination_host(), "smtp-relay");
    }
}
