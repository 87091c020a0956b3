//! Lifecycle event publishing

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::model::BookmarkType;

/// Errors from publishing an event
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    /// The sink could not be reached; worth retrying
    #[error("event sink unavailable: {0}")]
    Unavailable(String),

    /// The sink refused the event
    #[error("event rejected: {0}")]
    Rejected(String),

    /// The stored event could not be turned into a publish call
    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Sink for workflow lifecycle events
///
/// Delivery is best-effort unless the event travels through the outbox.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn workflow_started(
        &self,
        instance_id: Uuid,
        workflow_name: &str,
        started_by: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError>;

    async fn workflow_completed(
        &self,
        instance_id: Uuid,
        completed_at: DateTime<Utc>,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError>;

    async fn workflow_failed(
        &self,
        instance_id: Uuid,
        error: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError>;

    async fn workflow_cancelled(
        &self,
        instance_id: Uuid,
        reason: &str,
        cancelled_by: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError>;

    async fn activity_completed(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError>;

    #[allow(clippy::too_many_arguments)]
    async fn bookmark_timed_out(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        bookmark_key: &str,
        bookmark_type: BookmarkType,
        expired_at: DateTime<Utc>,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError>;

    async fn workflow_timeout_warning(
        &self,
        instance_id: Uuid,
        running_since: DateTime<Utc>,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError>;
}

/// Publisher that writes every event to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn workflow_started(
        &self,
        instance_id: Uuid,
        workflow_name: &str,
        started_by: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError> {
        info!(%instance_id, workflow_name, started_by, correlation_id, "event: workflow started");
        Ok(())
    }

    async fn workflow_completed(
        &self,
        instance_id: Uuid,
        completed_at: DateTime<Utc>,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError> {
        info!(%instance_id, %completed_at, correlation_id, "event: workflow completed");
        Ok(())
    }

    async fn workflow_failed(
        &self,
        instance_id: Uuid,
        error: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError> {
        info!(%instance_id, error, correlation_id, "event: workflow failed");
        Ok(())
    }

    async fn workflow_cancelled(
        &self,
        instance_id: Uuid,
        reason: &str,
        cancelled_by: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError> {
        info!(%instance_id, reason, cancelled_by, correlation_id, "event: workflow cancelled");
        Ok(())
    }

    async fn activity_completed(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError> {
        info!(%instance_id, activity_id, correlation_id, "event: activity completed");
        Ok(())
    }

    async fn bookmark_timed_out(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        bookmark_key: &str,
        bookmark_type: BookmarkType,
        expired_at: DateTime<Utc>,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError> {
        info!(
            %instance_id,
            activity_id,
            bookmark_key,
            %bookmark_type,
            %expired_at,
            correlation_id,
            "event: bookmark timed out"
        );
        Ok(())
    }

    async fn workflow_timeout_warning(
        &self,
        instance_id: Uuid,
        running_since: DateTime<Utc>,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError> {
        info!(%instance_id, %running_since, correlation_id, "event: workflow running past its ceiling");
        Ok(())
    }
}
