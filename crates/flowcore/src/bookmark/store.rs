//! Bookmark creation, consumption and maintenance

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::model::{
    before_now, BookmarkType, ExecutionLogEntry, InstanceStatus, LogEventKind, WorkflowBookmark,
};
use crate::persistence::{IsolationLevel, StoreError, TransactionGateway, WorkflowTransaction};

/// Actor recorded on bookmarks released because their instance closed
pub const WORKFLOW_CLOSED_ACTOR: &str = "system:workflow-closed";

/// Request to suspend an activity on an external trigger
#[derive(Debug, Clone, PartialEq)]
pub struct BookmarkRequest {
    pub instance_id: Uuid,
    pub activity_id: String,
    pub bookmark_type: BookmarkType,
    pub key: String,
    pub due_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub payload: Option<serde_json::Value>,
}

impl BookmarkRequest {
    pub fn new(
        instance_id: Uuid,
        activity_id: impl Into<String>,
        bookmark_type: BookmarkType,
        key: impl Into<String>,
    ) -> Self {
        Self {
            instance_id,
            activity_id: activity_id.into(),
            bookmark_type,
            key: key.into(),
            due_at: None,
            correlation_id: None,
            payload: None,
        }
    }

    /// Wait for a human action
    pub fn user_action(instance_id: Uuid, activity_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(instance_id, activity_id, BookmarkType::UserAction, key)
    }

    /// Wait until `due_at`
    pub fn timer(
        instance_id: Uuid,
        activity_id: impl Into<String>,
        key: impl Into<String>,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self::new(instance_id, activity_id, BookmarkType::Timer, key).with_due_at(due_at)
    }

    /// Wait for a message from another system
    pub fn external_message(
        instance_id: Uuid,
        activity_id: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::new(instance_id, activity_id, BookmarkType::ExternalMessage, key)
    }

    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    fn into_bookmark(self) -> WorkflowBookmark {
        let mut bookmark =
            WorkflowBookmark::new(self.instance_id, self.activity_id, self.bookmark_type, self.key);
        bookmark.due_at = self.due_at;
        bookmark.correlation_id = self.correlation_id;
        bookmark.payload = self.payload;
        bookmark
    }
}

/// Result of [`BookmarkStore::create_bookmark`]
#[derive(Debug, Clone, PartialEq)]
pub enum CreateBookmarkOutcome {
    /// A new bookmark was inserted
    Created(WorkflowBookmark),

    /// An unconsumed bookmark with the same identity already existed
    Existing(WorkflowBookmark),
}

impl CreateBookmarkOutcome {
    pub fn bookmark(&self) -> &WorkflowBookmark {
        match self {
            Self::Created(b) | Self::Existing(b) => b,
        }
    }

    pub fn into_bookmark(self) -> WorkflowBookmark {
        match self {
            Self::Created(b) | Self::Existing(b) => b,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Result of [`BookmarkStore::consume_bookmark`]
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    /// The bookmark is now consumed by this caller
    Consumed(WorkflowBookmark),

    WorkflowNotFound,

    /// The instance exists but is not `Running`
    WorkflowNotInRunnableState(InstanceStatus),

    /// No unconsumed bookmark matched
    BookmarkNotFound,
}

impl ConsumeOutcome {
    pub fn is_consumed(&self) -> bool {
        matches!(self, Self::Consumed(_))
    }
}

/// Bookmark persistence with idempotent create and exclusive consume
#[derive(Clone)]
pub struct BookmarkStore {
    gateway: TransactionGateway,
}

impl BookmarkStore {
    pub fn new(gateway: TransactionGateway) -> Self {
        Self { gateway }
    }

    /// Create a bookmark, or return the unconsumed one with the same
    /// (instance, activity, key, type)
    #[instrument(skip(self, request), fields(instance_id = %request.instance_id, key = %request.key))]
    pub async fn create_bookmark(
        &self,
        request: BookmarkRequest,
    ) -> Result<CreateBookmarkOutcome, StoreError> {
        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let request = request.clone();
                Box::pin(async move { Self::create_in(tx, request).await })
            })
            .await
    }

    /// [`create_bookmark`](Self::create_bookmark) inside an open transaction
    pub async fn create_in(
        tx: &mut dyn WorkflowTransaction,
        request: BookmarkRequest,
    ) -> Result<CreateBookmarkOutcome, StoreError> {
        if let Some(existing) = tx
            .find_unconsumed_bookmark(
                request.instance_id,
                &request.activity_id,
                &request.key,
                Some(request.bookmark_type),
            )
            .await?
        {
            debug!(bookmark_id = %existing.id, "bookmark already exists");
            return Ok(CreateBookmarkOutcome::Existing(existing));
        }

        let (instance_id, activity_id, key, bookmark_type) = (
            request.instance_id,
            request.activity_id.clone(),
            request.key.clone(),
            request.bookmark_type,
        );
        let bookmark = request.into_bookmark();
        if !tx.insert_bookmark(&bookmark).await? {
            // A concurrent transaction committed the same identity first
            let existing = tx
                .find_unconsumed_bookmark(instance_id, &activity_id, &key, Some(bookmark_type))
                .await?
                .ok_or_else(|| StoreError::Duplicate(format!("bookmark {key}")))?;
            debug!(bookmark_id = %existing.id, "bookmark created concurrently");
            return Ok(CreateBookmarkOutcome::Existing(existing));
        }
        tx.append_log(
            &ExecutionLogEntry::new(
                bookmark.instance_id,
                LogEventKind::BookmarkCreated,
                format!("{} bookmark '{}' created", bookmark.bookmark_type, bookmark.key),
            )
            .for_activity(&bookmark.activity_id)
            .with_metadata(json!({
                "BookmarkId": bookmark.id,
                "BookmarkType": bookmark.bookmark_type.as_str(),
                "DueAt": bookmark.due_at,
            })),
        )
        .await?;

        debug!(bookmark_id = %bookmark.id, bookmark_type = %bookmark.bookmark_type, "bookmark created");
        Ok(CreateBookmarkOutcome::Created(bookmark))
    }

    /// Consume the unconsumed bookmark matching (instance, activity, key) of any type
    #[instrument(skip(self, output))]
    pub async fn consume_bookmark(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        key: &str,
        consumed_by: &str,
        output: Option<serde_json::Value>,
    ) -> Result<ConsumeOutcome, StoreError> {
        let activity_id = activity_id.to_string();
        let key = key.to_string();
        let consumed_by = consumed_by.to_string();

        let outcome = self
            .gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let (activity_id, key, consumed_by, output) =
                    (activity_id.clone(), key.clone(), consumed_by.clone(), output.clone());
                Box::pin(async move {
                    Self::consume_in(tx, instance_id, &activity_id, &key, &consumed_by, output).await
                })
            })
            .await?;

        if outcome.is_consumed() {
            info!(%instance_id, "bookmark consumed");
        }
        Ok(outcome)
    }

    /// [`consume_bookmark`](Self::consume_bookmark) inside an open transaction
    pub async fn consume_in(
        tx: &mut dyn WorkflowTransaction,
        instance_id: Uuid,
        activity_id: &str,
        key: &str,
        consumed_by: &str,
        output: Option<serde_json::Value>,
    ) -> Result<ConsumeOutcome, StoreError> {
        let Some(instance) = tx.get_instance_for_update(instance_id).await? else {
            return Ok(ConsumeOutcome::WorkflowNotFound);
        };
        if instance.status != InstanceStatus::Running {
            return Ok(ConsumeOutcome::WorkflowNotInRunnableState(instance.status));
        }

        let Some(mut bookmark) = tx
            .find_unconsumed_bookmark(instance_id, activity_id, key, None)
            .await?
        else {
            return Ok(ConsumeOutcome::BookmarkNotFound);
        };

        let consumed_at = Utc::now();
        if !tx
            .mark_bookmark_consumed(bookmark.id, consumed_by, consumed_at, output.clone())
            .await?
        {
            return Ok(ConsumeOutcome::BookmarkNotFound);
        }

        bookmark.consumed = true;
        bookmark.consumed_by = Some(consumed_by.to_string());
        bookmark.consumed_at = Some(consumed_at);
        if output.is_some() {
            bookmark.payload = output;
        }

        tx.append_log(
            &ExecutionLogEntry::new(
                instance_id,
                LogEventKind::BookmarkConsumed,
                format!("bookmark '{}' consumed", bookmark.key),
            )
            .for_activity(activity_id)
            .by(consumed_by)
            .with_metadata(json!({ "BookmarkId": bookmark.id })),
        )
        .await?;

        Ok(ConsumeOutcome::Consumed(bookmark))
    }

    /// Consume a due timer by id, regardless of instance status
    ///
    /// Returns `None` when the bookmark is gone or another sweeper consumed
    /// it first.
    pub async fn consume_timer_in(
        tx: &mut dyn WorkflowTransaction,
        bookmark_id: Uuid,
        consumed_by: &str,
    ) -> Result<Option<WorkflowBookmark>, StoreError> {
        let Some(mut bookmark) = tx.get_bookmark_for_update(bookmark_id).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        if !bookmark.is_due(now) {
            return Ok(None);
        }
        if !tx
            .mark_bookmark_consumed(bookmark.id, consumed_by, now, None)
            .await?
        {
            return Ok(None);
        }

        bookmark.consumed = true;
        bookmark.consumed_by = Some(consumed_by.to_string());
        bookmark.consumed_at = Some(now);

        tx.append_log(
            &ExecutionLogEntry::new(
                bookmark.instance_id,
                LogEventKind::BookmarkConsumed,
                format!("timer '{}' expired", bookmark.key),
            )
            .for_activity(&bookmark.activity_id)
            .by(consumed_by)
            .with_metadata(json!({ "BookmarkId": bookmark.id })),
        )
        .await?;

        Ok(Some(bookmark))
    }

    /// Consume every open bookmark of an instance that can no longer run
    pub async fn release_open_in(
        tx: &mut dyn WorkflowTransaction,
        instance_id: Uuid,
        released_by: &str,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut released = 0;
        for bookmark in tx.list_bookmarks(instance_id).await? {
            if bookmark.consumed {
                continue;
            }
            if !tx
                .mark_bookmark_consumed(bookmark.id, released_by, now, None)
                .await?
            {
                continue;
            }
            tx.append_log(
                &ExecutionLogEntry::new(
                    instance_id,
                    LogEventKind::BookmarkConsumed,
                    format!("bookmark '{}' released", bookmark.key),
                )
                .for_activity(&bookmark.activity_id)
                .by(released_by)
                .with_metadata(json!({ "BookmarkId": bookmark.id, "Released": true })),
            )
            .await?;
            released += 1;
        }

        if released > 0 {
            debug!(%instance_id, released, "open bookmarks released");
        }
        Ok(released)
    }

    /// Unconsumed timer bookmarks due at or before `up_to`
    pub async fn get_due_timer_bookmarks(
        &self,
        up_to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowBookmark>, StoreError> {
        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.list_due_timer_bookmarks(up_to, limit).await })
            })
            .await
    }

    /// Every bookmark of an instance
    pub async fn get_bookmarks(&self, instance_id: Uuid) -> Result<Vec<WorkflowBookmark>, StoreError> {
        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.list_bookmarks(instance_id).await })
            })
            .await
    }

    /// Purge bookmarks consumed longer than `retention` ago
    #[instrument(skip(self))]
    pub async fn cleanup_expired(&self, retention: Duration) -> Result<u64, StoreError> {
        let cutoff = before_now(retention);
        let purged = self
            .gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.delete_consumed_bookmarks(cutoff).await })
            })
            .await?;

        if purged > 0 {
            info!(purged, "purged consumed bookmarks");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowInstance;
    use crate::persistence::InMemoryWorkflowStore;
    use std::sync::Arc;

    async fn setup(status: InstanceStatus) -> (BookmarkStore, TransactionGateway, Uuid) {
        let gateway = TransactionGateway::new(Arc::new(InMemoryWorkflowStore::new()));
        let mut instance = WorkflowInstance::new(Uuid::now_v7(), "wf", "alice");
        instance.status = status;
        let id = instance.id;
        gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let instance = instance.clone();
                Box::pin(async move { tx.insert_instance(&instance).await })
            })
            .await
            .unwrap();
        (BookmarkStore::new(gateway.clone()), gateway, id)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (store, _, instance_id) = setup(InstanceStatus::Running).await;
        let request = BookmarkRequest::user_action(instance_id, "review", "approval");

        let first = store.create_bookmark(request.clone()).await.unwrap();
        let second = store.create_bookmark(request).await.unwrap();

        assert!(first.was_created());
        assert!(!second.was_created());
        assert_eq!(first.bookmark().id, second.bookmark().id);

        let bookmarks = store.get_bookmarks(instance_id).await.unwrap();
        assert_eq!(bookmarks.iter().filter(|b| !b.consumed).count(), 1);
    }

    #[tokio::test]
    async fn test_different_type_is_a_different_bookmark() {
        let (store, _, instance_id) = setup(InstanceStatus::Running).await;
        let a = store
            .create_bookmark(BookmarkRequest::user_action(instance_id, "wait", "k"))
            .await
            .unwrap();
        let b = store
            .create_bookmark(BookmarkRequest::external_message(instance_id, "wait", "k"))
            .await
            .unwrap();
        assert!(b.was_created());
        assert_ne!(a.bookmark().id, b.bookmark().id);
    }

    #[tokio::test]
    async fn test_consume_is_exclusive() {
        let (store, _, instance_id) = setup(InstanceStatus::Running).await;
        store
            .create_bookmark(BookmarkRequest::user_action(instance_id, "review", "approval"))
            .await
            .unwrap();

        let first = store
            .consume_bookmark(instance_id, "review", "approval", "alice", Some(json!({"ok": true})))
            .await
            .unwrap();
        let ConsumeOutcome::Consumed(bookmark) = first else {
            panic!("expected consumed, got {first:?}");
        };
        assert_eq!(bookmark.consumed_by.as_deref(), Some("alice"));
        assert_eq!(bookmark.payload, Some(json!({"ok": true})));

        let second = store
            .consume_bookmark(instance_id, "review", "approval", "bob", None)
            .await
            .unwrap();
        assert_eq!(second, ConsumeOutcome::BookmarkNotFound);
    }

    #[tokio::test]
    async fn test_consume_requires_running_instance() {
        let (store, _, instance_id) = setup(InstanceStatus::Suspended).await;
        store
            .create_bookmark(BookmarkRequest::user_action(instance_id, "review", "approval"))
            .await
            .unwrap();

        let outcome = store
            .consume_bookmark(instance_id, "review", "approval", "alice", None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ConsumeOutcome::WorkflowNotInRunnableState(InstanceStatus::Suspended)
        );

        let missing = store
            .consume_bookmark(Uuid::now_v7(), "review", "approval", "alice", None)
            .await
            .unwrap();
        assert_eq!(missing, ConsumeOutcome::WorkflowNotFound);
    }

    #[tokio::test]
    async fn test_create_and_consume_write_log_entries() {
        let (store, gateway, instance_id) = setup(InstanceStatus::Running).await;
        store
            .create_bookmark(BookmarkRequest::user_action(instance_id, "review", "approval"))
            .await
            .unwrap();
        store
            .consume_bookmark(instance_id, "review", "approval", "alice", None)
            .await
            .unwrap();

        let logs = gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.list_logs(instance_id).await })
            })
            .await
            .unwrap();
        let kinds: Vec<_> = logs.iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![LogEventKind::BookmarkCreated, LogEventKind::BookmarkConsumed]
        );
        assert_eq!(logs[1].actor.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_release_consumes_only_open_bookmarks() {
        let (store, gateway, instance_id) = setup(InstanceStatus::Running).await;
        store
            .create_bookmark(BookmarkRequest::user_action(instance_id, "review", "approval"))
            .await
            .unwrap();
        store
            .create_bookmark(BookmarkRequest::timer(instance_id, "wait", "deadline", Utc::now()))
            .await
            .unwrap();
        store
            .consume_bookmark(instance_id, "review", "approval", "alice", None)
            .await
            .unwrap();

        let released = gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move {
                    BookmarkStore::release_open_in(tx, instance_id, WORKFLOW_CLOSED_ACTOR).await
                })
            })
            .await
            .unwrap();
        assert_eq!(released, 1);

        let bookmarks = store.get_bookmarks(instance_id).await.unwrap();
        assert!(bookmarks.iter().all(|b| b.consumed));
        let timer = bookmarks.iter().find(|b| b.key == "deadline").unwrap();
        assert_eq!(timer.consumed_by.as_deref(), Some(WORKFLOW_CLOSED_ACTOR));
        assert!(store.get_due_timer_bookmarks(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_due_timers_and_cleanup() {
        let (store, gateway, instance_id) = setup(InstanceStatus::Running).await;
        let past = Utc::now() - chrono::Duration::minutes(5);
        let future = Utc::now() + chrono::Duration::hours(1);
        let due = store
            .create_bookmark(BookmarkRequest::timer(instance_id, "wait", "due", past))
            .await
            .unwrap()
            .into_bookmark();
        store
            .create_bookmark(BookmarkRequest::timer(instance_id, "wait", "later", future))
            .await
            .unwrap();

        let found = store.get_due_timer_bookmarks(Utc::now(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);

        let bookmark_id = due.id;
        let consumed = gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move {
                    BookmarkStore::consume_timer_in(tx, bookmark_id, "system:timer-sweeper").await
                })
            })
            .await
            .unwrap();
        assert!(consumed.is_some());
        assert!(store.get_due_timer_bookmarks(Utc::now(), 10).await.unwrap().is_empty());

        assert_eq!(store.cleanup_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(store.cleanup_expired(Duration::ZERO).await.unwrap(), 1);
    }
}
