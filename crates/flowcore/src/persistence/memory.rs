//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::store::*;
use crate::model::{
    ActivityExecutionStatus, BookmarkType, ExecutionLogEntry, ExternalCallStatus,
    InstanceStatus, LogEventKind, OutboxMessage, OutboxStatus, WorkflowActivityExecution,
    WorkflowBookmark, WorkflowDefinitionRecord, WorkflowExternalCall, WorkflowInstance,
};

/// Everything the store holds
#[derive(Debug, Clone, Default)]
struct MemoryState {
    definitions: HashMap<Uuid, WorkflowDefinitionRecord>,
    instances: HashMap<Uuid, WorkflowInstance>,
    executions: Vec<WorkflowActivityExecution>,
    bookmarks: Vec<WorkflowBookmark>,
    external_calls: Vec<WorkflowExternalCall>,
    outbox: Vec<OutboxMessage>,
    logs: Vec<ExecutionLogEntry>,
}

/// In-memory implementation of WorkflowStore
///
/// This is primarily for testing. It provides the same transactional
/// semantics as the PostgreSQL implementation:
/// - transactions are serialized, so application locks are always granted
/// - each transaction works on a private copy, written back on commit
/// - rollback (explicit, on drop, or on a failed commit) discards the copy
///
/// A task must not begin a second transaction while it holds one.
///
/// # Example
///
/// ```
/// use flowcore::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// store.fail_next_commits(1);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryWorkflowStore {
    state: Arc<Mutex<MemoryState>>,
    injected_commit_failures: Arc<AtomicU32>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transient error
    pub fn fail_next_commits(&self, n: u32) {
        self.injected_commit_failures.store(n, Ordering::SeqCst);
    }

    /// Number of stored instances
    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    /// Number of outbox messages in `status`
    pub async fn outbox_count(&self, status: OutboxStatus) -> usize {
        self.state
            .lock()
            .await
            .outbox
            .iter()
            .filter(|m| m.status == status)
            .count()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn begin(
        &self,
        _isolation: IsolationLevel,
    ) -> Result<Box<dyn WorkflowTransaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            guard: Some(guard),
            working,
            injected_commit_failures: self.injected_commit_failures.clone(),
        }))
    }
}

/// Copy-on-write transaction over [`MemoryState`]
struct InMemoryTransaction {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    working: MemoryState,
    injected_commit_failures: Arc<AtomicU32>,
}

impl InMemoryTransaction {
    fn state(&mut self) -> Result<&mut MemoryState, StoreError> {
        if self.guard.is_none() {
            return Err(StoreError::TransactionClosed);
        }
        Ok(&mut self.working)
    }
}

fn sorted_by_created<T: Clone>(items: Vec<&T>, key: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    let mut items: Vec<T> = items.into_iter().cloned().collect();
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait]
impl WorkflowTransaction for InMemoryTransaction {
    async fn get_definition(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowDefinitionRecord>, StoreError> {
        Ok(self.state()?.definitions.get(&id).cloned())
    }

    async fn upsert_definition(
        &mut self,
        definition: &WorkflowDefinitionRecord,
    ) -> Result<(), StoreError> {
        self.state()?
            .definitions
            .insert(definition.id, definition.clone());
        Ok(())
    }

    async fn insert_instance(&mut self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let state = self.state()?;
        if state.instances.contains_key(&instance.id) {
            return Err(StoreError::Duplicate(format!("instance {}", instance.id)));
        }
        state.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&mut self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.state()?.instances.get(&id).cloned())
    }

    async fn get_instance_for_update(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        self.get_instance(id).await
    }

    async fn update_instance(&mut self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let state = self.state()?;
        match state.instances.get_mut(&instance.id) {
            Some(stored) => {
                *stored = instance.clone();
                Ok(())
            }
            None => Err(StoreError::Database(format!(
                "instance {} does not exist",
                instance.id
            ))),
        }
    }

    async fn list_long_running_instances(
        &mut self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let state = self.state()?;
        let matching = state
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Running && i.started_at < started_before)
            .collect();
        let mut instances = sorted_by_created(matching, |i: &WorkflowInstance| i.started_at);
        instances.truncate(limit);
        Ok(instances)
    }

    async fn insert_activity_execution(
        &mut self,
        execution: &WorkflowActivityExecution,
    ) -> Result<(), StoreError> {
        self.state()?.executions.push(execution.clone());
        Ok(())
    }

    async fn update_activity_execution(
        &mut self,
        execution: &WorkflowActivityExecution,
    ) -> Result<(), StoreError> {
        let state = self.state()?;
        match state.executions.iter_mut().find(|e| e.id == execution.id) {
            Some(stored) => {
                *stored = execution.clone();
                Ok(())
            }
            None => Err(StoreError::Database(format!(
                "activity execution {} does not exist",
                execution.id
            ))),
        }
    }

    async fn find_open_activity_execution(
        &mut self,
        instance_id: Uuid,
        activity_id: &str,
    ) -> Result<Option<WorkflowActivityExecution>, StoreError> {
        Ok(self
            .state()?
            .executions
            .iter()
            .rev()
            .find(|e| e.instance_id == instance_id && e.activity_id == activity_id && e.is_open())
            .cloned())
    }

    async fn list_activity_executions(
        &mut self,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowActivityExecution>, StoreError> {
        Ok(self
            .state()?
            .executions
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_open_executions_for_assignee(
        &mut self,
        assignee: &str,
    ) -> Result<Vec<WorkflowActivityExecution>, StoreError> {
        let state = self.state()?;
        Ok(state
            .executions
            .iter()
            .filter(|e| {
                e.status == ActivityExecutionStatus::Started
                    && e.assignee.as_deref() == Some(assignee)
                    && state
                        .instances
                        .get(&e.instance_id)
                        .is_some_and(|i| i.status == InstanceStatus::Running)
            })
            .cloned()
            .collect())
    }

    async fn find_unconsumed_bookmark(
        &mut self,
        instance_id: Uuid,
        activity_id: &str,
        key: &str,
        bookmark_type: Option<BookmarkType>,
    ) -> Result<Option<WorkflowBookmark>, StoreError> {
        Ok(self
            .state()?
            .bookmarks
            .iter()
            .find(|b| !b.consumed && b.matches(instance_id, activity_id, key, bookmark_type))
            .cloned())
    }

    async fn insert_bookmark(&mut self, bookmark: &WorkflowBookmark) -> Result<bool, StoreError> {
        let state = self.state()?;
        let clash = state.bookmarks.iter().any(|b| {
            !b.consumed
                && b.matches(
                    bookmark.instance_id,
                    &bookmark.activity_id,
                    &bookmark.key,
                    Some(bookmark.bookmark_type),
                )
        });
        if clash {
            return Ok(false);
        }
        state.bookmarks.push(bookmark.clone());
        Ok(true)
    }

    async fn get_bookmark_for_update(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowBookmark>, StoreError> {
        Ok(self
            .state()?
            .bookmarks
            .iter()
            .find(|b| b.id == id)
            .cloned())
    }

    async fn mark_bookmark_consumed(
        &mut self,
        id: Uuid,
        consumed_by: &str,
        consumed_at: DateTime<Utc>,
        payload: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let state = self.state()?;
        let Some(bookmark) = state.bookmarks.iter_mut().find(|b| b.id == id && !b.consumed) else {
            return Ok(false);
        };
        bookmark.consumed = true;
        bookmark.consumed_by = Some(consumed_by.to_string());
        bookmark.consumed_at = Some(consumed_at);
        if payload.is_some() {
            bookmark.payload = payload;
        }
        Ok(true)
    }

    async fn list_due_timer_bookmarks(
        &mut self,
        up_to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowBookmark>, StoreError> {
        let state = self.state()?;
        let due = state.bookmarks.iter().filter(|b| b.is_due(up_to)).collect();
        let mut due = sorted_by_created(due, |b: &WorkflowBookmark| {
            b.due_at.unwrap_or(b.created_at)
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_consumed_bookmarks(
        &mut self,
        before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let state = self.state()?;
        let len = state.bookmarks.len();
        state
            .bookmarks
            .retain(|b| !(b.consumed && b.consumed_at.is_some_and(|at| at < before)));
        Ok((len - state.bookmarks.len()) as u64)
    }

    async fn list_bookmarks(
        &mut self,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowBookmark>, StoreError> {
        Ok(self
            .state()?
            .bookmarks
            .iter()
            .filter(|b| b.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn find_external_call(
        &mut self,
        instance_id: Uuid,
        activity_id: &str,
        endpoint: &str,
        method: &str,
    ) -> Result<Option<WorkflowExternalCall>, StoreError> {
        Ok(self
            .state()?
            .external_calls
            .iter()
            .find(|c| {
                c.instance_id == instance_id
                    && c.activity_id == activity_id
                    && c.endpoint == endpoint
                    && c.method == method
            })
            .cloned())
    }

    async fn insert_external_call(
        &mut self,
        call: &WorkflowExternalCall,
    ) -> Result<bool, StoreError> {
        let state = self.state()?;
        let clash = state.external_calls.iter().any(|c| {
            c.instance_id == call.instance_id
                && c.activity_id == call.activity_id
                && c.endpoint == call.endpoint
                && c.method == call.method
        });
        if clash {
            return Ok(false);
        }
        state.external_calls.push(call.clone());
        Ok(true)
    }

    async fn get_external_call(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowExternalCall>, StoreError> {
        Ok(self
            .state()?
            .external_calls
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn update_external_call(
        &mut self,
        call: &WorkflowExternalCall,
        expected: ExternalCallStatus,
    ) -> Result<bool, StoreError> {
        let state = self.state()?;
        match state
            .external_calls
            .iter_mut()
            .find(|c| c.id == call.id && c.status == expected)
        {
            Some(stored) => {
                *stored = call.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_retryable_external_calls(
        &mut self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<WorkflowExternalCall>, StoreError> {
        let state = self.state()?;
        let retryable = state
            .external_calls
            .iter()
            .filter(|c| c.can_retry(max_attempts))
            .collect();
        let mut calls = sorted_by_created(retryable, |c: &WorkflowExternalCall| c.updated_at);
        calls.truncate(limit);
        Ok(calls)
    }

    async fn list_stale_external_calls(
        &mut self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExternalCall>, StoreError> {
        let state = self.state()?;
        let stale = state
            .external_calls
            .iter()
            .filter(|c| c.status == ExternalCallStatus::Started && c.updated_at < started_before)
            .collect();
        let mut calls = sorted_by_created(stale, |c: &WorkflowExternalCall| c.updated_at);
        calls.truncate(limit);
        Ok(calls)
    }

    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        self.state()?.outbox.push(message.clone());
        Ok(())
    }

    async fn list_pending_outbox(
        &mut self,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        Ok(self
            .state()?
            .outbox
            .iter()
            .filter(|m| m.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_outbox(
        &mut self,
        message: &OutboxMessage,
        expected: OutboxStatus,
        expected_attempts: u32,
    ) -> Result<bool, StoreError> {
        let state = self.state()?;
        match state.outbox.iter_mut().find(|m| {
            m.id == message.id && m.status == expected && m.attempt_count == expected_attempts
        })
        {
            Some(stored) => {
                *stored = message.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_processed_outbox(&mut self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let state = self.state()?;
        let len = state.outbox.len();
        state.outbox.retain(|m| {
            !(m.status == OutboxStatus::Processed && m.processed_at.is_some_and(|at| at < before))
        });
        Ok((len - state.outbox.len()) as u64)
    }

    async fn append_log(&mut self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        self.state()?.logs.push(entry.clone());
        Ok(())
    }

    async fn count_logs(
        &mut self,
        instance_id: Uuid,
        kind: LogEventKind,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(self
            .state()?
            .logs
            .iter()
            .filter(|l| l.instance_id == instance_id && l.kind == kind && l.created_at >= since)
            .count() as u64)
    }

    async fn list_logs(&mut self, instance_id: Uuid) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        Ok(self
            .state()?
            .logs
            .iter()
            .filter(|l| l.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn acquire_application_lock(
        &mut self,
        _resource: &str,
        _mode: LockMode,
        _timeout: Duration,
    ) -> Result<AppLockStatus, StoreError> {
        // Transactions are already serialized by the state mutex
        self.state()?;
        Ok(AppLockStatus::Granted)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut guard = self.guard.take().ok_or(StoreError::TransactionClosed)?;
        let injected = self
            .injected_commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transient("injected commit failure".into()));
        }
        *guard = std::mem::take(&mut self.working);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.guard.take().ok_or(StoreError::TransactionClosed)?;
        self.working = MemoryState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(Uuid::now_v7(), "onboarding", "alice")
    }

    #[tokio::test]
    async fn test_commit_makes_changes_visible() {
        let store = InMemoryWorkflowStore::new();
        let instance = instance();

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.insert_instance(&instance).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let loaded = tx.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "onboarding");
        drop(tx);
        assert_eq!(store.instance_count().await, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let store = InMemoryWorkflowStore::new();
        let instance = instance();

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.insert_instance(&instance).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_drop_discards_changes() {
        let store = InMemoryWorkflowStore::new();
        {
            let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
            tx.insert_instance(&instance()).await.unwrap();
        }
        assert_eq!(store.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_injected_commit_failure_is_transient() {
        let store = InMemoryWorkflowStore::new();
        store.fail_next_commits(1);

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.insert_instance(&instance()).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.instance_count().await, 0);

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.insert_instance(&instance()).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.instance_count().await, 1);
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_operations() {
        let store = InMemoryWorkflowStore::new();
        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.commit().await.unwrap();

        assert!(matches!(
            tx.get_instance(Uuid::now_v7()).await,
            Err(StoreError::TransactionClosed)
        ));
        assert!(matches!(tx.commit().await, Err(StoreError::TransactionClosed)));
    }

    #[tokio::test]
    async fn test_bookmark_consumed_once() {
        let store = InMemoryWorkflowStore::new();
        let bookmark =
            WorkflowBookmark::new(Uuid::now_v7(), "approve", BookmarkType::UserAction, "approve");

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        assert!(tx.insert_bookmark(&bookmark).await.unwrap());
        assert!(!tx
            .insert_bookmark(&WorkflowBookmark::new(
                bookmark.instance_id,
                "approve",
                BookmarkType::UserAction,
                "approve"
            ))
            .await
            .unwrap());

        let now = Utc::now();
        assert!(tx
            .mark_bookmark_consumed(bookmark.id, "bob", now, None)
            .await
            .unwrap());
        assert!(!tx
            .mark_bookmark_consumed(bookmark.id, "carol", now, None)
            .await
            .unwrap());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_conditional_outbox_update() {
        let store = InMemoryWorkflowStore::new();
        let mut message = OutboxMessage::new(
            crate::model::OutboxEventType::WorkflowStarted,
            Uuid::now_v7(),
            None,
            serde_json::json!({}),
        );

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.enqueue_outbox(&message).await.unwrap();
        message.status = OutboxStatus::Processed;
        assert!(tx
            .update_outbox(&message, OutboxStatus::Pending, 0)
            .await
            .unwrap());
        assert!(!tx
            .update_outbox(&message, OutboxStatus::Pending, 0)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.outbox_count(OutboxStatus::Processed).await, 1);
    }

    #[tokio::test]
    async fn test_outbox_update_from_stale_attempt_count_is_skipped() {
        let store = InMemoryWorkflowStore::new();
        let mut message = OutboxMessage::new(
            crate::model::OutboxEventType::WorkflowStarted,
            Uuid::now_v7(),
            None,
            serde_json::json!({}),
        );
        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.enqueue_outbox(&message).await.unwrap();

        // Two dispatchers read the row at zero attempts and both fail
        message.attempt_count = 1;
        assert!(tx
            .update_outbox(&message, OutboxStatus::Pending, 0)
            .await
            .unwrap());
        assert!(!tx
            .update_outbox(&message, OutboxStatus::Pending, 0)
            .await
            .unwrap());

        // A dispatcher that read the first failure records the second
        message.attempt_count = 2;
        assert!(tx
            .update_outbox(&message, OutboxStatus::Pending, 1)
            .await
            .unwrap());
        let stored = tx.list_pending_outbox(10).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(stored[0].attempt_count, 2);
    }
}
