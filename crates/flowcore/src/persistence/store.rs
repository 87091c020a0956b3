//! WorkflowStore and WorkflowTransaction trait definitions

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    BookmarkType, ExecutionLogEntry, ExternalCallStatus, LogEventKind, OutboxMessage,
    OutboxStatus, WorkflowActivityExecution, WorkflowBookmark, WorkflowDefinitionRecord,
    WorkflowExternalCall, WorkflowInstance,
};

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Fault that may succeed if the whole transaction is retried
    /// (deadlock, serialization failure, dropped connection, pool timeout)
    #[error("transient database error: {0}")]
    Transient(String),

    /// Unique constraint violated
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation on a transaction that was already committed or rolled back
    #[error("transaction already finished")]
    TransactionClosed,
}

impl StoreError {
    /// Whether retrying the transaction may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<crate::model::ParseEnumError> for StoreError {
    fn from(e: crate::model::ParseEnumError) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors that can be classified as worth retrying a transaction for
pub trait TransientError {
    fn is_transient(&self) -> bool;
}

impl TransientError for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL form used in `SET TRANSACTION ISOLATION LEVEL`
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Mode of a named application lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Result of requesting a named application lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppLockStatus {
    /// Lock granted immediately
    Granted,

    /// Lock granted after waiting for another holder
    GrantedAfterWait,

    /// Lock not granted within the timeout
    Timeout,

    /// Lock request was cancelled
    Cancelled,

    /// Lock request chosen as a deadlock victim
    Deadlock,

    /// Lock request failed for another reason
    Error,
}

impl AppLockStatus {
    /// Whether the caller now holds the lock
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted | Self::GrantedAfterWait)
    }
}

/// Storage backend that hands out transactions
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    /// Begin a new transaction
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn WorkflowTransaction>, StoreError>;
}

/// One open storage transaction
///
/// Every change made through a transaction becomes visible atomically on
/// [`commit`](WorkflowTransaction::commit) or is discarded on
/// [`rollback`](WorkflowTransaction::rollback). Dropping an unfinished
/// transaction rolls it back.
#[async_trait]
pub trait WorkflowTransaction: Send {
    // =========================================================================
    // Definitions
    // =========================================================================

    async fn get_definition(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowDefinitionRecord>, StoreError>;

    /// Insert or replace a definition
    async fn upsert_definition(
        &mut self,
        definition: &WorkflowDefinitionRecord,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Instances
    // =========================================================================

    async fn insert_instance(&mut self, instance: &WorkflowInstance) -> Result<(), StoreError>;

    async fn get_instance(&mut self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Load an instance and hold a row lock on it until the transaction ends
    async fn get_instance_for_update(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowInstance>, StoreError>;

    async fn update_instance(&mut self, instance: &WorkflowInstance) -> Result<(), StoreError>;

    /// Running instances started before `started_before`, oldest first
    async fn list_long_running_instances(
        &mut self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    // =========================================================================
    // Activity executions
    // =========================================================================

    async fn insert_activity_execution(
        &mut self,
        execution: &WorkflowActivityExecution,
    ) -> Result<(), StoreError>;

    async fn update_activity_execution(
        &mut self,
        execution: &WorkflowActivityExecution,
    ) -> Result<(), StoreError>;

    /// The most recent `Started` execution of an activity
    async fn find_open_activity_execution(
        &mut self,
        instance_id: Uuid,
        activity_id: &str,
    ) -> Result<Option<WorkflowActivityExecution>, StoreError>;

    /// All executions of an instance, oldest first
    async fn list_activity_executions(
        &mut self,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowActivityExecution>, StoreError>;

    /// Open executions assigned to `assignee` on running instances
    async fn list_open_executions_for_assignee(
        &mut self,
        assignee: &str,
    ) -> Result<Vec<WorkflowActivityExecution>, StoreError>;

    // =========================================================================
    // Bookmarks
    // =========================================================================

    /// Unconsumed bookmark with the given identity; `None` type matches any
    async fn find_unconsumed_bookmark(
        &mut self,
        instance_id: Uuid,
        activity_id: &str,
        key: &str,
        bookmark_type: Option<BookmarkType>,
    ) -> Result<Option<WorkflowBookmark>, StoreError>;

    /// Insert a bookmark unless an unconsumed one with the same identity exists
    ///
    /// Returns `false` when the insert was skipped, including when a
    /// concurrent transaction inserted the same identity first.
    async fn insert_bookmark(&mut self, bookmark: &WorkflowBookmark) -> Result<bool, StoreError>;

    /// Load a bookmark and hold a row lock on it until the transaction ends
    async fn get_bookmark_for_update(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowBookmark>, StoreError>;

    /// Mark a bookmark consumed if it is still unconsumed
    ///
    /// Returns `false` when another consumer got there first.
    async fn mark_bookmark_consumed(
        &mut self,
        id: Uuid,
        consumed_by: &str,
        consumed_at: DateTime<Utc>,
        payload: Option<serde_json::Value>,
    ) -> Result<bool, StoreError>;

    /// Unconsumed timer bookmarks due at or before `up_to`, earliest first
    async fn list_due_timer_bookmarks(
        &mut self,
        up_to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowBookmark>, StoreError>;

    /// Delete consumed bookmarks consumed before `before`
    async fn delete_consumed_bookmarks(&mut self, before: DateTime<Utc>)
        -> Result<u64, StoreError>;

    async fn list_bookmarks(&mut self, instance_id: Uuid)
        -> Result<Vec<WorkflowBookmark>, StoreError>;

    // =========================================================================
    // External calls
    // =========================================================================

    /// The call for (instance, activity, endpoint, method), if recorded
    async fn find_external_call(
        &mut self,
        instance_id: Uuid,
        activity_id: &str,
        endpoint: &str,
        method: &str,
    ) -> Result<Option<WorkflowExternalCall>, StoreError>;

    /// Insert a call unless one exists for (instance, activity, endpoint, method)
    ///
    /// Returns `false` when the insert was skipped.
    async fn insert_external_call(&mut self, call: &WorkflowExternalCall)
        -> Result<bool, StoreError>;

    async fn get_external_call(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowExternalCall>, StoreError>;

    /// Write `call` only if the stored status is still `expected`
    ///
    /// Returns `false` when the row moved on in the meantime.
    async fn update_external_call(
        &mut self,
        call: &WorkflowExternalCall,
        expected: ExternalCallStatus,
    ) -> Result<bool, StoreError>;

    /// Failed or timed-out calls with fewer than `max_attempts` attempts
    async fn list_retryable_external_calls(
        &mut self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<WorkflowExternalCall>, StoreError>;

    /// Calls still `Started` whose last update is older than `started_before`
    async fn list_stale_external_calls(
        &mut self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExternalCall>, StoreError>;

    // =========================================================================
    // Outbox
    // =========================================================================

    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError>;

    /// Pending messages, oldest first
    async fn list_pending_outbox(&mut self, limit: usize)
        -> Result<Vec<OutboxMessage>, StoreError>;

    /// Write `message` only if the stored row still has `expected` status
    /// and `expected_attempts` attempts
    async fn update_outbox(
        &mut self,
        message: &OutboxMessage,
        expected: OutboxStatus,
        expected_attempts: u32,
    ) -> Result<bool, StoreError>;

    /// Delete processed messages processed before `before`
    async fn delete_processed_outbox(&mut self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Execution log
    // =========================================================================

    async fn append_log(&mut self, entry: &ExecutionLogEntry) -> Result<(), StoreError>;

    /// Entries of `kind` for the instance created at or after `since`
    async fn count_logs(
        &mut self,
        instance_id: Uuid,
        kind: LogEventKind,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// All entries of an instance, oldest first
    async fn list_logs(&mut self, instance_id: Uuid)
        -> Result<Vec<ExecutionLogEntry>, StoreError>;

    // =========================================================================
    // Locks and lifecycle
    // =========================================================================

    /// Take a named lock held until the transaction ends
    async fn acquire_application_lock(
        &mut self,
        resource: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<AppLockStatus, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}
