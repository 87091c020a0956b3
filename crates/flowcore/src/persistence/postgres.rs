//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - Row locks (`FOR UPDATE`) for instance and bookmark claims
//! - Conditional updates for external call and outbox status transitions
//! - Transaction-scoped advisory locks as the named application lock

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::model::{
    BookmarkType, ExecutionLogEntry, ExternalCallStatus, LogEventKind, OutboxMessage,
    OutboxStatus, WorkflowActivityExecution, WorkflowBookmark, WorkflowDefinitionRecord,
    WorkflowExternalCall, WorkflowInstance,
};

/// Apply the bundled migrations to `pool`
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))
}

/// PostgreSQL implementation of WorkflowStore
///
/// # Example
///
/// ```ignore
/// use flowcore::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flowcore").await?;
/// flowcore::persistence::migrate(&pool).await?;
/// let store = PostgresWorkflowStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self))]
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn WorkflowTransaction>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        if isolation != IsolationLevel::ReadCommitted {
            sqlx::query(&format!(
                "SET TRANSACTION ISOLATION LEVEL {}",
                isolation.as_sql()
            ))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }
}

/// An open PostgreSQL transaction
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.tx.as_deref_mut().ok_or(StoreError::TransactionClosed)
    }

    async fn execute_raw(&mut self, statement: &str) -> Result<(), StoreError> {
        sqlx::query(statement)
            .execute(self.conn()?)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

/// Map a sqlx error, marking faults worth a transaction retry as transient
fn map_sqlx(e: sqlx::Error) -> StoreError {
    let transient = match &e {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected, connection exceptions
            Some("40001") | Some("40P01") => true,
            Some(code) if code.starts_with("08") => true,
            Some("23505") => return StoreError::Duplicate(db.message().to_string()),
            _ => false,
        },
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        _ => false,
    };

    if transient {
        warn!(error = %e, "transient database error");
        StoreError::Transient(e.to_string())
    } else {
        error!(error = %e, "database error");
        StoreError::Database(e.to_string())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// =============================================================================
// Row mapping
// =============================================================================

const INSTANCE_COLUMNS: &str = "id, definition_id, name, status, current_activity_id, started_by, \
     started_at, completed_at, correlation_id, variables, last_error";

fn instance_from_row(row: &PgRow) -> Result<WorkflowInstance, StoreError> {
    let status: String = row.get("status");
    let variables = match row.get::<serde_json::Value, _>("variables") {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    Ok(WorkflowInstance {
        id: row.get("id"),
        definition_id: row.get("definition_id"),
        name: row.get("name"),
        status: status.parse()?,
        current_activity_id: row.get("current_activity_id"),
        started_by: row.get("started_by"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        correlation_id: row.get("correlation_id"),
        variables,
        last_error: row.get("last_error"),
    })
}

const EXECUTION_COLUMNS: &str = "e.id, e.instance_id, e.activity_id, e.activity_name, \
     e.activity_type, e.status, e.assignee, e.input, e.output, e.error_message, \
     e.started_at, e.completed_at";

fn execution_from_row(row: &PgRow) -> Result<WorkflowActivityExecution, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowActivityExecution {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        activity_id: row.get("activity_id"),
        activity_name: row.get("activity_name"),
        activity_type: row.get("activity_type"),
        status: status.parse()?,
        assignee: row.get("assignee"),
        input: row.get("input"),
        output: row.get("output"),
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

const BOOKMARK_COLUMNS: &str = "id, instance_id, activity_id, bookmark_type, key, correlation_id, \
     payload, due_at, consumed, consumed_by, consumed_at, created_at";

fn bookmark_from_row(row: &PgRow) -> Result<WorkflowBookmark, StoreError> {
    let bookmark_type: String = row.get("bookmark_type");
    Ok(WorkflowBookmark {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        activity_id: row.get("activity_id"),
        bookmark_type: bookmark_type.parse()?,
        key: row.get("key"),
        correlation_id: row.get("correlation_id"),
        payload: row.get("payload"),
        due_at: row.get("due_at"),
        consumed: row.get("consumed"),
        consumed_by: row.get("consumed_by"),
        consumed_at: row.get("consumed_at"),
        created_at: row.get("created_at"),
    })
}

const EXTERNAL_CALL_COLUMNS: &str = "id, instance_id, activity_id, call_type, endpoint, method, \
     request_payload, headers, idempotency_key, status, attempt_count, response_payload, \
     error_message, duration_ms, created_at, updated_at";

fn external_call_from_row(row: &PgRow) -> Result<WorkflowExternalCall, StoreError> {
    let call_type: String = row.get("call_type");
    let status: String = row.get("status");
    let headers: HashMap<String, String> =
        serde_json::from_value(row.get("headers")).map_err(|e| {
            StoreError::Serialization(format!("external call headers: {}", e))
        })?;

    Ok(WorkflowExternalCall {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        activity_id: row.get("activity_id"),
        call_type: call_type.parse()?,
        endpoint: row.get("endpoint"),
        method: row.get("method"),
        request_payload: row.get("request_payload"),
        headers,
        idempotency_key: row.get("idempotency_key"),
        status: status.parse()?,
        attempt_count: row.get::<i32, _>("attempt_count").max(0) as u32,
        response_payload: row.get("response_payload"),
        error_message: row.get("error_message"),
        duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|d| d.max(0) as u64),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const OUTBOX_COLUMNS: &str = "id, event_type, payload, correlation_id, instance_id, activity_id, \
     attempt_count, status, last_error, created_at, processed_at";

fn outbox_from_row(row: &PgRow) -> Result<OutboxMessage, StoreError> {
    let status: String = row.get("status");
    Ok(OutboxMessage {
        id: row.get("id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        correlation_id: row.get("correlation_id"),
        instance_id: row.get("instance_id"),
        activity_id: row.get("activity_id"),
        attempt_count: row.get::<i32, _>("attempt_count").max(0) as u32,
        status: status.parse()?,
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
    })
}

fn log_from_row(row: &PgRow) -> Result<ExecutionLogEntry, StoreError> {
    let kind: String = row.get("kind");
    Ok(ExecutionLogEntry {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        kind: kind.parse()?,
        activity_id: row.get("activity_id"),
        message: row.get("message"),
        actor: row.get("actor"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl WorkflowTransaction for PostgresTransaction {
    // =========================================================================
    // Definitions
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_definition(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowDefinitionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, version, schema_json, created_at
            FROM flowcore_workflow_definitions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(row.map(|row| WorkflowDefinitionRecord {
            id: row.get("id"),
            name: row.get("name"),
            version: row.get("version"),
            schema_json: row.get("schema_json"),
            created_at: row.get("created_at"),
        }))
    }

    #[instrument(skip(self, definition), fields(definition_id = %definition.id))]
    async fn upsert_definition(
        &mut self,
        definition: &WorkflowDefinitionRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flowcore_workflow_definitions (id, name, version, schema_json, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                version = EXCLUDED.version,
                schema_json = EXCLUDED.schema_json
            "#,
        )
        .bind(definition.id)
        .bind(&definition.name)
        .bind(definition.version)
        .bind(&definition.schema_json)
        .bind(definition.created_at)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        debug!(name = %definition.name, version = definition.version, "upserted definition");
        Ok(())
    }

    // =========================================================================
    // Instances
    // =========================================================================

    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn insert_instance(&mut self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flowcore_workflow_instances (
                id, definition_id, name, status, current_activity_id, started_by,
                started_at, completed_at, correlation_id, variables, last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(instance.id)
        .bind(instance.definition_id)
        .bind(&instance.name)
        .bind(instance.status.as_str())
        .bind(&instance.current_activity_id)
        .bind(&instance.started_by)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(&instance.correlation_id)
        .bind(serde_json::Value::Object(instance.variables.clone()))
        .bind(&instance.last_error)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        debug!(name = %instance.name, "inserted instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_instance(&mut self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM flowcore_workflow_instances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(instance_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn get_instance_for_update(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM flowcore_workflow_instances WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(instance_from_row).transpose()
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id, status = %instance.status))]
    async fn update_instance(&mut self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flowcore_workflow_instances
            SET status = $2,
                current_activity_id = $3,
                completed_at = $4,
                correlation_id = $5,
                variables = $6,
                last_error = $7
            WHERE id = $1
            "#,
        )
        .bind(instance.id)
        .bind(instance.status.as_str())
        .bind(&instance.current_activity_id)
        .bind(instance.completed_at)
        .bind(&instance.correlation_id)
        .bind(serde_json::Value::Object(instance.variables.clone()))
        .bind(&instance.last_error)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Database(format!(
                "instance {} does not exist",
                instance.id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_long_running_instances(
        &mut self,
        started_before: DateTime<Utc>,
        limit_to: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM flowcore_workflow_instances
            WHERE status = 'running' AND started_at < $1
            ORDER BY started_at
            LIMIT $2
            "#
        ))
        .bind(started_before)
        .bind(limit(limit_to))
        .fetch_all(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(instance_from_row).collect()
    }

    // =========================================================================
    // Activity executions
    // =========================================================================

    #[instrument(skip(self, execution), fields(instance_id = %execution.instance_id, activity_id = %execution.activity_id))]
    async fn insert_activity_execution(
        &mut self,
        execution: &WorkflowActivityExecution,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flowcore_activity_executions (
                id, instance_id, activity_id, activity_name, activity_type, status,
                assignee, input, output, error_message, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(execution.id)
        .bind(execution.instance_id)
        .bind(&execution.activity_id)
        .bind(&execution.activity_name)
        .bind(&execution.activity_type)
        .bind(execution.status.as_str())
        .bind(&execution.assignee)
        .bind(&execution.input)
        .bind(&execution.output)
        .bind(&execution.error_message)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn update_activity_execution(
        &mut self,
        execution: &WorkflowActivityExecution,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE flowcore_activity_executions
            SET status = $2,
                assignee = $3,
                output = $4,
                error_message = $5,
                completed_at = $6
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(execution.status.as_str())
        .bind(&execution.assignee)
        .bind(&execution.output)
        .bind(&execution.error_message)
        .bind(execution.completed_at)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_open_activity_execution(
        &mut self,
        instance_id: Uuid,
        activity_id: &str,
    ) -> Result<Option<WorkflowActivityExecution>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM flowcore_activity_executions e
            WHERE e.instance_id = $1 AND e.activity_id = $2 AND e.status = 'started'
            ORDER BY e.started_at DESC
            LIMIT 1
            "#
        ))
        .bind(instance_id)
        .bind(activity_id)
        .fetch_optional(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(execution_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_activity_executions(
        &mut self,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowActivityExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM flowcore_activity_executions e
            WHERE e.instance_id = $1
            ORDER BY e.started_at, e.id
            "#
        ))
        .bind(instance_id)
        .fetch_all(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_open_executions_for_assignee(
        &mut self,
        assignee: &str,
    ) -> Result<Vec<WorkflowActivityExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM flowcore_activity_executions e
            JOIN flowcore_workflow_instances i ON i.id = e.instance_id
            WHERE e.assignee = $1 AND e.status = 'started' AND i.status = 'running'
            ORDER BY e.started_at
            "#
        ))
        .bind(assignee)
        .fetch_all(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(execution_from_row).collect()
    }

    // =========================================================================
    // Bookmarks
    // =========================================================================

    #[instrument(skip(self))]
    async fn find_unconsumed_bookmark(
        &mut self,
        instance_id: Uuid,
        activity_id: &str,
        key: &str,
        bookmark_type: Option<BookmarkType>,
    ) -> Result<Option<WorkflowBookmark>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {BOOKMARK_COLUMNS}
            FROM flowcore_bookmarks
            WHERE instance_id = $1 AND activity_id = $2 AND key = $3
              AND ($4::text IS NULL OR bookmark_type = $4)
              AND NOT consumed
            ORDER BY created_at
            LIMIT 1
            "#
        ))
        .bind(instance_id)
        .bind(activity_id)
        .bind(key)
        .bind(bookmark_type.map(|t| t.as_str()))
        .fetch_optional(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(bookmark_from_row).transpose()
    }

    #[instrument(skip(self, bookmark), fields(bookmark_id = %bookmark.id, key = %bookmark.key))]
    async fn insert_bookmark(&mut self, bookmark: &WorkflowBookmark) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO flowcore_bookmarks (
                id, instance_id, activity_id, bookmark_type, key, correlation_id,
                payload, due_at, consumed, consumed_by, consumed_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(bookmark.id)
        .bind(bookmark.instance_id)
        .bind(&bookmark.activity_id)
        .bind(bookmark.bookmark_type.as_str())
        .bind(&bookmark.key)
        .bind(&bookmark.correlation_id)
        .bind(&bookmark.payload)
        .bind(bookmark.due_at)
        .bind(bookmark.consumed)
        .bind(&bookmark.consumed_by)
        .bind(bookmark.consumed_at)
        .bind(bookmark.created_at)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn get_bookmark_for_update(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowBookmark>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BOOKMARK_COLUMNS} FROM flowcore_bookmarks WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(bookmark_from_row).transpose()
    }

    #[instrument(skip(self, payload))]
    async fn mark_bookmark_consumed(
        &mut self,
        id: Uuid,
        consumed_by: &str,
        consumed_at: DateTime<Utc>,
        payload: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flowcore_bookmarks
            SET consumed = TRUE,
                consumed_by = $2,
                consumed_at = $3,
                payload = COALESCE($4, payload)
            WHERE id = $1 AND NOT consumed
            "#,
        )
        .bind(id)
        .bind(consumed_by)
        .bind(consumed_at)
        .bind(&payload)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_due_timer_bookmarks(
        &mut self,
        up_to: DateTime<Utc>,
        limit_to: usize,
    ) -> Result<Vec<WorkflowBookmark>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {BOOKMARK_COLUMNS}
            FROM flowcore_bookmarks
            WHERE bookmark_type = 'timer' AND NOT consumed AND due_at <= $1
            ORDER BY due_at
            LIMIT $2
            "#
        ))
        .bind(up_to)
        .bind(limit(limit_to))
        .fetch_all(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(bookmark_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn delete_consumed_bookmarks(
        &mut self,
        before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM flowcore_bookmarks WHERE consumed AND consumed_at < $1")
                .bind(before)
                .execute(self.conn()?)
                .await
                .map_err(map_sqlx)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn list_bookmarks(
        &mut self,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowBookmark>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BOOKMARK_COLUMNS} FROM flowcore_bookmarks WHERE instance_id = $1 ORDER BY created_at"
        ))
        .bind(instance_id)
        .fetch_all(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(bookmark_from_row).collect()
    }

    // =========================================================================
    // External calls
    // =========================================================================

    #[instrument(skip(self))]
    async fn find_external_call(
        &mut self,
        instance_id: Uuid,
        activity_id: &str,
        endpoint: &str,
        method: &str,
    ) -> Result<Option<WorkflowExternalCall>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {EXTERNAL_CALL_COLUMNS}
            FROM flowcore_external_calls
            WHERE instance_id = $1 AND activity_id = $2 AND endpoint = $3 AND method = $4
            "#
        ))
        .bind(instance_id)
        .bind(activity_id)
        .bind(endpoint)
        .bind(method)
        .fetch_optional(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(external_call_from_row).transpose()
    }

    #[instrument(skip(self, call), fields(call_id = %call.id, endpoint = %call.endpoint))]
    async fn insert_external_call(
        &mut self,
        call: &WorkflowExternalCall,
    ) -> Result<bool, StoreError> {
        let headers = to_json(&call.headers)?;
        let result = sqlx::query(
            r#"
            INSERT INTO flowcore_external_calls (
                id, instance_id, activity_id, call_type, endpoint, method, request_payload,
                headers, idempotency_key, status, attempt_count, response_payload,
                error_message, duration_ms, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(call.id)
        .bind(call.instance_id)
        .bind(&call.activity_id)
        .bind(call.call_type.as_str())
        .bind(&call.endpoint)
        .bind(&call.method)
        .bind(&call.request_payload)
        .bind(&headers)
        .bind(&call.idempotency_key)
        .bind(call.status.as_str())
        .bind(call.attempt_count as i32)
        .bind(&call.response_payload)
        .bind(&call.error_message)
        .bind(call.duration_ms.map(|d| d as i64))
        .bind(call.created_at)
        .bind(call.updated_at)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn get_external_call(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowExternalCall>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXTERNAL_CALL_COLUMNS} FROM flowcore_external_calls WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(external_call_from_row).transpose()
    }

    #[instrument(skip(self, call), fields(call_id = %call.id, status = %call.status))]
    async fn update_external_call(
        &mut self,
        call: &WorkflowExternalCall,
        expected: ExternalCallStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flowcore_external_calls
            SET status = $3,
                attempt_count = $4,
                response_payload = $5,
                error_message = $6,
                duration_ms = $7,
                updated_at = $8
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(call.id)
        .bind(expected.as_str())
        .bind(call.status.as_str())
        .bind(call.attempt_count as i32)
        .bind(&call.response_payload)
        .bind(&call.error_message)
        .bind(call.duration_ms.map(|d| d as i64))
        .bind(call.updated_at)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_retryable_external_calls(
        &mut self,
        max_attempts: u32,
        limit_to: usize,
    ) -> Result<Vec<WorkflowExternalCall>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXTERNAL_CALL_COLUMNS}
            FROM flowcore_external_calls
            WHERE status IN ('failed', 'timed_out') AND attempt_count < $1
            ORDER BY updated_at
            LIMIT $2
            "#
        ))
        .bind(max_attempts as i32)
        .bind(limit(limit_to))
        .fetch_all(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(external_call_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_stale_external_calls(
        &mut self,
        started_before: DateTime<Utc>,
        limit_to: usize,
    ) -> Result<Vec<WorkflowExternalCall>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXTERNAL_CALL_COLUMNS}
            FROM flowcore_external_calls
            WHERE status = 'started' AND updated_at < $1
            ORDER BY updated_at
            LIMIT $2
            "#
        ))
        .bind(started_before)
        .bind(limit(limit_to))
        .fetch_all(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(external_call_from_row).collect()
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    #[instrument(skip(self, message), fields(message_id = %message.id, event_type = %message.event_type))]
    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flowcore_outbox (
                id, event_type, payload, correlation_id, instance_id, activity_id,
                attempt_count, status, last_error, created_at, processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(message.id)
        .bind(&message.event_type)
        .bind(&message.payload)
        .bind(&message.correlation_id)
        .bind(message.instance_id)
        .bind(&message.activity_id)
        .bind(message.attempt_count as i32)
        .bind(message.status.as_str())
        .bind(&message.last_error)
        .bind(message.created_at)
        .bind(message.processed_at)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_pending_outbox(
        &mut self,
        limit_to: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM flowcore_outbox
            WHERE status = 'pending'
            ORDER BY created_at
            LIMIT $1
            "#
        ))
        .bind(limit(limit_to))
        .fetch_all(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(outbox_from_row).collect()
    }

    #[instrument(skip(self, message), fields(message_id = %message.id, status = %message.status))]
    async fn update_outbox(
        &mut self,
        message: &OutboxMessage,
        expected: OutboxStatus,
        expected_attempts: u32,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flowcore_outbox
            SET status = $3,
                attempt_count = $4,
                last_error = $5,
                processed_at = $6
            WHERE id = $1 AND status = $2 AND attempt_count = $7
            "#,
        )
        .bind(message.id)
        .bind(expected.as_str())
        .bind(message.status.as_str())
        .bind(message.attempt_count as i32)
        .bind(&message.last_error)
        .bind(message.processed_at)
        .bind(expected_attempts as i32)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn delete_processed_outbox(&mut self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM flowcore_outbox WHERE status = 'processed' AND processed_at < $1",
        )
        .bind(before)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Execution log
    // =========================================================================

    #[instrument(skip(self, entry), fields(instance_id = %entry.instance_id, kind = %entry.kind))]
    async fn append_log(&mut self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flowcore_execution_log (
                id, instance_id, kind, activity_id, message, actor, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.instance_id)
        .bind(entry.kind.as_str())
        .bind(&entry.activity_id)
        .bind(&entry.message)
        .bind(&entry.actor)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn count_logs(
        &mut self,
        instance_id: Uuid,
        kind: LogEventKind,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM flowcore_execution_log
            WHERE instance_id = $1 AND kind = $2 AND created_at >= $3
            "#,
        )
        .bind(instance_id)
        .bind(kind.as_str())
        .bind(since)
        .fetch_one(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        Ok(row.get::<i64, _>("total").max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn list_logs(
        &mut self,
        instance_id: Uuid,
    ) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, kind, activity_id, message, actor, metadata, created_at
            FROM flowcore_execution_log
            WHERE instance_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(instance_id)
        .fetch_all(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(log_from_row).collect()
    }

    // =========================================================================
    // Locks and lifecycle
    // =========================================================================

    #[instrument(skip(self))]
    async fn acquire_application_lock(
        &mut self,
        resource: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<AppLockStatus, StoreError> {
        let (try_fn, wait_fn) = match mode {
            LockMode::Shared => (
                "pg_try_advisory_xact_lock_shared",
                "pg_advisory_xact_lock_shared",
            ),
            LockMode::Exclusive => ("pg_try_advisory_xact_lock", "pg_advisory_xact_lock"),
        };

        let row = sqlx::query(&format!("SELECT {try_fn}(hashtext($1)) AS granted"))
            .bind(resource)
            .fetch_one(self.conn()?)
            .await
            .map_err(map_sqlx)?;
        if row.get::<bool, _>("granted") {
            return Ok(AppLockStatus::Granted);
        }

        // A failed wait aborts the transaction unless it ran in a savepoint
        self.execute_raw("SAVEPOINT flowcore_app_lock").await?;
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            timeout.as_millis().max(1)
        ))
        .execute(self.conn()?)
        .await
        .map_err(map_sqlx)?;

        let waited = sqlx::query(&format!("SELECT {wait_fn}(hashtext($1))"))
            .bind(resource)
            .execute(self.conn()?)
            .await;

        let status = match waited {
            Ok(_) => AppLockStatus::GrantedAfterWait,
            Err(sqlx::Error::Database(db)) => match db.code().as_deref() {
                Some("55P03") => AppLockStatus::Timeout,
                Some("40P01") => AppLockStatus::Deadlock,
                Some("57014") => AppLockStatus::Cancelled,
                _ => AppLockStatus::Error,
            },
            Err(e) => return Err(map_sqlx(e)),
        };

        if status.is_granted() {
            self.execute_raw("SET LOCAL lock_timeout = DEFAULT").await?;
        } else {
            self.execute_raw("ROLLBACK TO SAVEPOINT flowcore_app_lock").await?;
        }
        self.execute_raw("RELEASE SAVEPOINT flowcore_app_lock").await?;

        debug!(%resource, ?status, "application lock requested");
        Ok(status)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.rollback().await.map_err(map_sqlx)
    }
}
