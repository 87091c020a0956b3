//! Transaction gateway
//!
//! Every unit of work runs through [`TransactionGateway::run_in_transaction`]:
//! begin, run the body, commit. A transient fault (deadlock, serialization
//! failure, dropped connection, pool timeout) rolls the transaction back and
//! the whole body runs again after a backoff delay.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::store::{IsolationLevel, StoreError, TransientError, WorkflowStore, WorkflowTransaction};
use crate::error::OrchestrationError;
use crate::model::WorkflowDefinitionRecord;
use crate::reliability::RetryPolicy;
use crate::schema::{deserialize_schema, SchemaLimits, WorkflowSchema};

/// Runs units of work against a [`WorkflowStore`] with transient-fault retry
#[derive(Clone)]
pub struct TransactionGateway {
    store: Arc<dyn WorkflowStore>,
    retry_policy: RetryPolicy,
    schema_limits: SchemaLimits,
}

impl TransactionGateway {
    /// Create a gateway with the default retry policy and schema limits
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            store,
            retry_policy: RetryPolicy::exponential()
                .with_max_attempts(3)
                .with_initial_interval(std::time::Duration::from_millis(100))
                .with_max_interval(std::time::Duration::from_secs(2)),
            schema_limits: SchemaLimits::default(),
        }
    }

    /// Set the retry policy for transient faults
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the limits applied when loading schemas
    pub fn with_schema_limits(mut self, limits: SchemaLimits) -> Self {
        self.schema_limits = limits;
        self
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Limits applied when loading schemas
    pub fn schema_limits(&self) -> &SchemaLimits {
        &self.schema_limits
    }

    /// Run `op` inside one transaction, retrying on transient faults
    ///
    /// The body may run more than once. It must not perform side effects
    /// outside the transaction (network calls, event publishing) because a
    /// retried or rolled-back attempt cannot undo them. Record intents in
    /// the transaction instead and act on them after commit.
    ///
    /// The body receives the transaction by reference and returns a boxed
    /// future, so captured values must be owned (clone them per attempt):
    ///
    /// ```ignore
    /// let instance = gateway
    ///     .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
    ///         Box::pin(async move { tx.get_instance(id).await })
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_in_transaction<T, E, F>(
        &self,
        isolation: IsolationLevel,
        mut op: F,
    ) -> Result<T, E>
    where
        F: for<'a> FnMut(&'a mut dyn WorkflowTransaction) -> BoxFuture<'a, Result<T, E>> + Send,
        E: From<StoreError> + TransientError + std::fmt::Display + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match self.attempt_transaction(isolation, &mut op).await {
                Err(e) if e.is_transient() && self.retry_policy.has_attempts_remaining(attempt) => {
                    let delay = self.retry_policy.delay_after_failures(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient fault, retrying transaction"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn attempt_transaction<T, E, F>(
        &self,
        isolation: IsolationLevel,
        op: &mut F,
    ) -> Result<T, E>
    where
        F: for<'a> FnMut(&'a mut dyn WorkflowTransaction) -> BoxFuture<'a, Result<T, E>> + Send,
        E: From<StoreError> + TransientError + std::fmt::Display + Send,
        T: Send,
    {
        let mut tx = self.store.begin(isolation).await?;
        match op(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Retry a multi-transaction operation on transient faults
    ///
    /// Same policy as [`run_in_transaction`](Self::run_in_transaction), for
    /// operations that open several transactions of their own.
    pub async fn execute_database_operation<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: TransientError + std::fmt::Display + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && self.retry_policy.has_attempts_remaining(attempt) => {
                    let delay = self.retry_policy.delay_after_failures(attempt);
                    warn!(attempt, error = %e, "transient fault, retrying operation");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Validate and store a workflow definition
    #[instrument(skip(self, definition), fields(definition_id = %definition.id, name = %definition.name))]
    pub async fn register_definition(
        &self,
        definition: WorkflowDefinitionRecord,
    ) -> Result<WorkflowDefinitionRecord, OrchestrationError> {
        deserialize_schema(&definition.schema_json, &self.schema_limits)?;

        let stored = definition.clone();
        self.run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
            let stored = stored.clone();
            Box::pin(async move { tx.upsert_definition(&stored).await })
        })
        .await?;

        debug!("registered definition");
        Ok(definition)
    }

    /// Load and validate the schema of a stored definition
    pub async fn load_schema(&self, definition_id: Uuid) -> Result<WorkflowSchema, OrchestrationError> {
        let limits = self.schema_limits.clone();
        self.run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
            let limits = limits.clone();
            Box::pin(async move { load_schema_in(tx, definition_id, &limits).await })
        })
        .await
    }
}

/// Load and validate a definition's schema inside an open transaction
pub async fn load_schema_in(
    tx: &mut dyn WorkflowTransaction,
    definition_id: Uuid,
    limits: &SchemaLimits,
) -> Result<WorkflowSchema, OrchestrationError> {
    let definition = tx
        .get_definition(definition_id)
        .await?
        .ok_or(OrchestrationError::DefinitionNotFound(definition_id))?;
    Ok(deserialize_schema(&definition.schema_json, limits)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowInstance;
    use crate::persistence::InMemoryWorkflowStore;
    use std::time::Duration;

    fn gateway(store: &InMemoryWorkflowStore) -> TransactionGateway {
        TransactionGateway::new(Arc::new(store.clone())).with_retry_policy(RetryPolicy::fixed(
            Duration::from_millis(1),
            3,
        ))
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let store = InMemoryWorkflowStore::new();
        let gateway = gateway(&store);
        let instance = WorkflowInstance::new(Uuid::now_v7(), "wf", "alice");

        let id = instance.id;
        gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let instance = instance.clone();
                Box::pin(async move { tx.insert_instance(&instance).await })
            })
            .await
            .unwrap();

        let loaded = gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.get_instance(id).await })
            })
            .await
            .unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn test_error_rolls_back() {
        let store = InMemoryWorkflowStore::new();
        let gateway = gateway(&store);
        let instance = WorkflowInstance::new(Uuid::now_v7(), "wf", "alice");

        let result: Result<(), StoreError> = gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let instance = instance.clone();
                Box::pin(async move {
                    tx.insert_instance(&instance).await?;
                    Err(StoreError::Database("constraint".into()))
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_commit_failure_retries_body() {
        let store = InMemoryWorkflowStore::new();
        let gateway = gateway(&store);
        store.fail_next_commits(2);

        let runs = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = runs.clone();
        gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let instance = WorkflowInstance::new(Uuid::now_v7(), "wf", "alice");
                Box::pin(async move { tx.insert_instance(&instance).await })
            })
            .await
            .unwrap();

        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(store.instance_count().await, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_attempts() {
        let store = InMemoryWorkflowStore::new();
        let gateway = gateway(&store);
        store.fail_next_commits(10);

        let result = gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, |tx| {
                let instance = WorkflowInstance::new(Uuid::now_v7(), "wf", "alice");
                Box::pin(async move { tx.insert_instance(&instance).await })
            })
            .await;

        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert_eq!(store.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_schema() {
        let store = InMemoryWorkflowStore::new();
        let gateway = gateway(&store);

        let definition = WorkflowDefinitionRecord::new("broken", 1, r#"{"name":"x","activities":[]}"#);
        let err = gateway.register_definition(definition).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Schema(_)));
    }

    #[tokio::test]
    async fn test_load_schema_round_trip() {
        let store = InMemoryWorkflowStore::new();
        let gateway = gateway(&store);

        let definition = WorkflowDefinitionRecord::new(
            "approval",
            1,
            r#"{"name":"approval","activities":[{"id":"review","type":"UserTask"}]}"#,
        );
        let id = definition.id;
        gateway.register_definition(definition).await.unwrap();

        let schema = gateway.load_schema(id).await.unwrap();
        assert_eq!(schema.name, "approval");

        let missing = gateway.load_schema(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(missing, OrchestrationError::DefinitionNotFound(_)));
    }
}
