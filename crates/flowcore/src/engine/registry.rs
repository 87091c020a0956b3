//! Engine that dispatches by activity type
//!
//! Maps each `activity_type` of a schema to the engine that handles it, so
//! hosts can plug in per-type implementations behind one
//! [`ActivityEngine`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::contract::{ActivityEngine, EngineError, StepContext, WorkflowExecutionResult};
use crate::model::WorkflowInstance;
use crate::schema::{ActivityDefinition, WorkflowSchema};

/// Registry of engines keyed by activity type
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, Arc<dyn ActivityEngine>>,
}

impl ActivityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the engine for an activity type
    pub fn register(&mut self, activity_type: impl Into<String>, handler: Arc<dyn ActivityEngine>) {
        self.handlers.insert(activity_type.into(), handler);
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_handler(
        mut self,
        activity_type: impl Into<String>,
        handler: Arc<dyn ActivityEngine>,
    ) -> Self {
        self.register(activity_type, handler);
        self
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    /// Activity types of `schema` with no registered handler
    pub fn missing_types<'s>(&self, schema: &'s WorkflowSchema) -> Vec<&'s str> {
        let mut missing: Vec<&str> = schema
            .activities
            .iter()
            .map(|a| a.activity_type.as_str())
            .filter(|t| !self.contains(t))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl ActivityEngine for ActivityRegistry {
    async fn execute(
        &self,
        ctx: &mut StepContext<'_>,
        schema: &WorkflowSchema,
        instance: &WorkflowInstance,
        activity: &ActivityDefinition,
        input: Option<Value>,
        is_resume: bool,
        cancel: &CancellationToken,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        let handler = self
            .handlers
            .get(&activity.activity_type)
            .ok_or_else(|| EngineError::NotSupported(activity.activity_type.clone()))?;
        handler
            .execute(ctx, schema, instance, activity, input, is_resume, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowStore, IsolationLevel, WorkflowStore};
    use uuid::Uuid;

    struct Echo;

    #[async_trait]
    impl ActivityEngine for Echo {
        async fn execute(
            &self,
            _ctx: &mut StepContext<'_>,
            _schema: &WorkflowSchema,
            _instance: &WorkflowInstance,
            _activity: &ActivityDefinition,
            input: Option<Value>,
            _is_resume: bool,
            _cancel: &CancellationToken,
        ) -> Result<WorkflowExecutionResult, EngineError> {
            Ok(WorkflowExecutionResult::step_completed(None).with_output(input.unwrap_or(Value::Null)))
        }
    }

    fn schema() -> WorkflowSchema {
        WorkflowSchema::new("orders")
            .with_activity(ActivityDefinition::new("receive", "Echo"))
            .with_activity(ActivityDefinition::new("ship", "Shipment"))
            .with_transition("receive", "ship")
    }

    #[test]
    fn test_missing_types() {
        let registry = ActivityRegistry::new().with_handler("Echo", Arc::new(Echo));
        assert_eq!(registry.missing_types(&schema()), vec!["Shipment"]);
        assert_eq!(registry.len(), 1);
        assert!(format!("{:?}", registry).contains("Echo"));
    }

    #[tokio::test]
    async fn test_dispatch_by_type() {
        let registry = ActivityRegistry::new().with_handler("Echo", Arc::new(Echo));
        let store = InMemoryWorkflowStore::new();
        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let schema = schema();
        let instance = WorkflowInstance::new(Uuid::now_v7(), "orders", "alice");
        let cancel = CancellationToken::new();

        let mut ctx = StepContext::new(&mut *tx, instance.id, "receive");
        let result = registry
            .execute(
                &mut ctx,
                &schema,
                &instance,
                &schema.activities[0],
                Some(serde_json::json!(7)),
                false,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(result.output, Some(serde_json::json!(7)));

        let mut ctx = StepContext::new(&mut *tx, instance.id, "ship");
        let err = registry
            .execute(&mut ctx, &schema, &instance, &schema.activities[1], None, false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotSupported(t) if t == "Shipment"));
    }
}
