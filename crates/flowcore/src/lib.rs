//! # Flowcore
//!
//! A durable workflow orchestration core backed by PostgreSQL.
//!
//! ## Features
//!
//! - **Transactional steps**: every workflow step runs in one database
//!   transaction, retried as a whole on transient faults
//! - **Bookmarks**: activities suspend on human actions, timers or external
//!   messages; each bookmark is consumed at most once
//! - **Two-phase external calls**: the intent is recorded inside the step,
//!   the call happens after commit, guarded by an idempotency key
//! - **Transactional outbox**: lifecycle events are queued with the state
//!   change and delivered by a background dispatcher
//! - **Fault handling**: classification, retry/suspend decisions and
//!   compensation plans
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowService                         │
//! │  (start / resume / cancel, user tasks, lifecycle events)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                           │
//! │  (one transaction per step, ActivityEngine, FaultHandler)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │             TransactionGateway / WorkflowStore               │
//! │  (PostgreSQL: instances, bookmarks, calls, outbox, log)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (OutboxDispatcher, TimerSweeper)                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowcore::prelude::*;
//!
//! struct Approve;
//!
//! #[async_trait]
//! impl ActivityEngine for Approve {
//!     async fn execute(
//!         &self,
//!         ctx: &mut StepContext<'_>,
//!         _schema: &WorkflowSchema,
//!         _instance: &WorkflowInstance,
//!         _activity: &ActivityDefinition,
//!         input: Option<Value>,
//!         is_resume: bool,
//!         _cancel: &CancellationToken,
//!     ) -> Result<WorkflowExecutionResult, EngineError> {
//!         if is_resume {
//!             let output = input.unwrap_or(Value::Null);
//!             return Ok(WorkflowExecutionResult::step_completed(None).with_output(output));
//!         }
//!         ctx.wait_for_user("approval").await?;
//!         Ok(WorkflowExecutionResult::pending())
//!     }
//! }
//!
//! let gateway = TransactionGateway::new(Arc::new(InMemoryWorkflowStore::new()));
//! let engine = ActivityRegistry::new().with_handler("approval", Arc::new(Approve));
//! let service = WorkflowService::new(gateway.clone(), Orchestrator::new(gateway, Arc::new(engine)));
//!
//! let instance = service
//!     .start_workflow(StartWorkflowRequest::new(definition_id, "alice"), &CancellationToken::new())
//!     .await?;
//! ```

pub mod bookmark;
pub mod config;
pub mod engine;
pub mod error;
pub mod external_call;
pub mod fault;
pub mod model;
pub mod persistence;
pub mod reliability;
pub mod schema;
pub mod service;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::bookmark::{BookmarkRequest, BookmarkStore, ConsumeOutcome};
    pub use crate::config::FlowcoreConfig;
    pub use crate::engine::{
        ActivityEngine, ActivityRegistry, EngineError, ExecutionStatus, Orchestrator,
        StepContext, WorkflowExecutionResult,
    };
    pub use crate::error::OrchestrationError;
    pub use crate::external_call::{ExternalCallGateway, ExternalCallRequest};
    pub use crate::fault::{FaultHandler, FaultKind, RecommendedAction};
    pub use crate::model::{
        InstanceStatus, OutboxEventType, WorkflowActivityExecution, WorkflowInstance,
    };
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, TransactionGateway,
    };
    pub use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
    pub use crate::schema::{ActivityDefinition, WorkflowSchema};
    pub use crate::service::{EventPublisher, StartWorkflowRequest, WorkflowService};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig};
    pub use async_trait::async_trait;
    pub use serde_json::Value;
    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at crate root
pub use bookmark::{BookmarkRequest, BookmarkStore};
pub use config::FlowcoreConfig;
pub use engine::{ActivityEngine, ActivityRegistry, EngineError, Orchestrator};
pub use error::OrchestrationError;
pub use external_call::{ExternalCallGateway, ExternalCallRequest};
pub use fault::{FaultHandler, FaultKind};
pub use persistence::{
    InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, TransactionGateway, WorkflowStore,
};
pub use reliability::{CircuitBreakerConfig, RetryPolicy};
pub use service::{StartWorkflowRequest, WorkflowService};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
