//! Persistence layer for workflow orchestration
//!
//! This module provides:
//! - [`WorkflowStore`] / [`WorkflowTransaction`] traits for transactional record access
//! - [`TransactionGateway`] for running units of work with transient-fault retry
//! - [`InMemoryWorkflowStore`] for testing
//! - [`PostgresWorkflowStore`] for production

mod gateway;
mod memory;
mod postgres;
mod store;

pub use gateway::{load_schema_in, TransactionGateway};
pub use memory::InMemoryWorkflowStore;
pub use postgres::{migrate, PostgresTransaction, PostgresWorkflowStore};
pub use store::{
    AppLockStatus, IsolationLevel, LockMode, StoreError, TransientError, WorkflowStore,
    WorkflowTransaction,
};
