//! Workflow orchestration
//!
//! The [`Orchestrator`] drives instances step by step through an
//! [`ActivityEngine`]; [`ActivityRegistry`] dispatches to per-type engines.

mod contract;
mod orchestrator;
mod registry;

pub use contract::{
    ActivityEngine, EngineError, ExecutionStatus, StepContext, WorkflowExecutionResult,
};
pub use orchestrator::{Orchestrator, DEFAULT_MAX_STEPS};
pub use registry::ActivityRegistry;
