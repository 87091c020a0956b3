//! Workflow schemas and their secure deserialization
//!
//! A schema is an already-authored, opaque description of activities and the
//! transitions between them. Nothing here interprets activity semantics; the
//! orchestrator only needs to locate activities and follow transitions.

mod definition;
mod validation;

pub use definition::{ActivityDefinition, Transition, WorkflowSchema};
pub use validation::{deserialize_schema, validate_schema, SchemaError, SchemaLimits};
