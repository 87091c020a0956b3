//! Workflow service facade and lifecycle events

mod events;
mod workflow;

pub use events::{EventPublisher, PublishError, TracingEventPublisher};
pub use workflow::{StartWorkflowRequest, WorkflowService};
