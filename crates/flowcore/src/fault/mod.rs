//! Fault classification, retry and suspension decisions, compensation plans
//!
//! [`classify`] is a pure function from [`OrchestrationError`](crate::OrchestrationError)
//! to [`FaultKind`]. [`FaultHandler`] turns a kind plus the attempt number
//! into a [`FaultHandlingResult`] for each orchestration context.

mod classification;
mod compensation;
mod handler;

pub use classification::{classify, classify_engine, FaultKind, RecommendedAction};
pub use compensation::{
    CompensationAction, CompensationPlan, CompensationStep, CompensationStrategy,
};
pub use handler::{FaultHandler, FaultHandlingResult};
