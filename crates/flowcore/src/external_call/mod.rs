//! Two-phase external calls
//!
//! - [`ExternalCallGateway`] records intents and performs them after commit
//! - [`CallExecutor`] implementations do the actual I/O per [`ExternalCallType`](crate::model::ExternalCallType)
//! - [`ResiliencePipeline`] wraps every dispatch in a circuit breaker and a timeout

mod executor;
mod gateway;
mod resilience;

pub use executor::{
    CallExecutor, ExecutorError, ExecutorRegistry, HttpCallExecutor, PlaceholderExecutor,
    IDEMPOTENCY_KEY_HEADER,
};
pub use gateway::{ExternalCallGateway, ExternalCallOutcome, ExternalCallRequest};
pub use resilience::ResiliencePipeline;
