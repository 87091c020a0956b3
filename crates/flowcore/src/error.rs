//! Facade error type

use uuid::Uuid;

use crate::engine::EngineError;
use crate::fault::RecommendedAction;
use crate::model::InstanceStatus;
use crate::persistence::{StoreError, TransientError};
use crate::schema::SchemaError;

/// Errors surfaced by the orchestrator and the workflow service
///
/// Variants follow the fault taxonomy; [`crate::fault::classify`] maps each
/// one to a [`crate::fault::FaultKind`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// Malformed input
    #[error("validation failed: {0}")]
    Validation(String),

    /// Schema rejected by the secure deserializer
    #[error("invalid workflow schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(Uuid),

    #[error("activity '{activity_id}' not found in workflow schema")]
    ActivityNotFound { activity_id: String },

    /// Instance exists but cannot run in its current status
    #[error("workflow {instance_id} is {status}, not runnable")]
    NotRunnable {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Downstream failure during an external call
    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Local retries are spent; carries the fault handler's recommendation
    #[error("{message} (recommended action: {recommendation})")]
    Exhausted {
        message: String,
        recommendation: RecommendedAction,
    },
}

impl TransientError for OrchestrationError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) | Self::Engine(EngineError::Store(e)) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_only_for_store_faults() {
        assert!(OrchestrationError::Store(StoreError::Transient("x".into())).is_transient());
        assert!(
            OrchestrationError::Engine(EngineError::Store(StoreError::Transient("x".into())))
                .is_transient()
        );
        assert!(!OrchestrationError::Engine(EngineError::Transient("x".into())).is_transient());
        assert!(!OrchestrationError::Timeout("x".into()).is_transient());
    }

    #[test]
    fn test_exhausted_message_carries_recommendation() {
        let err = OrchestrationError::Exhausted {
            message: "activity failed".into(),
            recommendation: RecommendedAction::ManualIntervention,
        };
        assert_eq!(
            err.to_string(),
            "activity failed (recommended action: manual_intervention)"
        );
    }
}
