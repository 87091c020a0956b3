//! Fault classification

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::error::OrchestrationError;
use crate::model::text_enum;
use crate::persistence::StoreError;

/// Closed fault taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Validation,
    Authorization,
    NotSupported,
    Timeout,
    Transient,
    Concurrency,
    ExternalService,
    /// Instance missing or not runnable
    WorkflowState,
    Cancelled,
    Unknown,
}

text_enum!(FaultKind, "fault kind", {
    Validation => "validation",
    Authorization => "authorization",
    NotSupported => "not_supported",
    Timeout => "timeout",
    Transient => "transient",
    Concurrency => "concurrency",
    ExternalService => "external_service",
    WorkflowState => "workflow_state",
    Cancelled => "cancelled",
    Unknown => "unknown",
});

impl FaultKind {
    /// Retried locally in every context
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient | Self::Concurrency)
    }

    /// Caller error; retrying cannot help
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Validation | Self::Authorization | Self::NotSupported | Self::WorkflowState
        )
    }
}

/// What an operator or supervisor should do about a surfaced fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Retry,
    Suspend,
    Compensate,
    ManualIntervention,
    Fail,
}

text_enum!(RecommendedAction, "recommended action", {
    Retry => "retry",
    Suspend => "suspend",
    Compensate => "compensate",
    ManualIntervention => "manual_intervention",
    Fail => "fail",
});

/// Map an error to its fault kind
pub fn classify(error: &OrchestrationError) -> FaultKind {
    match error {
        OrchestrationError::Validation(_) | OrchestrationError::Schema(_) => FaultKind::Validation,
        OrchestrationError::Authorization(_) => FaultKind::Authorization,
        OrchestrationError::NotSupported(_) => FaultKind::NotSupported,
        OrchestrationError::InstanceNotFound(_)
        | OrchestrationError::DefinitionNotFound(_)
        | OrchestrationError::ActivityNotFound { .. }
        | OrchestrationError::NotRunnable { .. } => FaultKind::WorkflowState,
        OrchestrationError::Timeout(_) => FaultKind::Timeout,
        OrchestrationError::Concurrency(_) => FaultKind::Concurrency,
        OrchestrationError::ExternalService(_) => FaultKind::ExternalService,
        OrchestrationError::Cancelled => FaultKind::Cancelled,
        OrchestrationError::Store(e) => classify_store(e),
        OrchestrationError::Engine(e) => classify_engine(e),
        OrchestrationError::Exhausted { .. } => FaultKind::Unknown,
    }
}

/// Map an engine error to its fault kind
pub fn classify_engine(error: &EngineError) -> FaultKind {
    match error {
        EngineError::Validation(_) => FaultKind::Validation,
        EngineError::Authorization(_) => FaultKind::Authorization,
        EngineError::NotSupported(_) => FaultKind::NotSupported,
        EngineError::Timeout(_) => FaultKind::Timeout,
        EngineError::Transient(_) => FaultKind::Transient,
        EngineError::ExternalService(_) => FaultKind::ExternalService,
        EngineError::Failed(_) => FaultKind::Unknown,
        EngineError::Cancelled => FaultKind::Cancelled,
        EngineError::Store(e) => classify_store(e),
    }
}

fn classify_store(error: &StoreError) -> FaultKind {
    match error {
        StoreError::Transient(_) => FaultKind::Transient,
        StoreError::Duplicate(_) => FaultKind::Concurrency,
        _ => FaultKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceStatus;
    use uuid::Uuid;

    #[test]
    fn test_classify_facade_errors() {
        let cases = [
            (OrchestrationError::Validation("x".into()), FaultKind::Validation),
            (OrchestrationError::Authorization("x".into()), FaultKind::Authorization),
            (OrchestrationError::InstanceNotFound(Uuid::now_v7()), FaultKind::WorkflowState),
            (
                OrchestrationError::NotRunnable {
                    instance_id: Uuid::now_v7(),
                    status: InstanceStatus::Suspended,
                },
                FaultKind::WorkflowState,
            ),
            (OrchestrationError::Timeout("x".into()), FaultKind::Timeout),
            (OrchestrationError::Cancelled, FaultKind::Cancelled),
            (
                OrchestrationError::Store(StoreError::Transient("deadlock".into())),
                FaultKind::Transient,
            ),
            (
                OrchestrationError::Store(StoreError::Duplicate("key".into())),
                FaultKind::Concurrency,
            ),
            (
                OrchestrationError::Store(StoreError::Database("syntax".into())),
                FaultKind::Unknown,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(classify(&error), expected, "{error}");
        }
    }

    #[test]
    fn test_classify_engine_errors() {
        assert_eq!(
            classify(&OrchestrationError::Engine(EngineError::ExternalService("502".into()))),
            FaultKind::ExternalService
        );
        assert_eq!(
            classify_engine(&EngineError::Store(StoreError::Transient("io".into()))),
            FaultKind::Transient
        );
        assert_eq!(classify_engine(&EngineError::Failed("rejected".into())), FaultKind::Unknown);
    }

    #[test]
    fn test_retryable_and_permanent_are_disjoint() {
        for kind in FaultKind::ALL {
            assert!(!(kind.is_retryable() && kind.is_permanent()), "{kind}");
        }
        assert!(!FaultKind::Unknown.is_retryable());
        assert!(!FaultKind::ExternalService.is_retryable());
    }
}
