//! Persisted records of the orchestration core
//!
//! Every record is keyed by its workflow instance id:
//! - [`WorkflowInstance`] and [`WorkflowActivityExecution`] track progress
//! - [`WorkflowBookmark`] marks a suspension point
//! - [`WorkflowExternalCall`] tracks an outbound side effect
//! - [`OutboxMessage`] queues an event for the background dispatcher
//! - [`ExecutionLogEntry`] is the append-only diagnostic trail

/// Error returned when a persisted status string is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Closed enums stored as snake_case text.
///
/// Generates `as_str`, `Display`, `FromStr` and `ALL` for a fieldless enum.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Persisted text form
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::model::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::model::ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub(crate) use text_enum;

mod bookmark;
mod external_call;
mod instance;
mod log;
mod outbox;

pub use bookmark::{BookmarkType, WorkflowBookmark};
pub use external_call::{ExternalCallStatus, ExternalCallType, WorkflowExternalCall};
pub use instance::{
    ActivityExecutionStatus, InstanceStatus, WorkflowActivityExecution, WorkflowDefinitionRecord,
    WorkflowInstance,
};
pub use log::{ExecutionLogEntry, LogEventKind};
pub use outbox::{OutboxEventType, OutboxMessage, OutboxStatus};

/// The instant `age` before now, saturating at the earliest representable time
pub(crate) fn before_now(age: std::time::Duration) -> chrono::DateTime<chrono::Utc> {
    let now = chrono::Utc::now();
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}
