//! Limits enforced before a schema is trusted
//!
//! Definitions arrive from storage as raw JSON. A crafted definition could
//! exhaust memory or stack through sheer size, deep nesting or huge activity
//! lists, so every limit is checked before the schema reaches an instance.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::WorkflowSchema;

/// Errors raised while deserializing or validating a schema
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("schema nesting depth exceeds {limit}")]
    TooDeep { limit: usize },

    #[error("schema has {count} activities, limit is {limit}")]
    TooManyActivities { count: usize, limit: usize },

    #[error("schema has {count} transitions, limit is {limit}")]
    TooManyTransitions { count: usize, limit: usize },

    #[error("schema has no activities")]
    Empty,

    #[error("invalid activity id: {0:?}")]
    InvalidActivityId(String),

    #[error("duplicate activity id: {0}")]
    DuplicateActivityId(String),

    #[error("transition references unknown activity: {0}")]
    UnknownActivity(String),

    #[error("malformed schema json: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid id pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Configured ceilings for schema input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaLimits {
    /// Maximum raw JSON size in bytes
    pub max_json_bytes: usize,

    /// Maximum object/array nesting depth
    pub max_depth: usize,

    /// Maximum number of activities
    pub max_activities: usize,

    /// Maximum number of transitions
    pub max_transitions: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            max_json_bytes: 1024 * 1024,
            max_depth: 64,
            max_activities: 500,
            max_transitions: 2000,
        }
    }
}

impl SchemaLimits {
    /// Set the maximum raw size
    pub fn with_max_json_bytes(mut self, bytes: usize) -> Self {
        self.max_json_bytes = bytes;
        self
    }

    /// Set the maximum nesting depth
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Set the maximum activity count
    pub fn with_max_activities(mut self, count: usize) -> Self {
        self.max_activities = count;
        self
    }

    /// Set the maximum transition count
    pub fn with_max_transitions(mut self, count: usize) -> Self {
        self.max_transitions = count;
        self
    }
}

const ACTIVITY_ID_PATTERN: &str = "^[a-zA-Z0-9_-]+$";

/// Deserialize raw schema JSON, enforcing every limit
///
/// Size and depth are checked on the raw bytes before `serde_json` sees
/// them; counts and ids are checked on the parsed result.
pub fn deserialize_schema(raw: &str, limits: &SchemaLimits) -> Result<WorkflowSchema, SchemaError> {
    if raw.len() > limits.max_json_bytes {
        return Err(SchemaError::TooLarge {
            size: raw.len(),
            limit: limits.max_json_bytes,
        });
    }

    if nesting_depth(raw.as_bytes()) > limits.max_depth {
        return Err(SchemaError::TooDeep {
            limit: limits.max_depth,
        });
    }

    let schema: WorkflowSchema = serde_json::from_str(raw)?;
    validate_schema(&schema, limits)?;
    Ok(schema)
}

/// Validate an already-parsed schema
pub fn validate_schema(schema: &WorkflowSchema, limits: &SchemaLimits) -> Result<(), SchemaError> {
    if schema.activities.is_empty() {
        return Err(SchemaError::Empty);
    }
    if schema.activities.len() > limits.max_activities {
        return Err(SchemaError::TooManyActivities {
            count: schema.activities.len(),
            limit: limits.max_activities,
        });
    }
    if schema.transitions.len() > limits.max_transitions {
        return Err(SchemaError::TooManyTransitions {
            count: schema.transitions.len(),
            limit: limits.max_transitions,
        });
    }

    let id_pattern = Regex::new(ACTIVITY_ID_PATTERN)?;
    let mut seen = HashSet::with_capacity(schema.activities.len());
    for activity in &schema.activities {
        if !id_pattern.is_match(&activity.id) {
            return Err(SchemaError::InvalidActivityId(activity.id.clone()));
        }
        if !seen.insert(activity.id.as_str()) {
            return Err(SchemaError::DuplicateActivityId(activity.id.clone()));
        }
    }

    for transition in &schema.transitions {
        for end in [&transition.from, &transition.to] {
            if !seen.contains(end.as_str()) {
                return Err(SchemaError::UnknownActivity(end.clone()));
            }
        }
    }

    if let Some(start) = &schema.start_activity_id {
        if !seen.contains(start.as_str()) {
            return Err(SchemaError::UnknownActivity(start.clone()));
        }
    }

    Ok(())
}

/// Maximum `{`/`[` nesting of a JSON document, ignoring string contents
fn nesting_depth(bytes: &[u8]) -> usize {
    let mut depth = 0usize;
    let mut max_depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for &b in bytes {
        if in_string {
            match (escaped, b) {
                (true, _) => escaped = false,
                (false, b'\\') => escaped = true,
                (false, b'"') => in_string = false,
                _ => {}
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    max_depth
}
