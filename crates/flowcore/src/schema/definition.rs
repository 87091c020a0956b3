//! Schema types

use serde::{Deserialize, Serialize};

/// One activity of a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityDefinition {
    /// Unique within the schema, `[a-zA-Z0-9_-]+`
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Opaque type tag interpreted by the activity engine
    #[serde(rename = "type")]
    pub activity_type: String,

    /// User or role the activity is assigned to, for human tasks
    #[serde(default)]
    pub assignee: Option<String>,

    /// Engine-specific settings
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl ActivityDefinition {
    /// Create an activity with an empty property bag
    pub fn new(id: impl Into<String>, activity_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            activity_type: activity_type.into(),
            assignee: None,
            properties: serde_json::Value::Null,
        }
    }

    /// Set the assignee
    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    /// Set engine properties
    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }
}

/// Directed edge between two activities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: String,
    pub to: String,

    /// Engine-evaluated guard; `None` means unconditional
    #[serde(default)]
    pub condition: Option<String>,
}

impl Transition {
    /// Unconditional transition
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }
}

/// A validated workflow schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSchema {
    pub name: String,

    #[serde(default)]
    pub start_activity_id: Option<String>,

    pub activities: Vec<ActivityDefinition>,

    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl WorkflowSchema {
    /// Create an empty schema
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_activity_id: None,
            activities: vec![],
            transitions: vec![],
        }
    }

    /// Append an activity
    pub fn with_activity(mut self, activity: ActivityDefinition) -> Self {
        self.activities.push(activity);
        self
    }

    /// Append an unconditional transition
    pub fn with_transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.transitions.push(Transition::new(from, to));
        self
    }

    /// Look up an activity by id
    pub fn activity(&self, id: &str) -> Option<&ActivityDefinition> {
        self.activities.iter().find(|a| a.id == id)
    }

    /// Activity the workflow begins with
    ///
    /// The explicit start id wins; otherwise the first activity without an
    /// incoming transition; otherwise the first activity.
    pub fn start_activity(&self) -> Option<&ActivityDefinition> {
        if let Some(start) = &self.start_activity_id {
            return self.activity(start);
        }

        self.activities
            .iter()
            .find(|a| !self.transitions.iter().any(|t| t.to == a.id))
            .or_else(|| self.activities.first())
    }

    /// Outgoing transitions of an activity, in declaration order
    pub fn outgoing<'a>(&'a self, from: &'a str) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions.iter().filter(move |t| t.from == from)
    }

    /// Target of the first unconditional outgoing transition
    pub fn default_next(&self, from: &str) -> Option<&str> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.condition.is_none())
            .map(|t| t.to.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> WorkflowSchema {
        WorkflowSchema::new("linear")
            .with_activity(ActivityDefinition::new("b", "Task"))
            .with_activity(ActivityDefinition::new("a", "Task"))
            .with_transition("a", "b")
    }

    #[test]
    fn test_start_activity_without_incoming_edge() {
        assert_eq!(linear().start_activity().unwrap().id, "a");
    }

    #[test]
    fn test_explicit_start_wins() {
        let mut schema = linear();
        schema.start_activity_id = Some("b".into());
        assert_eq!(schema.start_activity().unwrap().id, "b");
    }

    #[test]
    fn test_cycle_falls_back_to_first() {
        let schema = linear().with_transition("b", "a");
        assert_eq!(schema.start_activity().unwrap().id, "b");
        assert_eq!(schema.default_next("b"), Some("a"));
    }

    #[test]
    fn test_conditional_edges_are_skipped_by_default_next() {
        let mut schema = linear().with_transition("a", "c");
        schema.transitions[0].condition = Some("approved".into());

        let targets: Vec<&str> = schema.outgoing("a").map(|t| t.to.as_str()).collect();
        assert_eq!(targets, vec!["b", "c"]);
        assert_eq!(schema.default_next("a"), Some("c"));
        assert_eq!(schema.outgoing("missing").count(), 0);
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{
            "name": "approval",
            "activities": [
                {"id": "review", "type": "UserTask", "assignee": "alice"},
                {"id": "done", "type": "End"}
            ],
            "transitions": [{"from": "review", "to": "done"}]
        }"#;
        let schema: WorkflowSchema = serde_json::from_str(json).unwrap();
        assert_eq!(schema.activities[0].assignee.as_deref(), Some("alice"));
        assert_eq!(schema.default_next("review"), Some("done"));
    }
}
