use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of work flowing between stages.
///
/// The core only reads `id` and `parent_id`; `payload` belongs to the stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Item {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            payload,
        }
    }

    /// Derive a child item whose lineage points back at `self`.
    pub fn child(&self, suffix: impl std::fmt::Display, payload: Value) -> Self {
        Self {
            id: format!("{}/{suffix}", self.id),
            parent_id: Some(self.id.clone()),
            payload,
        }
    }

    /// Convenience accessor for string payload fields.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
