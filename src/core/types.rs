//! Core identifier types for the engine.
//!
//! These types provide type-safe identifiers for tasks, resources, runs,
//! remote workers and dispatched work orders.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Name of a task within a world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskName(String);

/// Name of a resource produced by exactly one task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

/// Unique identifier for a DagRun.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

/// Identifier assigned to a remote worker when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Uuid);

/// Identifier of a single dispatched attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(Uuid);

impl TaskName {
    /// Create a new TaskName from a string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl ResourceName {
    /// Create a new ResourceName from a string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ResourceName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl RunId {
    /// Generate a new random RunId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a RunId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse a RunId from its hyphenated string form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerId {
    /// Generate a new random WorkerId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a WorkerId from its hyphenated string form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderId {
    /// Generate a new random OrderId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_name_creation() {
        let name = TaskName::new("load_prices");
        assert_eq!(name.as_str(), "load_prices");
        assert_eq!(format!("{}", name), "load_prices");
    }

    #[test]
    fn test_resource_name_from_str() {
        let r1: ResourceName = "alpha".into();
        let r2 = ResourceName::new("alpha");
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_run_id_is_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn test_run_id_parse_round_trips_display() {
        let id = RunId::new();
        let parsed = RunId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
        assert!(RunId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_names_order_lexically() {
        let mut names = vec![TaskName::new("b"), TaskName::new("a"), TaskName::new("c")];
        names.sort();
        let names: Vec<_> = names.iter().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let name = TaskName::new("task_a");
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"task_a\"");

        let mut map = std::collections::BTreeMap::new();
        map.insert(ResourceName::new("alpha"), 1);
        assert_eq!(serde_json::to_string(&map).unwrap(), r#"{"alpha":1}"#);
    }
}
