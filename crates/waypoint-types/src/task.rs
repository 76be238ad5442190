//! Task records and the ordered name sets used for checkpoint bookkeeping.
//!
//! A `Task` is created outside the engine and redelivered by the scheduler
//! until its handler reports completion. The engine only ever reads
//! `completed_checkpoints`, `data` and `current_checkpoint_attempts`; the
//! scheduler owns every write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// NameSet
// ---------------------------------------------------------------------------

/// Insertion-ordered set of names without duplicates.
///
/// Serialized as a plain JSON array. Duplicates in persisted data are
/// dropped on load, keeping the first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct NameSet(Vec<String>);

impl NameSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert a name. Returns `false` if it was already present.
    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.0.push(name);
        true
    }

    /// Remove a name. Returns `true` if it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|n| n != name);
        self.0.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    /// True when every name in `other` is also in `self`.
    pub fn is_superset_of(&self, other: &NameSet) -> bool {
        other.iter().all(|name| self.contains(name))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }
}

impl From<Vec<String>> for NameSet {
    fn from(names: Vec<String>) -> Self {
        names.into_iter().collect()
    }
}

impl From<NameSet> for Vec<String> {
    fn from(set: NameSet) -> Self {
        set.0
    }
}

impl FromIterator<String> for NameSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set = NameSet::new();
        for name in iter {
            set.insert(name);
        }
        set
    }
}

impl<'a> FromIterator<&'a str> for NameSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        iter.into_iter().map(str::to_string).collect()
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of resumable background work tracked by checkpoint completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Selects the handler responsible for this task.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Checkpoints already satisfied, in the order they were marked.
    #[serde(default)]
    pub completed_checkpoints: NameSet,
    /// Opaque metadata owned by the handler.
    #[serde(default)]
    pub data: Value,
    /// Deliveries made for the checkpoint currently pending.
    ///
    /// The scheduler increments this before each delivery and resets it
    /// when a checkpoint is marked, so the first delivery sees `1`.
    #[serde(default)]
    pub current_checkpoint_attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a fresh task with no completed checkpoints.
    pub fn new(task_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_type: task_type.into(),
            completed_checkpoints: NameSet::new(),
            data,
            current_checkpoint_attempts: 0,
            created_at: Utc::now(),
        }
    }

    /// Builder helper: seed completed checkpoints.
    pub fn with_completed<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.completed_checkpoints.insert(name);
        }
        self
    }

    /// Builder helper: set the attempt counter.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.current_checkpoint_attempts = attempts;
        self
    }

    pub fn is_checkpoint_complete(&self, name: &str) -> bool {
        self.completed_checkpoints.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn name_set_keeps_insertion_order_and_rejects_duplicates() {
        let mut set = NameSet::new();
        assert!(set.insert("b"));
        assert!(set.insert("a"));
        assert!(!set.insert("b"));
        assert_eq!(set.to_vec(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn name_set_remove() {
        let mut set: NameSet = ["a", "b", "c"].into_iter().collect();
        assert!(set.remove("b"));
        assert!(!set.remove("b"));
        assert_eq!(set.to_vec(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn name_set_superset() {
        let all: NameSet = ["a", "b", "c"].into_iter().collect();
        let some: NameSet = ["c", "a"].into_iter().collect();
        assert!(all.is_superset_of(&some));
        assert!(!some.is_superset_of(&all));
        assert!(some.is_superset_of(&NameSet::new()));
    }

    #[test]
    fn name_set_deserialize_drops_duplicates() {
        let set: NameSet = serde_json::from_value(json!(["x", "y", "x"])).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(serde_json::to_value(&set).unwrap(), json!(["x", "y"]));
    }

    #[test]
    fn task_serializes_type_field() {
        let task = Task::new("archive", json!({"k": 1})).with_completed(["processing"]);
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "archive");
        assert_eq!(value["completed_checkpoints"], json!(["processing"]));
        assert!(task.is_checkpoint_complete("processing"));
        assert!(!task.is_checkpoint_complete("cleanup"));
    }

    #[test]
    fn task_deserialize_defaults() {
        let task: Task = serde_json::from_value(json!({
            "id": Uuid::nil(),
            "type": "x",
            "created_at": "2026-01-01T00:00:00Z",
        }))
        .unwrap();
        assert!(task.completed_checkpoints.is_empty());
        assert_eq!(task.current_checkpoint_attempts, 0);
        assert!(task.data.is_null());
    }
}
