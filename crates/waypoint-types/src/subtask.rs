//! Subtask bookkeeping stored inside a task's opaque metadata.
//!
//! The subtask variant of a task handler runs two outer checkpoints,
//! [`PROCESSING_CHECKPOINT`] and [`CLEANUP_CHECKPOINT`]. While processing is
//! pending, progress is accumulated in `Task.data` under the keys read by
//! [`SubtaskState`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::completion::Completion;
use crate::task::NameSet;

/// Outer checkpoint marked once every subtask is satisfied.
pub const PROCESSING_CHECKPOINT: &str = "processing";

/// Outer checkpoint gating the cleanup phase.
pub const CLEANUP_CHECKPOINT: &str = "cleanup";

// ---------------------------------------------------------------------------
// SubtaskState
// ---------------------------------------------------------------------------

/// Accessor for the subtask accumulator embedded in `Task.data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtaskState {
    /// Selects the subtask processor configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub completed_subtasks: NameSet,
    #[serde(default)]
    pub subtask_metadata: Map<String, Value>,
}

impl SubtaskState {
    /// Read the accumulator out of task data.
    ///
    /// Unknown keys are ignored; anything that is not a JSON object reads
    /// as an empty accumulator.
    pub fn from_task_data(data: &Value) -> Result<Self, serde_json::Error> {
        if !data.is_object() {
            return Ok(Self::default());
        }
        serde_json::from_value(data.clone())
    }

    /// The metadata fragment a step returns to persist this state.
    pub fn to_update(&self) -> Value {
        let mut update = Map::new();
        if let Some(target) = &self.target {
            update.insert("target".to_string(), Value::String(target.clone()));
        }
        update.insert(
            "completed_subtasks".to_string(),
            Value::from(self.completed_subtasks.to_vec()),
        );
        update.insert(
            "subtask_metadata".to_string(),
            Value::Object(self.subtask_metadata.clone()),
        );
        Value::Object(update)
    }
}

// ---------------------------------------------------------------------------
// SubtaskOutcome
// ---------------------------------------------------------------------------

/// What a subtask step reports back to the subtask processor.
///
/// `completion` is interpreted against subtask names, not checkpoints:
/// `Done` satisfies every subtask, `PartialProgress` marks the listed ones,
/// `NotYetSatisfied` un-marks the subtask that just ran.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskOutcome {
    pub completion: Completion,
    /// Subtasks to un-mark before applying `completion`.
    pub drop_subtasks: Vec<String>,
    /// Shallow-merged into the accumulated subtask metadata.
    pub metadata: Option<Map<String, Value>>,
    pub delay_until: Option<DateTime<Utc>>,
    /// Overrides the processor's `allow_run_multiple_parts` when set.
    pub can_run_next_checkpoint: Option<bool>,
}

impl SubtaskOutcome {
    pub fn new(completion: Completion) -> Self {
        Self {
            completion,
            drop_subtasks: Vec::new(),
            metadata: None,
            delay_until: None,
            can_run_next_checkpoint: None,
        }
    }

    pub fn done() -> Self {
        Self::new(Completion::Done)
    }

    pub fn not_yet_satisfied() -> Self {
        Self::new(Completion::NotYetSatisfied)
    }

    pub fn unchanged() -> Self {
        Self::new(Completion::DelayedNoChange)
    }

    pub fn completed<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Completion::PartialProgress(
            names.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn dropping<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.drop_subtasks.extend(names.into_iter().map(Into::into));
        self
    }

    /// Attach a metadata delta. Non-object values are ignored.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        if let Value::Object(map) = metadata {
            self.metadata = Some(map);
        }
        self
    }

    pub fn with_delay_until(mut self, at: DateTime<Utc>) -> Self {
        self.delay_until = Some(at);
        self
    }

    pub fn with_can_run_next(mut self, allowed: bool) -> Self {
        self.can_run_next_checkpoint = Some(allowed);
        self
    }
}
