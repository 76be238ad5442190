//! Completion signals returned by step functions.
//!
//! A `CompletionSignal` drives three things at the scheduler: which
//! checkpoints get marked, how task metadata is updated, and when the task
//! is delivered again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a single step invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "names", rename_all = "snake_case")]
pub enum Completion {
    /// The whole task is finished.
    Done,
    /// The current checkpoint is not satisfied; any partial marking from
    /// this delivery is rolled back.
    NotYetSatisfied,
    /// Mark the named checkpoints (or subtasks) complete.
    PartialProgress(Vec<String>),
    /// Mark nothing, keep state pending.
    DelayedNoChange,
}

impl Completion {
    pub fn is_done(&self) -> bool {
        matches!(self, Completion::Done)
    }
}

/// Structured result of a step: completion, metadata update and re-delivery timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub completion: Completion,
    /// Merged over the prior task data by the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_metadata: Option<Value>,
    /// Earliest time the scheduler should deliver the task again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
    /// When true the caller may chain straight into the next checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_run_next_checkpoint: Option<bool>,
}

impl CompletionSignal {
    pub fn new(completion: Completion) -> Self {
        Self {
            completion,
            update_metadata: None,
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

    pub fn delayed() -> Self {
        Self::new(Completion::DelayedNoChange)
    }

    /// Mark the given checkpoints complete.
    pub fn mark<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Completion::PartialProgress(
            names.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.update_metadata = Some(metadata);
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

    /// Whether chaining into the next checkpoint was requested.
    pub fn can_run_next(&self) -> bool {
        self.can_run_next_checkpoint.unwrap_or(false)
    }
}
