//! Flow resolution: pick the next step of a checkpointed linear pipeline.
//!
//! A flow is an ordered list of `(checkpoint name, step)` entries with at
//! most one un-named entry step. Resolution is a pure function of the
//! completed-name set: entries already satisfied are skipped and the first
//! remaining one in declaration order wins. The same resolver drives task
//! checkpoints and subtasks, so it is generic over the step type.

use std::collections::HashSet;

use thiserror::Error;
use waypoint_types::task::NameSet;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Configuration errors, raised while handlers are constructed.
///
/// None of these can occur while a task is being processed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow for '{owner}' must have at least one entry")]
    EmptyFlow { owner: String },

    #[error("flow for '{owner}' has {count} entries without a checkpoint name (at most one allowed)")]
    MultipleEntrySteps { owner: String, count: usize },

    #[error("flow for '{owner}' declares checkpoint '{name}' more than once")]
    DuplicateCheckpoint { owner: String, name: String },

    #[error("subtask processor is missing a target")]
    MissingTarget,

    #[error("target '{0}' is configured more than once")]
    DuplicateTarget(String),

    #[error("target '{target}' has no declared subtasks")]
    EmptySubtaskUniverse { target: String },

    #[error("task type '{0}' is already registered")]
    DuplicateTaskType(String),
}

// ---------------------------------------------------------------------------
// FlowEntry / Flow
// ---------------------------------------------------------------------------

/// A `(checkpoint name, step)` pairing. `checkpoint: None` marks the entry step.
#[derive(Debug, Clone)]
pub struct FlowEntry<S> {
    pub checkpoint: Option<String>,
    pub step: S,
}

impl<S> FlowEntry<S> {
    /// Entry step, run only while no checkpoint is complete.
    pub fn entry(step: S) -> Self {
        Self {
            checkpoint: None,
            step,
        }
    }

    pub fn checkpoint(name: impl Into<String>, step: S) -> Self {
        Self {
            checkpoint: Some(name.into()),
            step,
        }
    }
}

/// The step picked by [`Flow::resolve`], with the checkpoint it belongs to.
#[derive(Debug)]
pub struct Resolved<'a, S> {
    /// `None` when the entry step was selected.
    pub checkpoint: Option<&'a str>,
    pub step: &'a S,
}

/// A validated flow. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Flow<S> {
    entry: Option<S>,
    checkpoints: Vec<(String, S)>,
}

impl<S> Flow<S> {
    /// Validate and build a flow.
    ///
    /// Rejects empty lists, more than one un-named entry, and duplicate
    /// checkpoint names. `owner` names the task type or target in errors.
    pub fn new(owner: &str, entries: Vec<FlowEntry<S>>) -> Result<Self, FlowError> {
        if entries.is_empty() {
            return Err(FlowError::EmptyFlow {
                owner: owner.to_string(),
            });
        }

        let unnamed = entries.iter().filter(|e| e.checkpoint.is_none()).count();
        if unnamed > 1 {
            return Err(FlowError::MultipleEntrySteps {
                owner: owner.to_string(),
                count: unnamed,
            });
        }

        let mut seen = HashSet::new();
        let mut entry = None;
        let mut checkpoints = Vec::with_capacity(entries.len());
        for FlowEntry { checkpoint, step } in entries {
            match checkpoint {
                None => entry = Some(step),
                Some(name) => {
                    if !seen.insert(name.clone()) {
                        return Err(FlowError::DuplicateCheckpoint {
                            owner: owner.to_string(),
                            name,
                        });
                    }
                    checkpoints.push((name, step));
                }
            }
        }

        Ok(Self { entry, checkpoints })
    }

    /// Select the next step to run, or `None` when nothing is left.
    ///
    /// With nothing completed the entry step wins if there is one, else the
    /// first checkpointed entry. Otherwise the first checkpointed entry not
    /// in `completed` is returned.
    pub fn resolve(&self, completed: &NameSet) -> Option<Resolved<'_, S>> {
        if completed.is_empty() {
            if let Some(step) = &self.entry {
                return Some(Resolved {
                    checkpoint: None,
                    step,
                });
            }
        }

        self.checkpoints
            .iter()
            .find(|(name, _)| !completed.contains(name))
            .map(|(name, step)| Resolved {
                checkpoint: Some(name.as_str()),
                step,
            })
    }

    /// Checkpoint names in declaration order.
    pub fn checkpoint_names(&self) -> impl Iterator<Item = &str> {
        self.checkpoints.iter().map(|(name, _)| name.as_str())
    }

    pub fn has_entry_step(&self) -> bool {
        self.entry.is_some()
    }
}
