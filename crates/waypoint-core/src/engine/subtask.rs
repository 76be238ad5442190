//! Subtask processing: fan one `processing` checkpoint out over named subtasks.
//!
//! A [`SubtaskProcessor`] is configured per target. It owns a flow of
//! subtask steps, the universe of subtask names that must be satisfied, and
//! an optional cleanup override. Each delivery runs at most one subtask step
//! and folds its [`SubtaskOutcome`] into the accumulator carried in task data.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use waypoint_types::completion::Completion;
use waypoint_types::metadata::merge_map;
use waypoint_types::subtask::{SubtaskOutcome, SubtaskState};
use waypoint_types::task::{NameSet, Task};

use super::cleanup::BoxCleanup;
use super::flow::{Flow, FlowEntry, FlowError};
use super::step::StepError;

// ---------------------------------------------------------------------------
// SubtaskStep
// ---------------------------------------------------------------------------

/// What a subtask step is given.
#[derive(Debug, Clone)]
pub struct SubtaskInput {
    pub task: Task,
    pub target: String,
    pub completed_subtasks: NameSet,
    pub subtask_metadata: Map<String, Value>,
}

/// A step run for one subtask of a target.
pub trait SubtaskStep: Send + Sync {
    fn run(
        &self,
        input: &SubtaskInput,
    ) -> impl Future<Output = Result<SubtaskOutcome, StepError>> + Send;
}

/// Object-safe version of [`SubtaskStep`].
pub trait SubtaskStepDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        input: &'a SubtaskInput,
    ) -> BoxFuture<'a, Result<SubtaskOutcome, StepError>>;
}

impl<T: SubtaskStep> SubtaskStepDyn for T {
    fn run_boxed<'a>(
        &'a self,
        input: &'a SubtaskInput,
    ) -> BoxFuture<'a, Result<SubtaskOutcome, StepError>> {
        Box::pin(self.run(input))
    }
}

#[derive(Clone)]
pub struct BoxSubtaskStep {
    inner: Arc<dyn SubtaskStepDyn>,
}

impl BoxSubtaskStep {
    pub fn new<T: SubtaskStep + 'static>(step: T) -> Self {
        Self {
            inner: Arc::new(step),
        }
    }

    pub async fn run(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, StepError> {
        self.inner.run_boxed(input).await
    }
}

impl std::fmt::Debug for BoxSubtaskStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxSubtaskStep").finish_non_exhaustive()
    }
}

pub struct FnSubtaskStep<F>(F);

impl<F, Fut> SubtaskStep for FnSubtaskStep<F>
where
    F: Fn(SubtaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SubtaskOutcome, StepError>> + Send + 'static,
{
    async fn run(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, StepError> {
        (self.0)(input.clone()).await
    }
}

/// Build a [`BoxSubtaskStep`] from a closure.
pub fn subtask_fn<F, Fut>(f: F) -> BoxSubtaskStep
where
    F: Fn(SubtaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SubtaskOutcome, StepError>> + Send + 'static,
{
    BoxSubtaskStep::new(FnSubtaskStep(f))
}

// ---------------------------------------------------------------------------
// SubtaskProcessor
// ---------------------------------------------------------------------------

/// Result of running one subtask step.
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    /// Accumulator after the outcome was applied.
    pub state: SubtaskState,
    /// Subtask that ran, `None` for the entry step.
    pub subtask: Option<String>,
    pub all_done: bool,
    pub delay_until: Option<DateTime<Utc>>,
    /// Effective chaining flag: the outcome's override, else the processor default.
    pub can_run_next_checkpoint: bool,
}

/// Per-target subtask configuration. Immutable after [`SubtaskProcessorBuilder::build`].
pub struct SubtaskProcessor {
    target: String,
    flow: Flow<BoxSubtaskStep>,
    universe: NameSet,
    allow_run_multiple_parts: bool,
    cleanup: Option<BoxCleanup>,
}

impl SubtaskProcessor {
    pub fn builder(target: impl Into<String>) -> SubtaskProcessorBuilder {
        SubtaskProcessorBuilder {
            target: target.into(),
            entries: Vec::new(),
            declared: Vec::new(),
            allow_run_multiple_parts: false,
            cleanup: None,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Every subtask name that must be satisfied before cleanup.
    pub fn universe(&self) -> &NameSet {
        &self.universe
    }

    pub fn allow_run_multiple_parts(&self) -> bool {
        self.allow_run_multiple_parts
    }

    pub fn cleanup(&self) -> Option<&BoxCleanup> {
        self.cleanup.as_ref()
    }

    pub fn all_done(&self, completed: &NameSet) -> bool {
        completed.is_superset_of(&self.universe)
    }

    /// Universe names not yet in `completed`, in declaration order.
    pub fn pending(&self, completed: &NameSet) -> Vec<String> {
        self.universe
            .iter()
            .filter(|name| !completed.contains(name))
            .map(str::to_string)
            .collect()
    }

    /// Fold an outcome into the completed set.
    ///
    /// The drop list is applied first. Names outside the universe are
    /// ignored.
    pub fn merge_completion(
        &self,
        completed: &NameSet,
        ran: Option<&str>,
        outcome: &SubtaskOutcome,
    ) -> NameSet {
        let mut next = completed.clone();

        for name in &outcome.drop_subtasks {
            if self.is_known(name) {
                next.remove(name);
            }
        }

        match &outcome.completion {
            Completion::Done => {
                for name in self.universe.iter() {
                    next.insert(name);
                }
            }
            Completion::NotYetSatisfied => {
                if let Some(name) = ran {
                    next.remove(name);
                }
            }
            Completion::PartialProgress(names) => {
                for name in names {
                    if self.is_known(name) {
                        next.insert(name);
                    }
                }
            }
            Completion::DelayedNoChange => {}
        }

        next
    }

    fn is_known(&self, name: &str) -> bool {
        if self.universe.contains(name) {
            return true;
        }
        tracing::warn!(
            target_name = self.target.as_str(),
            subtask = name,
            "ignoring unknown subtask name"
        );
        false
    }

    /// Run the next pending subtask step, if any.
    ///
    /// Returns `Ok(None)` when every step is already satisfied.
    pub async fn advance(
        &self,
        task: &Task,
        state: &SubtaskState,
    ) -> Result<Option<Advance>, StepError> {
        let Some(resolved) = self.flow.resolve(&state.completed_subtasks) else {
            return Ok(None);
        };

        tracing::debug!(
            task_id = %task.id,
            target_name = self.target.as_str(),
            subtask = resolved.checkpoint.unwrap_or("<entry>"),
            "running subtask step"
        );

        let input = SubtaskInput {
            task: task.clone(),
            target: self.target.clone(),
            completed_subtasks: state.completed_subtasks.clone(),
            subtask_metadata: state.subtask_metadata.clone(),
        };
        let outcome = resolved.step.run(&input).await?;

        let completed =
            self.merge_completion(&state.completed_subtasks, resolved.checkpoint, &outcome);
        let all_done = self.all_done(&completed);

        let mut subtask_metadata = state.subtask_metadata.clone();
        if let Some(delta) = outcome.metadata {
            merge_map(&mut subtask_metadata, delta);
        }

        Ok(Some(Advance {
            state: SubtaskState {
                target: Some(self.target.clone()),
                completed_subtasks: completed,
                subtask_metadata,
            },
            subtask: resolved.checkpoint.map(str::to_string),
            all_done,
            delay_until: outcome.delay_until,
            can_run_next_checkpoint: outcome
                .can_run_next_checkpoint
                .unwrap_or(self.allow_run_multiple_parts),
        }))
    }
}

impl std::fmt::Debug for SubtaskProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubtaskProcessor")
            .field("target", &self.target)
            .field("universe", &self.universe)
            .field("allow_run_multiple_parts", &self.allow_run_multiple_parts)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

pub struct SubtaskProcessorBuilder {
    target: String,
    entries: Vec<FlowEntry<BoxSubtaskStep>>,
    declared: Vec<String>,
    allow_run_multiple_parts: bool,
    cleanup: Option<BoxCleanup>,
}

impl SubtaskProcessorBuilder {
    /// Entry step, run while no subtask is complete.
    pub fn entry(mut self, step: BoxSubtaskStep) -> Self {
        self.entries.push(FlowEntry::entry(step));
        self
    }

    /// A named subtask with its own step.
    pub fn subtask(mut self, name: impl Into<String>, step: BoxSubtaskStep) -> Self {
        self.entries.push(FlowEntry::checkpoint(name, step));
        self
    }

    /// A subtask with no dedicated step, satisfied by some other step's outcome.
    pub fn declare_subtask(mut self, name: impl Into<String>) -> Self {
        self.declared.push(name.into());
        self
    }

    pub fn allow_run_multiple_parts(mut self, allowed: bool) -> Self {
        self.allow_run_multiple_parts = allowed;
        self
    }

    pub fn cleanup(mut self, cleanup: BoxCleanup) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn build(self) -> Result<SubtaskProcessor, FlowError> {
        if self.target.trim().is_empty() {
            return Err(FlowError::MissingTarget);
        }

        let flow = Flow::new(&self.target, self.entries)?;

        let mut universe: NameSet = flow.checkpoint_names().collect();
        for name in self.declared {
            universe.insert(name);
        }
        if universe.is_empty() {
            return Err(FlowError::EmptySubtaskUniverse {
                target: self.target,
            });
        }

        Ok(SubtaskProcessor {
            target: self.target,
            flow,
            universe,
            allow_run_multiple_parts: self.allow_run_multiple_parts,
            cleanup: self.cleanup,
        })
    }
}
