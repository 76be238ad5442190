//! Task handler variant that runs per-target subtask processors followed by
//! cleanup.
//!
//! The outer flow is fixed: `processing` drives the subtask processor
//! selected by the task's target, `cleanup` drives the cleanup coordinator.
//! Both are ordinary checkpoints, so redelivery after either one resumes in
//! the right place.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use waypoint_types::completion::CompletionSignal;
use waypoint_types::subtask::{CLEANUP_CHECKPOINT, PROCESSING_CHECKPOINT, SubtaskState};
use waypoint_types::task::Task;

use super::cleanup::{BoxCleanup, BoxFinalizer, CleanupCoordinator, CleanupPolicy};
use super::flow::{FlowEntry, FlowError};
use super::handler::{FlowTaskHandler, TaskHandler};
use super::step::{BoxStep, Step, StepError};
use super::subtask::{Advance, SubtaskProcessor};

/// Hook transforming the task-level metadata update before it is returned.
pub type MetadataBuilder = Arc<dyn Fn(&Task, Value) -> Value + Send + Sync>;

/// Registration data for a [`SubtaskTaskHandler`].
pub struct SubtaskHandlerConfig {
    task_type: String,
    processors: Vec<SubtaskProcessor>,
    policy: CleanupPolicy,
    default_cleanup: Option<BoxCleanup>,
    finalizer: Option<BoxFinalizer>,
    metadata_builder: Option<MetadataBuilder>,
}

impl SubtaskHandlerConfig {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            processors: Vec::new(),
            policy: CleanupPolicy::default(),
            default_cleanup: None,
            finalizer: None,
            metadata_builder: None,
        }
    }

    pub fn processor(mut self, processor: SubtaskProcessor) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn default_cleanup(mut self, cleanup: BoxCleanup) -> Self {
        self.default_cleanup = Some(cleanup);
        self
    }

    pub fn finalizer(mut self, finalizer: BoxFinalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn metadata_builder<F>(mut self, builder: F) -> Self
    where
        F: Fn(&Task, Value) -> Value + Send + Sync + 'static,
    {
        self.metadata_builder = Some(Arc::new(builder));
        self
    }
}

struct Shared {
    targets: HashMap<String, SubtaskProcessor>,
    coordinator: CleanupCoordinator,
    metadata_builder: Option<MetadataBuilder>,
}

impl Shared {
    fn processor_for(&self, state: &SubtaskState) -> Option<&SubtaskProcessor> {
        state.target.as_deref().and_then(|t| self.targets.get(t))
    }

    fn signal_for(&self, task: &Task, advance: Advance) -> CompletionSignal {
        let mut update = advance.state.to_update();
        if let Some(builder) = &self.metadata_builder {
            update = builder(task, update);
        }

        let signal = if advance.all_done {
            CompletionSignal::mark([PROCESSING_CHECKPOINT])
        } else {
            CompletionSignal::delayed()
        };
        let signal = signal.with_metadata(update);

        // A delayed signal must wait for its redelivery.
        match advance.delay_until {
            Some(at) => signal.with_can_run_next(false).with_delay_until(at),
            None => signal.with_can_run_next(advance.can_run_next_checkpoint),
        }
    }
}

struct ProcessingStep(Arc<Shared>);

impl Step for ProcessingStep {
    async fn run(&self, task: &Task) -> Result<CompletionSignal, StepError> {
        let state = SubtaskState::from_task_data(&task.data)?;

        let Some(processor) = self.0.processor_for(&state) else {
            tracing::debug!(
                task_id = %task.id,
                target = state.target.as_deref().unwrap_or("<none>"),
                "no subtask processor for target, running default cleanup"
            );
            return self.0.coordinator.run_cleanup(task, &state, None).await;
        };

        match processor.advance(task, &state).await? {
            Some(advance) => Ok(self.0.signal_for(task, advance)),
            None => {
                let pending = processor.pending(&state.completed_subtasks);
                if !pending.is_empty() {
                    tracing::warn!(
                        task_id = %task.id,
                        target = processor.target(),
                        pending = ?pending,
                        "no step left to satisfy pending subtasks, processing stays open"
                    );
                    let retry_at = self.0.coordinator.policy().default_retry().resolve(Utc::now());
                    return Ok(CompletionSignal::delayed()
                        .with_can_run_next(false)
                        .with_delay_until(retry_at));
                }
                tracing::debug!(
                    task_id = %task.id,
                    target = processor.target(),
                    "all subtasks already satisfied, running cleanup"
                );
                self.0
                    .coordinator
                    .run_cleanup(task, &state, processor.cleanup())
                    .await
            }
        }
    }
}

struct CleanupStep(Arc<Shared>);

impl Step for CleanupStep {
    async fn run(&self, task: &Task) -> Result<CompletionSignal, StepError> {
        let state = SubtaskState::from_task_data(&task.data)?;
        let override_cleanup = self.0.processor_for(&state).and_then(|p| p.cleanup());
        self.0
            .coordinator
            .run_cleanup(task, &state, override_cleanup)
            .await
    }
}

/// Task handler whose `processing` checkpoint fans out into subtasks.
pub struct SubtaskTaskHandler {
    inner: FlowTaskHandler,
    shared: Arc<Shared>,
}

impl SubtaskTaskHandler {
    /// Validate the configuration and build the handler.
    ///
    /// Fails on duplicate targets or an invalid processor flow; nothing is
    /// checked again at run time.
    pub fn new(config: SubtaskHandlerConfig) -> Result<Self, FlowError> {
        let mut targets = HashMap::with_capacity(config.processors.len());
        for processor in config.processors {
            let target = processor.target().to_string();
            if targets.contains_key(&target) {
                return Err(FlowError::DuplicateTarget(target));
            }
            targets.insert(target, processor);
        }

        let mut coordinator = CleanupCoordinator::new(config.policy);
        if let Some(cleanup) = config.default_cleanup {
            coordinator = coordinator.with_default_cleanup(cleanup);
        }
        if let Some(finalizer) = config.finalizer {
            coordinator = coordinator.with_finalizer(finalizer);
        }

        let shared = Arc::new(Shared {
            targets,
            coordinator,
            metadata_builder: config.metadata_builder,
        });

        let inner = FlowTaskHandler::new(
            config.task_type,
            vec![
                FlowEntry::checkpoint(
                    PROCESSING_CHECKPOINT,
                    BoxStep::new(ProcessingStep(Arc::clone(&shared))),
                ),
                FlowEntry::checkpoint(
                    CLEANUP_CHECKPOINT,
                    BoxStep::new(CleanupStep(Arc::clone(&shared))),
                ),
            ],
        )?;

        Ok(Self { inner, shared })
    }

    pub fn has_target(&self, target: &str) -> bool {
        self.shared.targets.contains_key(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.shared.targets.keys().map(String::as_str)
    }

    pub fn cleanup_policy(&self) -> &CleanupPolicy {
        self.shared.coordinator.policy()
    }
}

impl TaskHandler for SubtaskTaskHandler {
    fn task_type(&self) -> &str {
        TaskHandler::task_type(&self.inner)
    }

    async fn handle(&self, task: &Task) -> Result<CompletionSignal, StepError> {
        self.inner.handle(task).await
    }
}
