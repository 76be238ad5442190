//! Task handlers: one per task type, invoked once per scheduler delivery.
//!
//! The handler never retries. Step errors propagate to the scheduler
//! unchanged, with one exception: [`StepError::MissingRequiredData`] means
//! the work vanished, so the task is reported complete and cleanup is skipped.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use waypoint_types::completion::CompletionSignal;
use waypoint_types::task::Task;

use super::flow::{Flow, FlowEntry, FlowError};
use super::step::{BoxStep, StepError};

// ---------------------------------------------------------------------------
// TaskHandler trait
// ---------------------------------------------------------------------------

/// Handles every task of one type.
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &str;

    fn handle(
        &self,
        task: &Task,
    ) -> impl Future<Output = Result<CompletionSignal, StepError>> + Send;
}

/// Object-safe version of [`TaskHandler`].
pub trait TaskHandlerDyn: Send + Sync {
    fn task_type(&self) -> &str;

    fn handle_boxed<'a>(
        &'a self,
        task: &'a Task,
    ) -> BoxFuture<'a, Result<CompletionSignal, StepError>>;
}

impl<T: TaskHandler> TaskHandlerDyn for T {
    fn task_type(&self) -> &str {
        TaskHandler::task_type(self)
    }

    fn handle_boxed<'a>(
        &'a self,
        task: &'a Task,
    ) -> BoxFuture<'a, Result<CompletionSignal, StepError>> {
        Box::pin(self.handle(task))
    }
}

/// Type-erased task handler, stored in the [`HandlerRegistry`](super::registry::HandlerRegistry).
#[derive(Clone)]
pub struct BoxTaskHandler {
    inner: Arc<dyn TaskHandlerDyn>,
}

impl BoxTaskHandler {
    pub fn new<T: TaskHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub fn task_type(&self) -> &str {
        self.inner.task_type()
    }

    pub async fn handle(&self, task: &Task) -> Result<CompletionSignal, StepError> {
        self.inner.handle_boxed(task).await
    }
}

// ---------------------------------------------------------------------------
// FlowTaskHandler
// ---------------------------------------------------------------------------

/// Task handler driving a checkpointed linear flow.
pub struct FlowTaskHandler {
    task_type: String,
    flow: Flow<BoxStep>,
}

impl FlowTaskHandler {
    /// Build a handler, validating the flow up front.
    pub fn new(
        task_type: impl Into<String>,
        entries: Vec<FlowEntry<BoxStep>>,
    ) -> Result<Self, FlowError> {
        let task_type = task_type.into();
        let flow = Flow::new(&task_type, entries)?;
        Ok(Self { task_type, flow })
    }

    pub fn flow(&self) -> &Flow<BoxStep> {
        &self.flow
    }
}

impl TaskHandler for FlowTaskHandler {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn handle(&self, task: &Task) -> Result<CompletionSignal, StepError> {
        let Some(resolved) = self.flow.resolve(&task.completed_checkpoints) else {
            tracing::debug!(
                task_id = %task.id,
                task_type = self.task_type.as_str(),
                "no checkpoint left, task complete"
            );
            return Ok(CompletionSignal::done());
        };

        let checkpoint = resolved.checkpoint.unwrap_or("<entry>");
        tracing::debug!(
            task_id = %task.id,
            task_type = self.task_type.as_str(),
            checkpoint,
            attempt = task.current_checkpoint_attempts,
            "running step"
        );

        match resolved.step.run(task).await {
            Err(StepError::MissingRequiredData(reason)) => {
                tracing::info!(
                    task_id = %task.id,
                    task_type = self.task_type.as_str(),
                    checkpoint,
                    reason = reason.as_str(),
                    "required data missing, completing task without cleanup"
                );
                Ok(CompletionSignal::done())
            }
            other => other,
        }
    }
}
