//! Step functions: the unit of work a flow entry points at.
//!
//! Follows the same dynamic-dispatch pattern as the other pluggable seams:
//! 1. `Step` uses native async fn in traits (RPITIT)
//! 2. `StepDyn` is the object-safe mirror with boxed futures, blanket-implemented
//! 3. `BoxStep` wraps `Arc<dyn StepDyn>` so flows can hold heterogeneous steps

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use waypoint_types::completion::CompletionSignal;
use waypoint_types::error::{BlobError, RepositoryError};
use waypoint_types::task::Task;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors a step function can raise at task-processing time.
///
/// Everything except `MissingRequiredData` propagates to the scheduler,
/// which owns retry and backoff.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// A record the step depends on no longer exists. The task handler
    /// turns this into immediate completion without cleanup.
    #[error("required data missing: {0}")]
    MissingRequiredData(String),

    /// Task metadata could not be read into the expected shape.
    #[error("invalid task metadata: {0}")]
    InvalidMetadata(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("blob storage error: {0}")]
    Blob(#[from] BlobError),

    /// Any other failure inside a step.
    #[error("step execution failed: {0}")]
    ExecutionFailed(String),
}

impl StepError {
    /// Check if this error signals a vanished dependency.
    pub fn is_missing_required_data(&self) -> bool {
        matches!(self, StepError::MissingRequiredData(_))
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::InvalidMetadata(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A step function run for one checkpoint of a task.
pub trait Step: Send + Sync {
    fn run(
        &self,
        task: &Task,
    ) -> impl Future<Output = Result<CompletionSignal, StepError>> + Send;
}

/// Object-safe version of [`Step`] with boxed futures.
pub trait StepDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        task: &'a Task,
    ) -> BoxFuture<'a, Result<CompletionSignal, StepError>>;
}

/// Blanket implementation: any `Step` automatically implements `StepDyn`.
impl<T: Step> StepDyn for T {
    fn run_boxed<'a>(
        &'a self,
        task: &'a Task,
    ) -> BoxFuture<'a, Result<CompletionSignal, StepError>> {
        Box::pin(self.run(task))
    }
}

/// Type-erased, cheaply cloneable step.
#[derive(Clone)]
pub struct BoxStep {
    inner: Arc<dyn StepDyn>,
}

impl BoxStep {
    pub fn new<T: Step + 'static>(step: T) -> Self {
        Self {
            inner: Arc::new(step),
        }
    }

    pub async fn run(&self, task: &Task) -> Result<CompletionSignal, StepError> {
        self.inner.run_boxed(task).await
    }

    /// Whether two handles point at the same step instance.
    pub fn same_as(&self, other: &BoxStep) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for BoxStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStep").finish_non_exhaustive()
    }
}

/// Adapter turning a closure over an owned task into a [`Step`].
pub struct FnStep<F>(F);

impl<F, Fut> Step for FnStep<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CompletionSignal, StepError>> + Send + 'static,
{
    async fn run(&self, task: &Task) -> Result<CompletionSignal, StepError> {
        (self.0)(task.clone()).await
    }
}

/// Build a [`BoxStep`] from a closure.
pub fn step_fn<F, Fut>(f: F) -> BoxStep
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CompletionSignal, StepError>> + Send + 'static,
{
    BoxStep::new(FnStep(f))
}
