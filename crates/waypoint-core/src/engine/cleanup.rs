//! Cleanup coordination with a bounded retry ceiling.
//!
//! Runs once every subtask of a task is satisfied. The cleanup function is
//! chosen in this order:
//! 1. the target's override, which may call the handler default through
//!    [`CleanupContext::run_default`] and honor or replace its verdict
//! 2. the handler default, when there is no target or no override
//! 3. an implicit success, when no default is configured either
//!
//! A failed cleanup is retried while `current_checkpoint_attempts` is within
//! the configured ceiling. Past the ceiling the terminal action runs anyway
//! (fail open) so a task can never loop forever.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use waypoint_types::cleanup::{CleanupInstructions, CleanupReport, RetryAt};
use waypoint_types::completion::CompletionSignal;
use waypoint_types::config::CleanupConfig;
use waypoint_types::subtask::SubtaskState;
use waypoint_types::task::Task;

use super::step::StepError;

// ---------------------------------------------------------------------------
// Cleanup functions
// ---------------------------------------------------------------------------

/// Everything a cleanup function gets to see.
#[derive(Clone)]
pub struct CleanupContext {
    pub task: Task,
    pub target: Option<String>,
    /// Subtask metadata accumulated during processing.
    pub subtask_metadata: Map<String, Value>,
    default: Option<BoxCleanup>,
}

impl CleanupContext {
    /// Invoke the handler's default cleanup. Without one, cleanup succeeds.
    pub async fn run_default(&self) -> Result<CleanupInstructions, StepError> {
        match &self.default {
            Some(default) => {
                let ctx = CleanupContext {
                    default: None,
                    ..self.clone()
                };
                default.run(ctx).await
            }
            None => Ok(CleanupInstructions::default()),
        }
    }
}

/// A cleanup function (handler default or per-target override).
pub trait Cleanup: Send + Sync {
    fn run(&self, ctx: CleanupContext) -> BoxFuture<'_, Result<CleanupInstructions, StepError>>;
}

/// Shared handle to a cleanup function.
#[derive(Clone)]
pub struct BoxCleanup(Arc<dyn Cleanup>);

impl BoxCleanup {
    pub fn new<T: Cleanup + 'static>(cleanup: T) -> Self {
        Self(Arc::new(cleanup))
    }

    pub async fn run(&self, ctx: CleanupContext) -> Result<CleanupInstructions, StepError> {
        self.0.run(ctx).await
    }
}

struct FnCleanup<F>(F);

impl<F, Fut> Cleanup for FnCleanup<F>
where
    F: Fn(CleanupContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CleanupInstructions, StepError>> + Send + 'static,
{
    fn run(&self, ctx: CleanupContext) -> BoxFuture<'_, Result<CleanupInstructions, StepError>> {
        Box::pin((self.0)(ctx))
    }
}

/// Build a [`BoxCleanup`] from a closure.
pub fn cleanup_fn<F, Fut>(f: F) -> BoxCleanup
where
    F: Fn(CleanupContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CleanupInstructions, StepError>> + Send + 'static,
{
    BoxCleanup::new(FnCleanup(f))
}

// ---------------------------------------------------------------------------
// Terminal action
// ---------------------------------------------------------------------------

/// Terminal cleanup action, run exactly when the coordinator finalizes.
pub trait Finalizer: Send + Sync {
    fn finalize<'a>(
        &'a self,
        task: &'a Task,
        report: &'a CleanupReport,
    ) -> BoxFuture<'a, Result<(), StepError>>;
}

#[derive(Clone)]
pub struct BoxFinalizer(Arc<dyn Finalizer>);

impl BoxFinalizer {
    pub fn new<T: Finalizer + 'static>(finalizer: T) -> Self {
        Self(Arc::new(finalizer))
    }

    pub async fn finalize(&self, task: &Task, report: &CleanupReport) -> Result<(), StepError> {
        self.0.finalize(task, report).await
    }
}

struct FnFinalizer<F>(F);

impl<F, Fut> Finalizer for FnFinalizer<F>
where
    F: Fn(Task, CleanupReport) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    fn finalize<'a>(
        &'a self,
        task: &'a Task,
        report: &'a CleanupReport,
    ) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin((self.0)(task.clone(), report.clone()))
    }
}

/// Build a [`BoxFinalizer`] from a closure.
pub fn finalizer_fn<F, Fut>(f: F) -> BoxFinalizer
where
    F: Fn(Task, CleanupReport) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    BoxFinalizer::new(FnFinalizer(f))
}

// ---------------------------------------------------------------------------
// Policy / decision
// ---------------------------------------------------------------------------

/// Retry ceiling and default delay, fixed per task handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
}

impl From<&CleanupConfig> for CleanupPolicy {
    fn from(config: &CleanupConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retry_attempts,
            retry_delay: config.retry_delay(),
        }
    }
}

impl CleanupPolicy {
    /// Retry time used when a verdict carries none.
    pub fn default_retry(&self) -> RetryAt {
        RetryAt::AfterMillis(u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX))
    }
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::from(&CleanupConfig::default())
    }
}

/// What to do with a cleanup verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupDecision {
    /// Leave the checkpoint unmarked and come back at `at`.
    Retry { at: DateTime<Utc> },
    /// Run the terminal action and complete the task.
    Finalize { report: CleanupReport },
}

// ---------------------------------------------------------------------------
// CleanupCoordinator
// ---------------------------------------------------------------------------

pub struct CleanupCoordinator {
    policy: CleanupPolicy,
    default_cleanup: Option<BoxCleanup>,
    finalizer: Option<BoxFinalizer>,
}

impl CleanupCoordinator {
    pub fn new(policy: CleanupPolicy) -> Self {
        Self {
            policy,
            default_cleanup: None,
            finalizer: None,
        }
    }

    pub fn with_default_cleanup(mut self, cleanup: BoxCleanup) -> Self {
        self.default_cleanup = Some(cleanup);
        self
    }

    pub fn with_finalizer(mut self, finalizer: BoxFinalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn policy(&self) -> &CleanupPolicy {
        &self.policy
    }

    /// Decide between retry and finalization. Pure.
    ///
    /// Retries while `attempts <= max_retry_attempts`, so a ceiling of 2
    /// retries on attempts 1 and 2 and finalizes on attempt 3.
    pub fn decide(
        &self,
        attempts: u32,
        instructions: &CleanupInstructions,
        now: DateTime<Utc>,
    ) -> CleanupDecision {
        if instructions.cleanup_success {
            return CleanupDecision::Finalize {
                report: CleanupReport {
                    succeeded: true,
                    attempts,
                    exhausted_retries: false,
                },
            };
        }

        if attempts <= self.policy.max_retry_attempts {
            let retry = instructions
                .delay_retry_until
                .unwrap_or_else(|| self.policy.default_retry());
            return CleanupDecision::Retry {
                at: retry.resolve(now),
            };
        }

        CleanupDecision::Finalize {
            report: CleanupReport {
                succeeded: false,
                attempts,
                exhausted_retries: true,
            },
        }
    }

    /// Run cleanup for a task whose subtasks are all satisfied.
    ///
    /// `target_cleanup` is the target's override, if the target is known
    /// and has one.
    pub async fn run_cleanup(
        &self,
        task: &Task,
        state: &SubtaskState,
        target_cleanup: Option<&BoxCleanup>,
    ) -> Result<CompletionSignal, StepError> {
        let ctx = CleanupContext {
            task: task.clone(),
            target: state.target.clone(),
            subtask_metadata: state.subtask_metadata.clone(),
            default: self.default_cleanup.clone(),
        };

        let instructions = match target_cleanup {
            Some(cleanup) => cleanup.run(ctx).await?,
            None => ctx.run_default().await?,
        };

        let attempts = task.current_checkpoint_attempts;
        match self.decide(attempts, &instructions, Utc::now()) {
            CleanupDecision::Retry { at } => {
                tracing::warn!(
                    task_id = %task.id,
                    target = state.target.as_deref().unwrap_or("<none>"),
                    attempt = attempts,
                    max_attempts = self.policy.max_retry_attempts,
                    retry_at = %at,
                    "cleanup failed, scheduling retry"
                );
                Ok(CompletionSignal::not_yet_satisfied().with_delay_until(at))
            }
            CleanupDecision::Finalize { report } => {
                if report.exhausted_retries {
                    tracing::warn!(
                        task_id = %task.id,
                        target = state.target.as_deref().unwrap_or("<none>"),
                        attempt = attempts,
                        "cleanup retry ceiling reached, finalizing anyway"
                    );
                }

                if let Some(finalizer) = &self.finalizer {
                    finalizer.finalize(task, &report).await?;
                }

                tracing::info!(
                    task_id = %task.id,
                    succeeded = report.succeeded,
                    "cleanup finalized"
                );
                Ok(CompletionSignal::done().with_metadata(json!({ "cleanup": report })))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use waypoint_types::completion::Completion;

    fn state(target: Option<&str>) -> SubtaskState {
        SubtaskState {
            target: target.map(str::to_string),
            ..SubtaskState::default()
        }
    }

    fn policy(max: u32) -> CleanupPolicy {
        CleanupPolicy {
            max_retry_attempts: max,
            retry_delay: Duration::from_secs(30),
        }
    }

    fn failing() -> BoxCleanup {
        cleanup_fn(|_ctx| async { Ok(CleanupInstructions::failed()) })
    }

    #[test]
    fn decide_success_finalizes() {
        let coordinator = CleanupCoordinator::new(policy(2));
        let decision = coordinator.decide(1, &CleanupInstructions::succeeded(), Utc::now());
        assert_eq!(
            decision,
            CleanupDecision::Finalize {
                report: CleanupReport {
                    succeeded: true,
                    attempts: 1,
                    exhausted_retries: false
                }
            }
        );
    }

    #[test]
    fn decide_uses_policy_delay_by_default() {
        let coordinator = CleanupCoordinator::new(policy(2));
        let now = Utc::now();
        let decision = coordinator.decide(1, &CleanupInstructions::failed(), now);
        assert_eq!(
            decision,
            CleanupDecision::Retry {
                at: now + chrono::Duration::seconds(30)
            }
        );
    }

    #[test]
    fn decide_honors_instruction_delay() {
        let coordinator = CleanupCoordinator::new(policy(2));
        let now = Utc::now();
        let instructions = CleanupInstructions::failed().retry_at(RetryAt::AfterMillis(500));
        let decision = coordinator.decide(2, &instructions, now);
        assert_eq!(
            decision,
            CleanupDecision::Retry {
                at: now + chrono::Duration::milliseconds(500)
            }
        );
    }

    #[tokio::test]
    async fn retry_ceiling_two_retries_then_terminal() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finalized);
        let coordinator = CleanupCoordinator::new(policy(2))
            .with_default_cleanup(failing())
            .with_finalizer(finalizer_fn(move |_task, report| {
                let counter = Arc::clone(&counter);
                async move {
                    assert!(report.exhausted_retries);
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));

        let mut retries = 0;
        let mut terminal = 0;
        for attempt in 1..=3 {
            let task = Task::new("t", Value::Null).with_attempts(attempt);
            let signal = coordinator.run_cleanup(&task, &state(None), None).await.unwrap();
            match signal.completion {
                Completion::NotYetSatisfied => {
                    assert!(signal.delay_until.is_some());
                    retries += 1;
                }
                Completion::Done => terminal += 1,
                other => panic!("unexpected completion {other:?}"),
            }
        }

        assert_eq!(retries, 2);
        assert_eq!(terminal, 1);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn override_can_replace_default_verdict() {
        let default_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&default_calls);
        let coordinator = CleanupCoordinator::new(policy(5)).with_default_cleanup(cleanup_fn(
            move |_ctx| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CleanupInstructions::failed())
                }
            },
        ));

        // Override consults the default but declares success regardless.
        let override_cleanup = cleanup_fn(|ctx: CleanupContext| async move {
            let from_default = ctx.run_default().await?;
            assert!(!from_default.cleanup_success);
            assert_eq!(ctx.target.as_deref(), Some("archive"));
            Ok(CleanupInstructions::succeeded())
        });

        let task = Task::new("t", Value::Null).with_attempts(1);
        let signal = coordinator
            .run_cleanup(&task, &state(Some("archive")), Some(&override_cleanup))
            .await
            .unwrap();
        assert_eq!(signal.completion, Completion::Done);
        assert_eq!(default_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            signal.update_metadata.unwrap()["cleanup"]["succeeded"],
            Value::Bool(true)
        );
    }

    #[tokio::test]
    async fn no_default_means_success() {
        let coordinator = CleanupCoordinator::new(policy(1));
        let task = Task::new("t", Value::Null).with_attempts(1);
        let signal = coordinator.run_cleanup(&task, &state(None), None).await.unwrap();
        assert!(signal.completion.is_done());
    }

    #[tokio::test]
    async fn cleanup_errors_propagate() {
        let coordinator = CleanupCoordinator::new(policy(1)).with_default_cleanup(cleanup_fn(
            |_ctx| async { Err(StepError::ExecutionFailed("store down".into())) },
        ));
        let task = Task::new("t", Value::Null).with_attempts(1);
        assert!(coordinator.run_cleanup(&task, &state(None), None).await.is_err());
    }
}
