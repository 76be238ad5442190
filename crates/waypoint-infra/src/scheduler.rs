//! Local scheduler: applies completion signals to in-process tasks.
//!
//! Does what a queue-backed scheduler does around the engine, minus the
//! queue: count attempts, merge metadata, mark checkpoints, decide when the
//! task is due again. Tasks live in the caller's hands between deliveries.

use chrono::{DateTime, Utc};
use waypoint_core::engine::registry::HandlerRegistry;
use waypoint_core::engine::step::StepError;
use waypoint_types::completion::{Completion, CompletionSignal};
use waypoint_types::metadata::merge_metadata;
use waypoint_types::task::Task;

/// Default number of checkpoints one delivery may chain through.
const DEFAULT_CHAIN_LIMIT: usize = 16;

/// Result of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Completed,
    /// Deliver again at `run_at`, or as soon as possible when `None`.
    Pending { run_at: Option<DateTime<Utc>> },
}

pub struct LocalScheduler {
    registry: HandlerRegistry,
    chain_limit: usize,
    sleep_until_due: bool,
}

impl LocalScheduler {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            chain_limit: DEFAULT_CHAIN_LIMIT,
            sleep_until_due: false,
        }
    }

    pub fn with_chain_limit(mut self, limit: usize) -> Self {
        self.chain_limit = limit.max(1);
        self
    }

    /// Make [`run_to_completion`](Self::run_to_completion) wait for `run_at`
    /// instead of redelivering immediately.
    pub fn sleep_until_due(mut self, sleep: bool) -> Self {
        self.sleep_until_due = sleep;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Deliver a task once, chaining through checkpoints while allowed.
    ///
    /// On error the task keeps any state applied by earlier links of the
    /// chain and its attempt counter stays incremented.
    pub async fn deliver(&self, task: &mut Task) -> Result<Delivery, StepError> {
        for _ in 0..self.chain_limit {
            task.current_checkpoint_attempts += 1;
            let signal = self.registry.handle(task).await?;
            tracing::debug!(
                task_id = %task.id,
                task_type = task.task_type.as_str(),
                completion = ?signal.completion,
                attempt = task.current_checkpoint_attempts,
                "delivery handled"
            );

            if apply(task, &signal) {
                return Ok(Delivery::Completed);
            }

            let chain = signal.can_run_next()
                && signal.delay_until.is_none()
                && signal.completion != Completion::NotYetSatisfied;
            if !chain {
                return Ok(Delivery::Pending {
                    run_at: signal.delay_until,
                });
            }
        }

        tracing::debug!(task_id = %task.id, limit = self.chain_limit, "chain limit reached");
        Ok(Delivery::Pending { run_at: None })
    }

    /// Redeliver until the task completes or `max_deliveries` is used up.
    pub async fn run_to_completion(
        &self,
        task: &mut Task,
        max_deliveries: usize,
    ) -> Result<Delivery, StepError> {
        let mut last = Delivery::Pending { run_at: None };
        for _ in 0..max_deliveries {
            last = self.deliver(task).await?;
            let run_at = match &last {
                Delivery::Completed => return Ok(Delivery::Completed),
                Delivery::Pending { run_at } => *run_at,
            };

            if self.sleep_until_due {
                if let Some(wait) = run_at.and_then(|at| (at - Utc::now()).to_std().ok()) {
                    tracing::info!(task_id = %task.id, wait_ms = wait.as_millis() as u64, "waiting for retry");
                    tokio::time::sleep(wait).await;
                }
            }
        }

        tracing::warn!(task_id = %task.id, max_deliveries, "task still pending after delivery limit");
        Ok(last)
    }
}

/// Apply a signal to the task. Returns true when the task is finished.
fn apply(task: &mut Task, signal: &CompletionSignal) -> bool {
    if let Some(delta) = &signal.update_metadata {
        let base = std::mem::take(&mut task.data);
        task.data = merge_metadata(base, delta.clone());
    }

    match &signal.completion {
        Completion::Done => true,
        Completion::PartialProgress(names) => {
            for name in names {
                task.completed_checkpoints.insert(name.as_str());
            }
            task.current_checkpoint_attempts = 0;
            false
        }
        Completion::NotYetSatisfied | Completion::DelayedNoChange => false,
    }
}
