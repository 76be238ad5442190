//! Handler registry: routes tasks to the handler for their type.

use std::collections::HashMap;

use waypoint_types::completion::CompletionSignal;
use waypoint_types::task::Task;

use super::flow::FlowError;
use super::handler::{BoxTaskHandler, TaskHandler};
use super::step::StepError;

/// Maps task types to handlers. Built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxTaskHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its task type. Duplicate types are rejected.
    pub fn register<T: TaskHandler + 'static>(&mut self, handler: T) -> Result<(), FlowError> {
        self.register_boxed(BoxTaskHandler::new(handler))
    }

    pub fn register_boxed(&mut self, handler: BoxTaskHandler) -> Result<(), FlowError> {
        let task_type = handler.task_type().to_string();
        if self.handlers.contains_key(&task_type) {
            return Err(FlowError::DuplicateTaskType(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn is_known_type(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn handler_for_type(&self, task_type: &str) -> Option<&BoxTaskHandler> {
        self.handlers.get(task_type)
    }

    /// Dispatch a task. Unknown types have nothing to do and complete at once.
    pub async fn handle(&self, task: &Task) -> Result<CompletionSignal, StepError> {
        match self.handler_for_type(&task.task_type) {
            Some(handler) => handler.handle(task).await,
            None => {
                tracing::debug!(
                    task_id = %task.id,
                    task_type = task.task_type.as_str(),
                    "no handler for task type, completing"
                );
                Ok(CompletionSignal::done())
            }
        }
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
