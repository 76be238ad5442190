//! Checkpointed task execution engine.
//!
//! - [`step`]: step functions and their errors
//! - [`flow`]: flow validation and next-step resolution
//! - [`handler`]: task handlers, one per task type
//! - [`registry`]: task-type routing
//! - [`subtask`]: per-target subtask processors
//! - [`cleanup`]: cleanup with a bounded retry ceiling
//! - [`subtask_handler`]: the `processing` / `cleanup` handler variant
//!
//! The engine holds no locks and keeps no state between deliveries;
//! everything it needs is read from the task and returned in the
//! completion signal.

pub mod cleanup;
pub mod flow;
pub mod handler;
pub mod registry;
pub mod step;
pub mod subtask;
pub mod subtask_handler;
