//! Shared domain types for Waypoint.
//!
//! Tasks, completion signals, subtask and cleanup bookkeeping, file-group
//! records, configuration, and the storage error types shared by the core
//! and infrastructure crates.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod cleanup;
pub mod completion;
pub mod config;
pub mod error;
pub mod group;
pub mod metadata;
pub mod subtask;
pub mod task;
