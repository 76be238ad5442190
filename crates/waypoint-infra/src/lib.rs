//! Infrastructure layer for Waypoint.
//!
//! Contains implementations of the port traits defined in `waypoint-core`:
//! an in-memory document store, a local-filesystem blob store, the zip
//! archive writer, config loading, and a local scheduler that drives tasks
//! through the engine.

pub mod archive;
pub mod config;
pub mod memory;
pub mod scheduler;
pub mod storage;
