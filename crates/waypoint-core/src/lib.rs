//! Task engine and port trait definitions for Waypoint.
//!
//! This crate defines the engine plus the "ports" (repository, blob and
//! archive traits) that the infrastructure layer implements. It depends
//! only on `waypoint-types` -- never on `waypoint-infra` or any
//! database/IO crate.

pub mod archive;
pub mod engine;
pub mod pool;
pub mod repository;
pub mod storage;
