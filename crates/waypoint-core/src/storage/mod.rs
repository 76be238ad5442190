//! Blob storage abstraction.
//!
//! Implementations live in waypoint-infra.

pub mod blob_store;
