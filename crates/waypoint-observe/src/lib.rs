//! Observability setup for Waypoint binaries.

pub mod tracing_setup;
