//! In-memory document store adapters.

pub mod group_repo;
