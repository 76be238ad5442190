//! Engine configuration types.
//!
//! `EngineConfig` mirrors the `waypoint.toml` file. Every field has a
//! default, so an empty file is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

/// Retry policy for the cleanup phase, applied per task handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Deliveries of the cleanup checkpoint that may still retry a failure.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Delay before retrying when the cleanup function gives none.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    300
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl CleanupConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Settings for the group archive step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Source files streamed into the archive at once.
    #[serde(default = "default_max_parallel_files")]
    pub max_parallel_files: usize,
    /// Append a `manifest.json` entry after the files.
    #[serde(default = "default_include_manifest")]
    pub include_manifest: bool,
    /// Fixed retry delay when the output stream cannot be opened.
    #[serde(default = "default_unavailable_retry_secs")]
    pub unavailable_retry_secs: u64,
}

fn default_max_parallel_files() -> usize {
    3
}

fn default_include_manifest() -> bool {
    true
}

fn default_unavailable_retry_secs() -> u64 {
    60
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_parallel_files: default_max_parallel_files(),
            include_manifest: default_include_manifest(),
            unavailable_retry_secs: default_unavailable_retry_secs(),
        }
    }
}

impl ArchiveConfig {
    /// Parallelism with a floor of one.
    pub fn parallelism(&self) -> usize {
        self.max_parallel_files.max(1)
    }

    pub fn unavailable_retry_delay(&self) -> Duration {
        Duration::from_secs(self.unavailable_retry_secs)
    }
}
