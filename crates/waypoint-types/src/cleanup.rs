//! Cleanup instructions produced by cleanup functions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// When a failed cleanup should be retried: an absolute time or a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAt {
    At(DateTime<Utc>),
    AfterMillis(u64),
}

impl RetryAt {
    /// Resolve to an absolute timestamp relative to `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            RetryAt::At(at) => *at,
            RetryAt::AfterMillis(ms) => {
                let delta = i64::try_from(*ms)
                    .ok()
                    .and_then(Duration::try_milliseconds)
                    .unwrap_or(Duration::MAX);
                now.checked_add_signed(delta)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
        }
    }
}

/// Verdict of a cleanup function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupInstructions {
    #[serde(default = "default_cleanup_success")]
    pub cleanup_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_retry_until: Option<RetryAt>,
}

fn default_cleanup_success() -> bool {
    true
}

impl Default for CleanupInstructions {
    fn default() -> Self {
        Self {
            cleanup_success: default_cleanup_success(),
            delay_retry_until: None,
        }
    }
}

impl CleanupInstructions {
    pub fn succeeded() -> Self {
        Self::default()
    }

    pub fn failed() -> Self {
        Self {
            cleanup_success: false,
            delay_retry_until: None,
        }
    }

    pub fn retry_at(mut self, at: RetryAt) -> Self {
        self.delay_retry_until = Some(at);
        self
    }
}

/// Summary handed to the terminal cleanup action and embedded in task metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub succeeded: bool,
    pub attempts: u32,
    /// True when cleanup kept failing and finalization ran anyway.
    pub exhausted_retries: bool,
}
