//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{ReconciliationError, ReconciliationResult};

/// What happens to an open conflict group once its identifier no longer
/// shows any disagreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictClosePolicy {
    /// Resolve the group automatically during the run.
    #[default]
    AutoClose,
    /// Leave the group open until an operator resolves it.
    Manual,
}

impl ConflictClosePolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictClosePolicy::AutoClose => "auto_close",
            ConflictClosePolicy::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ConflictClosePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConflictClosePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto_close" | "auto" => Ok(ConflictClosePolicy::AutoClose),
            "manual" => Ok(ConflictClosePolicy::Manual),
            _ => Err(format!("Unknown conflict close policy: {s}")),
        }
    }
}

/// Configuration for the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Identifiers per chunk.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Rows per store round-trip.
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,
    /// Chunks in flight at once.
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// Retries per store call for retryable failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Base delay between retries, doubled per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub conflict_close_policy: ConflictClosePolicy,
}

fn default_batch_size() -> usize {
    500
}

fn default_write_batch_size() -> usize {
    250
}

fn default_max_concurrent_chunks() -> usize {
    4
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            write_batch_size: default_write_batch_size(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            conflict_close_policy: ConflictClosePolicy::default(),
        }
    }
}

impl ReconciliationConfig {
    /// Reject configurations the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ReconciliationError::Configuration` naming the first bad field.
    pub fn validate(&self) -> ReconciliationResult<()> {
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("write_batch_size", self.write_batch_size),
            ("max_concurrent_chunks", self.max_concurrent_chunks),
        ] {
            if value == 0 {
                return Err(ReconciliationError::configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}
