//! Worker configuration loaded from environment variables.

use std::env;
use std::fmt::Display;
use std::str::FromStr;

use stockline_reconcile::{ConflictClosePolicy, ReconciliationConfig};
use thiserror::Error;

/// Configuration errors that can occur during environment loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Runtime configuration for the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Seconds between polls of the reconcile queue.
    pub poll_interval_secs: u64,
    /// Queued identifiers claimed per poll.
    pub poll_limit: i64,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub reconciliation: ReconciliationConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `DATABASE_URL` is missing
    /// - A numeric or policy variable does not parse
    /// - The resulting reconciliation settings are invalid
    ///
    /// # Optional Variables
    ///
    /// - `STOCKLINE_MAX_CONNECTIONS` (default: 10)
    /// - `STOCKLINE_POLL_INTERVAL_SECS` (default: 30)
    /// - `STOCKLINE_POLL_LIMIT` (default: 5000)
    /// - `STOCKLINE_LOG_FILTER` (default: "info")
    /// - `STOCKLINE_BATCH_SIZE`, `STOCKLINE_WRITE_BATCH_SIZE`,
    ///   `STOCKLINE_MAX_CONCURRENT_CHUNKS`, `STOCKLINE_MAX_RETRIES`,
    ///   `STOCKLINE_RETRY_BACKOFF_MS`, `STOCKLINE_CONFLICT_CLOSE_POLICY`
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development only)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let defaults = ReconciliationConfig::default();
        let reconciliation = ReconciliationConfig {
            batch_size: parse_var(&lookup, "STOCKLINE_BATCH_SIZE", defaults.batch_size)?,
            write_batch_size: parse_var(
                &lookup,
                "STOCKLINE_WRITE_BATCH_SIZE",
                defaults.write_batch_size,
            )?,
            max_concurrent_chunks: parse_var(
                &lookup,
                "STOCKLINE_MAX_CONCURRENT_CHUNKS",
                defaults.max_concurrent_chunks,
            )?,
            max_retries: parse_var(&lookup, "STOCKLINE_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff_ms: parse_var(
                &lookup,
                "STOCKLINE_RETRY_BACKOFF_MS",
                defaults.retry_backoff_ms,
            )?,
            conflict_close_policy: parse_var::<ConflictClosePolicy, _>(
                &lookup,
                "STOCKLINE_CONFLICT_CLOSE_POLICY",
                defaults.conflict_close_policy,
            )?,
        };
        reconciliation
            .validate()
            .map_err(|e| ConfigError::InvalidValue {
                var: "STOCKLINE_*".to_string(),
                message: e.to_string(),
            })?;

        let poll_interval_secs: u64 = parse_var(&lookup, "STOCKLINE_POLL_INTERVAL_SECS", 30)?;
        if poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                var: "STOCKLINE_POLL_INTERVAL_SECS".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        let poll_limit: i64 = parse_var(&lookup, "STOCKLINE_POLL_LIMIT", 5000)?;
        if poll_limit <= 0 {
            return Err(ConfigError::InvalidValue {
                var: "STOCKLINE_POLL_LIMIT".to_string(),
                message: "Must be positive".to_string(),
            });
        }

        Ok(Self {
            database_url,
            max_connections: parse_var(&lookup, "STOCKLINE_MAX_CONNECTIONS", 10)?,
            poll_interval_secs,
            poll_limit,
            log_filter: lookup("STOCKLINE_LOG_FILTER").unwrap_or_else(|| "info".to_string()),
            reconciliation,
        })
    }
}

/// Parse `var` if set, otherwise return `default`.
fn parse_var<T, F>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: var.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
