//! Reconciliation error types.

use stockline_core::InventoryScope;
use thiserror::Error;

use crate::statistics::RunSummary;
use crate::store::StoreError;

/// The write step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteStage {
    CanonicalUpsert,
    CanonicalDelete,
    ConflictUpsert,
    ConflictClose,
}

impl WriteStage {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteStage::CanonicalUpsert => "canonical_upsert",
            WriteStage::CanonicalDelete => "canonical_delete",
            WriteStage::ConflictUpsert => "conflict_upsert",
            WriteStage::ConflictClose => "conflict_close",
        }
    }
}

impl std::fmt::Display for WriteStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that abort a reconciliation run.
///
/// Audit append failures are not represented here; they are counted in
/// [`RunSummary::audit_failures`] and the run continues.
#[derive(Debug, Error)]
pub enum ReconciliationError {
    /// Source records, canonical items or open conflicts could not be loaded.
    #[error("Failed to load reconciliation inputs for {scope}: {source}")]
    Read {
        scope: InventoryScope,
        #[source]
        source: StoreError,
    },

    /// A canonical or conflict write failed after retries.
    ///
    /// Chunks committed before the failure stay valid; `progress` holds the
    /// counts accumulated up to that point.
    #[error("Write failed during {stage}: {source}")]
    Write {
        stage: WriteStage,
        #[source]
        source: StoreError,
        progress: Box<RunSummary>,
    },

    /// Invalid engine configuration.
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ReconciliationError {
    /// Create a read error.
    pub fn read(scope: InventoryScope, source: StoreError) -> Self {
        Self::Read { scope, source }
    }

    /// Create a write error with empty progress.
    pub fn write(stage: WriteStage, source: StoreError) -> Self {
        Self::Write {
            stage,
            source,
            progress: Box::default(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Attach run progress to a write error. Other variants are unchanged.
    #[must_use]
    pub fn with_progress(self, summary: RunSummary) -> Self {
        match self {
            Self::Write { stage, source, .. } => Self::Write {
                stage,
                source,
                progress: Box::new(summary),
            },
            other => other,
        }
    }

    /// Progress recorded before a write failure.
    #[must_use]
    pub fn progress(&self) -> Option<&RunSummary> {
        match self {
            Self::Write { progress, .. } => Some(progress),
            _ => None,
        }
    }

    /// Check if re-invoking the run may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => source.is_retryable(),
            Self::Configuration { .. } => false,
        }
    }
}

/// Result type for reconciliation operations.
pub type ReconciliationResult<T> = Result<T, ReconciliationError>;
