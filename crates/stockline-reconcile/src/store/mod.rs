//! Storage seam for reconciliation.
//!
//! The engine only reads and writes through [`ReconciliationStore`].
//! [`postgres::PgReconciliationStore`] backs it with the `stockline-db`
//! models; [`memory::InMemoryStore`] is used by tests and supports fault
//! injection.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use stockline_core::InventoryScope;
use stockline_db::{
    is_transient, CanonicalItem, ChangeEvent, ConflictGroup, NewSourceRecord, PendingIdentifier,
    SourceRecord, SourceType,
};
use thiserror::Error;
use uuid::Uuid;

/// How a canonical row is keyed when written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// Upsert on the row id.
    ById,
    /// Upsert on (tenant, location, identifier, bucket).
    ByNaturalKey,
    /// Plain insert.
    Direct,
}

impl WriteMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::ById => "by_id",
            WriteMode::ByNaturalKey => "by_natural_key",
            WriteMode::Direct => "direct",
        }
    }
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend temporarily unavailable.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(err) => is_transient(err),
            StoreError::Unavailable { .. } => true,
            StoreError::Serialization(_) => false,
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Read/write contract the engine runs against.
///
/// Every method is scoped; implementations must never return or touch rows
/// outside the given scope.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// All source records for the identifiers.
    async fn load_source_records(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<SourceRecord>>;

    /// All canonical rows (including leftover duplicates) for the identifiers.
    async fn load_canonical_items(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<CanonicalItem>>;

    /// Open conflict groups for the identifiers.
    async fn load_open_conflicts(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<ConflictGroup>>;

    /// Write canonical rows keyed by `mode`.
    async fn upsert_canonical_items(
        &self,
        mode: WriteMode,
        items: &[CanonicalItem],
    ) -> StoreResult<u64>;

    /// Delete canonical rows by id.
    async fn delete_canonical_items(&self, scope: &InventoryScope, ids: &[Uuid])
        -> StoreResult<u64>;

    /// Insert new open conflict groups.
    async fn insert_conflict_groups(&self, groups: &[ConflictGroup]) -> StoreResult<u64>;

    /// Replace the snapshot of open conflict groups by id.
    async fn refresh_conflict_groups(&self, groups: &[ConflictGroup]) -> StoreResult<u64>;

    /// Resolve the open groups of the identifiers.
    async fn resolve_conflict_groups(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
        note: &str,
    ) -> StoreResult<u64>;

    /// Resolve one open group (operator action). `None` if it was not open.
    async fn resolve_conflict(
        &self,
        scope: &InventoryScope,
        conflict_id: Uuid,
        note: &str,
    ) -> StoreResult<Option<ConflictGroup>>;

    /// Append change events; ids already present are skipped.
    async fn append_change_events(&self, events: &[ChangeEvent]) -> StoreResult<u64>;

    /// Replace one feed's snapshot in scope: upsert `records` and delete that
    /// feed's rows whose identifier is absent from them. Every identifier
    /// upserted or removed is queued for reconciliation atomically with the
    /// source writes, and returned sorted and deduplicated.
    async fn replace_feed_snapshot(
        &self,
        scope: &InventoryScope,
        source_type: SourceType,
        records: &[NewSourceRecord],
    ) -> StoreResult<Vec<String>>;

    /// Up to `limit` queued identifiers across all scopes, oldest first.
    async fn pending_identifiers(&self, limit: i64) -> StoreResult<Vec<PendingIdentifier>>;

    /// Dequeue reconciled entries. An entry re-queued since it was read is
    /// left in place.
    async fn complete_pending(
        &self,
        scope: &InventoryScope,
        entries: &[PendingIdentifier],
    ) -> StoreResult<u64>;
}
