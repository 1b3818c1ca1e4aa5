//! # Stockline Database Layer
//!
//! Postgres models and migrations for multi-source inventory reconciliation.
//!
//! Tables:
//! - `source_records` - one row per feed observation of one identifier
//! - `canonical_items` - the reconciled truth per identifier
//! - `conflict_groups` - identifiers where feeds disagree
//! - `change_events` - append-only audit log
//! - `reconcile_queue` - identifiers waiting for a reconciliation run
//!
//! Every query is scoped by `(tenant_id, location_id)`.

pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;

pub use error::{is_transient, DbError};
pub use migrations::run_migrations;
pub use models::{
    Bucket, CanonicalItem, ChangeEvent, ChangeKind, ConflictGroup, ConflictReason,
    ConflictSourceSummary, ConflictStatus, NewSourceRecord, PendingIdentifier, SourceRecord,
    SourceType,
};
pub use pool::DbPool;
