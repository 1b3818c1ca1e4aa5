//! # Stockline Reconciliation Engine
//!
//! Turns several mutually inconsistent inventory feeds into one canonical
//! record per item, plus an append-only audit trail of every transition.
//!
//! ## Pipeline
//!
//! ```text
//! feed rows ──► FieldSchema ──► RunContext (identity) ──► source_records
//!                                                              │
//!            ┌─────────────────────────────────────────────────┘
//!            ▼
//!      ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────────┐
//!      │ Resolver │──►│ Conflict │──►│   Diff   │──►│ PersistenceWriter│
//!      └──────────┘   └──────────┘   └──────────┘   └──────────────────┘
//!                                                     canonical items,
//!                                                     conflict groups,
//!                                                     change events
//! ```
//!
//! Each run is scoped to an explicit identifier set inside one
//! [`InventoryScope`](stockline_core::InventoryScope). Identifiers are split
//! into chunks that are computed and written concurrently, bounded by
//! [`ReconciliationConfig::max_concurrent_chunks`].
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stockline_reconcile::{InMemoryStore, ReconciliationEngine};
//!
//! let engine = ReconciliationEngine::new(Arc::new(InMemoryStore::new()));
//! let summary = engine.run(&scope, &["SN100".to_string()]).await?;
//! println!("{} events", summary.events_logged);
//! ```

pub mod config;
pub mod conflict;
pub mod diff;
pub mod engine;
pub mod error;
pub mod fields;
pub mod identity;
pub mod ingest;
pub mod precedence;
pub mod resolver;
pub mod statistics;
pub mod store;
pub mod writer;

pub use config::{ConflictClosePolicy, ReconciliationConfig};
pub use conflict::{detect_conflict, plan_conflict, ConflictAssessment, ConflictPlan};
pub use diff::{diff_identifier, CanonicalWrite, DiffOutcome, PlannedEvent};
pub use engine::ReconciliationEngine;
pub use error::{ReconciliationError, ReconciliationResult, WriteStage};
pub use fields::{FieldSchema, RawFeedRow, SourceField};
pub use identity::{is_synthetic, RunContext};
pub use ingest::{FeedIngestor, IngestSummary};
pub use resolver::{resolve, CanonicalView, Resolution};
pub use statistics::{RunSummary, StatisticsTracker};
pub use store::memory::InMemoryStore;
pub use store::postgres::PgReconciliationStore;
pub use store::{ReconciliationStore, StoreError, StoreResult, WriteMode};
pub use writer::{ChunkPlan, PersistenceWriter, WriteOutcome};
