//! Feed snapshot ingestion.
//!
//! Maps raw JSON rows through a [`FieldSchema`], assigns identities with a
//! fresh [`RunContext`], and replaces the feed's snapshot in the store. The
//! store queues every touched identifier for the worker; the summary also
//! returns them for callers that reconcile inline.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use stockline_core::InventoryScope;
use stockline_db::SourceType;

use crate::fields::FieldSchema;
use crate::identity::RunContext;
use crate::store::{ReconciliationStore, StoreResult};

/// Counts from one ingested feed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub source_type: SourceType,
    pub rows_received: u64,
    pub rows_accepted: u64,
    /// Rows that were not JSON objects.
    pub rows_rejected: u64,
    /// Rows given a synthetic identifier.
    pub synthesized: u64,
    /// Rows dropped as repeats of an identifier already in the snapshot.
    pub duplicates: u64,
    /// Identifiers written or removed, sorted.
    pub touched: Vec<String>,
}

/// Loads feed snapshots into the source record table.
pub struct FeedIngestor {
    store: Arc<dyn ReconciliationStore>,
    schema: FieldSchema,
}

impl FeedIngestor {
    /// Create an ingestor with the default alias schema.
    #[must_use]
    pub fn new(store: Arc<dyn ReconciliationStore>) -> Self {
        Self::with_schema(store, FieldSchema::default())
    }

    #[must_use]
    pub fn with_schema(store: Arc<dyn ReconciliationStore>, schema: FieldSchema) -> Self {
        Self { store, schema }
    }

    #[must_use]
    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Replace `source_type`'s snapshot in `scope` with `rows`.
    ///
    /// Rows of this feed missing from `rows` are deleted, so an empty slice
    /// clears the feed.
    ///
    /// # Errors
    ///
    /// Returns the store error if the snapshot could not be written.
    pub async fn ingest(
        &self,
        scope: &InventoryScope,
        source_type: SourceType,
        rows: &[Value],
    ) -> StoreResult<IngestSummary> {
        let mut context = RunContext::new();
        let mut records = Vec::with_capacity(rows.len());
        let mut rejected = 0u64;

        for row in rows {
            let Some(object) = row.as_object() else {
                rejected += 1;
                continue;
            };
            if let Some(record) = context.normalize(source_type, self.schema.resolve(object)) {
                records.push(record);
            }
        }

        if rejected > 0 {
            tracing::warn!(
                scope = %scope,
                source_type = %source_type,
                rejected,
                "Skipped feed rows that are not JSON objects"
            );
        }

        let touched = self
            .store
            .replace_feed_snapshot(scope, source_type, &records)
            .await?;

        let summary = IngestSummary {
            source_type,
            rows_received: rows.len() as u64,
            rows_accepted: records.len() as u64,
            rows_rejected: rejected,
            synthesized: context.synthesized_count(),
            duplicates: context.duplicate_count(),
            touched,
        };

        tracing::info!(
            scope = %scope,
            source_type = %source_type,
            accepted = summary.rows_accepted,
            synthesized = summary.synthesized,
            duplicates = summary.duplicates,
            touched = summary.touched.len(),
            "Ingested feed snapshot"
        );

        Ok(summary)
    }
}
