//! Reconciliation engine.
//!
//! Orchestrates one run over an explicit identifier set: load inputs per
//! chunk, resolve, detect conflicts, diff against persisted state, and hand
//! the resulting [`ChunkPlan`] to the [`PersistenceWriter`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use stockline_core::{InventoryScope, RunId};
use stockline_db::{CanonicalItem, ConflictGroup, SourceRecord};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ReconciliationConfig;
use crate::conflict::{detect_conflict, plan_conflict, ConflictPlan};
use crate::diff::diff_identifier;
use crate::error::{ReconciliationError, ReconciliationResult, WriteStage};
use crate::resolver::resolve;
use crate::statistics::{RunSummary, StatisticsTracker};
use crate::store::ReconciliationStore;
use crate::writer::{ChunkPlan, PersistenceWriter, WriteOutcome};

/// Reconciliation engine for orchestrating reconciliation runs.
pub struct ReconciliationEngine {
    store: Arc<dyn ReconciliationStore>,
    config: ReconciliationConfig,
}

impl ReconciliationEngine {
    /// Create a new reconciliation engine with the default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn ReconciliationStore>) -> Self {
        Self {
            store,
            config: ReconciliationConfig::default(),
        }
    }

    /// Create with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `ReconciliationError::Configuration` if the configuration is
    /// invalid.
    pub fn with_config(
        store: Arc<dyn ReconciliationStore>,
        config: ReconciliationConfig,
    ) -> ReconciliationResult<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    #[must_use]
    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ReconciliationStore> {
        &self.store
    }

    /// Reconcile `identifiers` within `scope`.
    ///
    /// # Errors
    ///
    /// See [`ReconciliationEngine::run_with_cancellation`].
    pub async fn run(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> ReconciliationResult<RunSummary> {
        self.run_with_cancellation(scope, identifiers, &CancellationToken::new())
            .await
    }

    /// Reconcile `identifiers` within `scope`, stopping between chunks once
    /// `cancel` fires.
    ///
    /// A cancelled run is not an error: the summary has `cancelled` set and
    /// covers the chunks committed before cancellation.
    ///
    /// # Errors
    ///
    /// Returns `ReconciliationError::Read` when inputs cannot be loaded and
    /// `ReconciliationError::Write` (carrying the progress so far) when a
    /// canonical or conflict write fails after retries.
    pub async fn run_with_cancellation(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
        cancel: &CancellationToken,
    ) -> ReconciliationResult<RunSummary> {
        let run_id = RunId::new();
        let tracker = StatisticsTracker::new(run_id);
        let identifiers = normalize_identifiers(identifiers);

        tracing::info!(
            tenant_id = %scope.tenant_id,
            location_id = %scope.location_id,
            run_id = %run_id,
            identifiers = identifiers.len(),
            "Started reconciliation run"
        );

        // Stops chunks that have not started yet, on cancellation or failure.
        let halt = cancel.child_token();
        let mut first_error = None;

        let (tracker_ref, halt_ref) = (&tracker, &halt);
        let mut chunks = stream::iter(identifiers.chunks(self.config.batch_size))
            .map(move |chunk| {
                self.process_chunk(run_id, scope, chunk, tracker_ref, cancel, halt_ref)
            })
            .buffer_unordered(self.config.max_concurrent_chunks);

        while let Some(result) = chunks.next().await {
            if let Err(err) = result {
                halt.cancel();
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        drop(chunks);

        let summary = tracker.snapshot();

        if let Some(err) = first_error {
            tracing::error!(
                tenant_id = %scope.tenant_id,
                location_id = %scope.location_id,
                run_id = %run_id,
                chunks_committed = summary.chunks_committed,
                error = %err,
                "Reconciliation run failed"
            );
            return Err(err.with_progress(summary));
        }

        tracing::info!(
            tenant_id = %scope.tenant_id,
            location_id = %scope.location_id,
            run_id = %run_id,
            identifiers_processed = summary.identifiers_processed,
            events_logged = summary.events_logged,
            appeared = summary.appeared,
            updated = summary.updated,
            deleted = summary.deleted,
            conflicts_open = summary.conflicts_open,
            audit_failures = summary.audit_failures,
            cancelled = summary.cancelled,
            duration_ms = summary.duration_ms,
            "Completed reconciliation run"
        );

        Ok(summary)
    }

    /// Resolve an open conflict group by hand.
    ///
    /// Returns `None` when no open group with that id exists in scope.
    ///
    /// # Errors
    ///
    /// Returns `ReconciliationError::Write` if the store update fails.
    pub async fn resolve_conflict(
        &self,
        scope: &InventoryScope,
        conflict_id: Uuid,
        note: &str,
    ) -> ReconciliationResult<Option<ConflictGroup>> {
        let resolved = self
            .store
            .resolve_conflict(scope, conflict_id, note)
            .await
            .map_err(|e| ReconciliationError::write(WriteStage::ConflictClose, e))?;

        if resolved.is_some() {
            tracing::info!(
                tenant_id = %scope.tenant_id,
                conflict_id = %conflict_id,
                "Resolved conflict group"
            );
        }

        Ok(resolved)
    }

    async fn process_chunk(
        &self,
        run_id: RunId,
        scope: &InventoryScope,
        chunk: &[String],
        tracker: &StatisticsTracker,
        cancel: &CancellationToken,
        halt: &CancellationToken,
    ) -> ReconciliationResult<()> {
        if halt.is_cancelled() {
            if cancel.is_cancelled() {
                tracker.mark_cancelled();
            }
            return Ok(());
        }

        let (sources, canonical, conflicts) = tokio::try_join!(
            self.store.load_source_records(scope, chunk),
            self.store.load_canonical_items(scope, chunk),
            self.store.load_open_conflicts(scope, chunk),
        )
        .map_err(|e| ReconciliationError::read(*scope, e))?;

        let (plan, conflicts_open) =
            self.plan_chunk(scope, chunk, &sources, &canonical, &conflicts, Utc::now());

        let writer = PersistenceWriter::new(self.store.as_ref(), run_id, &self.config);
        let mut outcome = WriteOutcome::default();
        if let Err(err) = writer.apply_into(&plan, &mut outcome).await {
            tracker.record_partial(&outcome);
            return Err(err);
        }

        tracker.record_chunk(chunk.len() as u64, conflicts_open, &outcome);

        tracing::debug!(
            run_id = %run_id,
            identifiers = chunk.len(),
            events = outcome.events_logged,
            "Committed reconciliation chunk"
        );

        Ok(())
    }

    /// Compute the writes for one chunk. Returns the plan and the number of
    /// identifiers left under an open conflict group.
    fn plan_chunk(
        &self,
        scope: &InventoryScope,
        chunk: &[String],
        sources: &[SourceRecord],
        canonical: &[CanonicalItem],
        conflicts: &[ConflictGroup],
        now: DateTime<Utc>,
    ) -> (ChunkPlan, u64) {
        let mut sources_by_id: HashMap<&str, Vec<SourceRecord>> = HashMap::new();
        for record in sources {
            sources_by_id
                .entry(record.identifier.as_str())
                .or_default()
                .push(record.clone());
        }

        let mut canonical_by_id: HashMap<&str, Vec<CanonicalItem>> = HashMap::new();
        for item in canonical {
            canonical_by_id
                .entry(item.identifier.as_str())
                .or_default()
                .push(item.clone());
        }

        let open_by_id: HashMap<&str, &ConflictGroup> = conflicts
            .iter()
            .map(|group| (group.identifier.as_str(), group))
            .collect();

        let mut plan = ChunkPlan::new(*scope);
        let mut conflicts_open = 0;

        for identifier in chunk {
            let key = identifier.as_str();
            let records = sources_by_id.get(key).map(Vec::as_slice).unwrap_or_default();
            let prior = canonical_by_id.get(key).map(Vec::as_slice).unwrap_or_default();
            let existing = open_by_id.get(key).copied();

            let resolution = resolve(records);
            let assessment = resolution
                .as_ref()
                .and_then(|r| detect_conflict(&r.candidates));

            let conflict = plan_conflict(
                scope,
                identifier,
                assessment,
                existing,
                self.config.conflict_close_policy,
                now,
            );
            if conflict.leaves_open(existing.is_some()) {
                conflicts_open += 1;
            }
            match conflict {
                ConflictPlan::Open(group) => plan.conflict_opens.push(group),
                ConflictPlan::Refresh(group) => plan.conflict_refreshes.push(group),
                ConflictPlan::Close(id) => plan.conflict_closes.push(id),
                ConflictPlan::None | ConflictPlan::KeepOpen => {}
            }

            let diff = diff_identifier(
                scope,
                identifier,
                resolution.as_ref().map(|r| &r.view),
                prior,
                now,
            );
            plan.canonical_writes.extend(diff.write);
            plan.canonical_deletes.extend(diff.deletes);
            plan.events.extend(diff.events);
        }

        (plan, conflicts_open)
    }
}

/// Trimmed, non-blank, deduplicated and sorted.
fn normalize_identifiers(identifiers: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = identifiers
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    normalized.sort_unstable();
    normalized.dedup();
    normalized
}
