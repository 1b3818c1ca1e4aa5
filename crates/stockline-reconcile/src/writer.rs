//! Batched persistence of one chunk's results.
//!
//! Writes go out in a fixed order: canonical upserts, canonical deletes,
//! conflict inserts and refreshes, conflict closes, then change events.
//! Every store call is retried for retryable errors. Canonical and conflict
//! failures abort the chunk; event append failures are logged and counted.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use stockline_core::{InventoryScope, RunId};
use stockline_db::{ChangeEvent, ChangeKind, ConflictGroup};
use tracing::warn;
use uuid::Uuid;

use crate::config::ReconciliationConfig;
use crate::diff::{CanonicalWrite, PlannedEvent};
use crate::error::{ReconciliationError, ReconciliationResult, WriteStage};
use crate::store::{ReconciliationStore, StoreResult, WriteMode};

/// Note stored on conflict groups closed by a run.
pub const AUTO_CLOSE_NOTE: &str = "auto-closed: sources agree";

/// Everything one chunk needs written.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub scope: InventoryScope,
    pub canonical_writes: Vec<CanonicalWrite>,
    pub canonical_deletes: Vec<Uuid>,
    pub conflict_opens: Vec<ConflictGroup>,
    pub conflict_refreshes: Vec<ConflictGroup>,
    pub conflict_closes: Vec<String>,
    pub events: Vec<PlannedEvent>,
}

impl ChunkPlan {
    #[must_use]
    pub fn new(scope: InventoryScope) -> Self {
        Self {
            scope,
            canonical_writes: Vec::new(),
            canonical_deletes: Vec::new(),
            conflict_opens: Vec::new(),
            conflict_refreshes: Vec::new(),
            conflict_closes: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Whether applying the plan would touch the store at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.canonical_writes.is_empty()
            && self.canonical_deletes.is_empty()
            && self.conflict_opens.is_empty()
            && self.conflict_refreshes.is_empty()
            && self.conflict_closes.is_empty()
            && self.events.is_empty()
    }
}

/// Counts produced by applying one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub appeared: u64,
    pub updated: u64,
    pub deleted: u64,
    pub conflicts_opened: u64,
    pub conflicts_closed: u64,
    pub events_logged: u64,
    pub events_by_kind: HashMap<ChangeKind, u64>,
    pub audit_failures: u64,
}

/// Deterministic event id: the same change observed by the same run always
/// maps to the same id, so re-appending it is a no-op.
#[must_use]
pub fn event_id(run_id: RunId, scope: &InventoryScope, event: &PlannedEvent) -> Uuid {
    let mut hasher = Sha256::new();
    for part in [
        run_id.to_string().as_str(),
        scope.tenant_uuid().to_string().as_str(),
        scope.location_uuid().to_string().as_str(),
        event.identifier.as_str(),
        event.kind.as_str(),
        event.field.unwrap_or_default(),
        event.old_value.as_deref().unwrap_or_default(),
        event.new_value.as_deref().unwrap_or_default(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Turn planned events into rows ready to append.
#[must_use]
pub fn stamp_events(
    run_id: RunId,
    scope: &InventoryScope,
    events: &[PlannedEvent],
    now: DateTime<Utc>,
) -> Vec<ChangeEvent> {
    events
        .iter()
        .map(|event| ChangeEvent {
            id: event_id(run_id, scope, event),
            tenant_id: scope.tenant_uuid(),
            location_id: scope.location_uuid(),
            run_id: run_id.into_uuid(),
            identifier: event.identifier.clone(),
            kind: event.kind,
            field: event.field.map(str::to_string),
            old_value: event.old_value.clone(),
            new_value: event.new_value.clone(),
            source_type: event.source_type,
            source_id: event.source_id,
            snapshot: event.snapshot.clone(),
            created_at: now,
        })
        .collect()
}

/// Applies chunk plans against a store.
pub struct PersistenceWriter<'a> {
    store: &'a dyn ReconciliationStore,
    run_id: RunId,
    write_batch_size: usize,
    max_retries: usize,
    retry_backoff: Duration,
}

impl<'a> PersistenceWriter<'a> {
    #[must_use]
    pub fn new(store: &'a dyn ReconciliationStore, run_id: RunId, config: &ReconciliationConfig) -> Self {
        Self {
            store,
            run_id,
            write_batch_size: config.write_batch_size.max(1),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Run `operation`, retrying retryable failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut f: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempt as u32));
                    warn!(
                        run_id = %self.run_id,
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        "Store call failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Apply one chunk plan.
    ///
    /// # Errors
    ///
    /// Returns `ReconciliationError::Write` when a canonical or conflict write
    /// still fails after retries. Event append failures never error.
    pub async fn apply(&self, plan: &ChunkPlan) -> ReconciliationResult<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        self.apply_into(plan, &mut outcome).await?;
        Ok(outcome)
    }

    /// Apply one chunk plan, counting into `outcome` as each batch commits.
    ///
    /// On error `outcome` still holds the batches written before the failure.
    ///
    /// # Errors
    ///
    /// Same as [`PersistenceWriter::apply`].
    pub async fn apply_into(
        &self,
        plan: &ChunkPlan,
        outcome: &mut WriteOutcome,
    ) -> ReconciliationResult<()> {
        let scope = &plan.scope;

        for mode in [WriteMode::ById, WriteMode::ByNaturalKey, WriteMode::Direct] {
            let items: Vec<_> = plan
                .canonical_writes
                .iter()
                .filter(|write| write.mode == mode)
                .map(|write| write.item.clone())
                .collect();
            for batch in items.chunks(self.write_batch_size) {
                self.with_retry("upsert_canonical_items", || {
                    self.store.upsert_canonical_items(mode, batch)
                })
                .await
                .map_err(|e| ReconciliationError::write(WriteStage::CanonicalUpsert, e))?;

                let count = batch.len() as u64;
                if mode == WriteMode::ById {
                    outcome.updated += count;
                } else {
                    outcome.appeared += count;
                }
            }
        }

        for batch in plan.canonical_deletes.chunks(self.write_batch_size) {
            self.with_retry("delete_canonical_items", || {
                self.store.delete_canonical_items(scope, batch)
            })
            .await
            .map_err(|e| ReconciliationError::write(WriteStage::CanonicalDelete, e))?;
            outcome.deleted += batch.len() as u64;
        }

        for batch in plan.conflict_opens.chunks(self.write_batch_size) {
            self.with_retry("insert_conflict_groups", || {
                self.store.insert_conflict_groups(batch)
            })
            .await
            .map_err(|e| ReconciliationError::write(WriteStage::ConflictUpsert, e))?;
            outcome.conflicts_opened += batch.len() as u64;
        }

        for batch in plan.conflict_refreshes.chunks(self.write_batch_size) {
            self.with_retry("refresh_conflict_groups", || {
                self.store.refresh_conflict_groups(batch)
            })
            .await
            .map_err(|e| ReconciliationError::write(WriteStage::ConflictUpsert, e))?;
        }

        for batch in plan.conflict_closes.chunks(self.write_batch_size) {
            let closed = self
                .with_retry("resolve_conflict_groups", || {
                    self.store.resolve_conflict_groups(scope, batch, AUTO_CLOSE_NOTE)
                })
                .await
                .map_err(|e| ReconciliationError::write(WriteStage::ConflictClose, e))?;
            outcome.conflicts_closed += closed;
        }

        let events = stamp_events(self.run_id, scope, &plan.events, Utc::now());
        for batch in events.chunks(self.write_batch_size) {
            match self
                .with_retry("append_change_events", || {
                    self.store.append_change_events(batch)
                })
                .await
            {
                Ok(_) => {
                    outcome.events_logged += batch.len() as u64;
                    for event in batch {
                        *outcome.events_by_kind.entry(event.kind).or_insert(0) += 1;
                    }
                }
                Err(err) => {
                    warn!(
                        run_id = %self.run_id,
                        scope = %scope,
                        count = batch.len(),
                        error = %err,
                        "Failed to append change events"
                    );
                    outcome.audit_failures += batch.len() as u64;
                }
            }
        }

        Ok(())
    }
}
