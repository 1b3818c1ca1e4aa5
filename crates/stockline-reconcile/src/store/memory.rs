//! In-memory store for tests.
//!
//! Mirrors the uniqueness rules of the Postgres schema (one source row per
//! feed and identifier, one canonical row per identifier and bucket, one open
//! conflict group per identifier, change events unique by id, one queue entry
//! per identifier) and can be told to fail specific operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stockline_core::{InventoryScope, ScopeAware};
use stockline_db::{
    CanonicalItem, ChangeEvent, ConflictGroup, ConflictStatus, NewSourceRecord, PendingIdentifier,
    SourceRecord, SourceType,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ReconciliationStore, StoreError, StoreResult, WriteMode};

/// Failure count meaning "fail every call".
pub const ALWAYS: u32 = u32::MAX;

#[derive(Debug, Default)]
struct State {
    source_records: Vec<SourceRecord>,
    canonical_items: HashMap<Uuid, CanonicalItem>,
    conflict_groups: HashMap<Uuid, ConflictGroup>,
    change_events: Vec<ChangeEvent>,
    queue: HashMap<(Uuid, Uuid, String), PendingIdentifier>,
}

impl State {
    fn enqueue(&mut self, scope: &InventoryScope, identifiers: &[String], now: DateTime<Utc>) {
        for identifier in identifiers {
            let key = (scope.tenant_uuid(), scope.location_uuid(), identifier.clone());
            self.queue
                .entry(key)
                .and_modify(|entry| entry.version += 1)
                .or_insert_with(|| PendingIdentifier {
                    tenant_id: scope.tenant_uuid(),
                    location_id: scope.location_uuid(),
                    identifier: identifier.clone(),
                    version: 1,
                    enqueued_at: now,
                });
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    reads: AtomicBool,
    canonical_writes: AtomicU32,
    conflict_writes: AtomicU32,
    event_appends: AtomicU32,
    event_appends_after_apply: AtomicU32,
    canonical_write_attempts: AtomicU32,
}

/// Consume one injected failure, if any remain.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| match remaining {
            0 => None,
            ALWAYS => Some(ALWAYS),
            n => Some(n - 1),
        })
        .is_ok()
}

fn injected(operation: &str) -> StoreError {
    StoreError::unavailable(format!("injected failure: {operation}"))
}

fn unique_violation(constraint: &str) -> StoreError {
    StoreError::Database(sqlx::Error::Protocol(format!(
        "duplicate key value violates unique constraint \"{constraint}\""
    )))
}

/// Test store keeping every table in memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    faults: Faults,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail (or succeed again).
    pub fn fail_reads(&self, fail: bool) {
        self.faults.reads.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` canonical upserts or deletes ([`ALWAYS`] for all).
    pub fn fail_canonical_writes(&self, count: u32) {
        self.faults.canonical_writes.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` conflict writes ([`ALWAYS`] for all).
    pub fn fail_conflict_writes(&self, count: u32) {
        self.faults.conflict_writes.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` event appends before anything is written.
    pub fn fail_event_appends(&self, count: u32) {
        self.faults.event_appends.store(count, Ordering::SeqCst);
    }

    /// Apply the next `count` event appends, then report failure anyway.
    pub fn fail_event_appends_after_apply(&self, count: u32) {
        self.faults
            .event_appends_after_apply
            .store(count, Ordering::SeqCst);
    }

    /// Number of canonical upsert/delete calls seen, including failed ones.
    pub fn canonical_write_attempts(&self) -> u32 {
        self.faults.canonical_write_attempts.load(Ordering::SeqCst)
    }

    /// Insert or replace a source row keyed on (scope, feed, identifier).
    pub async fn put_source_record(&self, record: SourceRecord) {
        let mut state = self.state.write().await;
        state.source_records.retain(|r| {
            !(r.tenant_id == record.tenant_id
                && r.location_id == record.location_id
                && r.source_type == record.source_type
                && r.identifier == record.identifier)
        });
        state.source_records.push(record);
    }

    /// Remove every source row of one identifier.
    pub async fn remove_source_records(&self, scope: &InventoryScope, identifier: &str) {
        let mut state = self.state.write().await;
        state
            .source_records
            .retain(|r| !(r.belongs_to(scope) && r.identifier == identifier));
    }

    /// Source rows in scope, ordered by identifier and feed.
    pub async fn source_records(&self, scope: &InventoryScope) -> Vec<SourceRecord> {
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .source_records
            .iter()
            .filter(|r| r.belongs_to(scope))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.identifier
                .cmp(&b.identifier)
                .then(a.source_type.cmp(&b.source_type))
        });
        rows
    }

    /// Canonical rows in scope, ordered by identifier and bucket.
    pub async fn canonical_items(&self, scope: &InventoryScope) -> Vec<CanonicalItem> {
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .canonical_items
            .values()
            .filter(|item| item.belongs_to(scope))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.identifier.cmp(&b.identifier).then(a.bucket.cmp(&b.bucket)));
        rows
    }

    /// Insert a canonical row as-is, bypassing the natural-key check.
    pub async fn put_canonical_item(&self, item: CanonicalItem) {
        self.state
            .write()
            .await
            .canonical_items
            .insert(item.id, item);
    }

    /// Every conflict group in scope, open or resolved.
    pub async fn conflict_groups(&self, scope: &InventoryScope) -> Vec<ConflictGroup> {
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .conflict_groups
            .values()
            .filter(|g| g.belongs_to(scope))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.identifier
                .cmp(&b.identifier)
                .then(a.detected_at.cmp(&b.detected_at))
        });
        rows
    }

    /// Change events in scope, in append order.
    pub async fn change_events(&self, scope: &InventoryScope) -> Vec<ChangeEvent> {
        let state = self.state.read().await;
        state
            .change_events
            .iter()
            .filter(|e| e.belongs_to(scope))
            .cloned()
            .collect()
    }

    /// Queue identifiers as a feed snapshot would.
    pub async fn enqueue(&self, scope: &InventoryScope, identifiers: &[String]) {
        self.state
            .write()
            .await
            .enqueue(scope, identifiers, Utc::now());
    }

    /// Queued identifiers in scope, sorted.
    pub async fn queued(&self, scope: &InventoryScope) -> Vec<String> {
        let state = self.state.read().await;
        let mut identifiers: Vec<_> = state
            .queue
            .values()
            .filter(|entry| entry.belongs_to(scope))
            .map(|entry| entry.identifier.clone())
            .collect();
        identifiers.sort_unstable();
        identifiers
    }

    fn check_reads(&self) -> StoreResult<()> {
        if self.faults.reads.load(Ordering::SeqCst) {
            return Err(injected("read"));
        }
        Ok(())
    }

    fn check_canonical_write(&self) -> StoreResult<()> {
        self.faults
            .canonical_write_attempts
            .fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.faults.canonical_writes) {
            return Err(injected("canonical write"));
        }
        Ok(())
    }

    fn check_conflict_write(&self) -> StoreResult<()> {
        if take_failure(&self.faults.conflict_writes) {
            return Err(injected("conflict write"));
        }
        Ok(())
    }
}

fn natural_key_taken(state: &State, item: &CanonicalItem) -> bool {
    state.canonical_items.values().any(|other| {
        other.id != item.id
            && other.tenant_id == item.tenant_id
            && other.location_id == item.location_id
            && other.identifier == item.identifier
            && other.bucket == item.bucket
    })
}

#[async_trait]
impl ReconciliationStore for InMemoryStore {
    async fn load_source_records(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<SourceRecord>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state
            .source_records
            .iter()
            .filter(|r| r.belongs_to(scope) && identifiers.contains(&r.identifier))
            .cloned()
            .collect())
    }

    async fn load_canonical_items(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<CanonicalItem>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state
            .canonical_items
            .values()
            .filter(|item| item.belongs_to(scope) && identifiers.contains(&item.identifier))
            .cloned()
            .collect())
    }

    async fn load_open_conflicts(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<ConflictGroup>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state
            .conflict_groups
            .values()
            .filter(|g| g.is_open() && g.belongs_to(scope) && identifiers.contains(&g.identifier))
            .cloned()
            .collect())
    }

    async fn upsert_canonical_items(
        &self,
        mode: WriteMode,
        items: &[CanonicalItem],
    ) -> StoreResult<u64> {
        self.check_canonical_write()?;
        let mut state = self.state.write().await;
        let now = Utc::now();

        for item in items {
            let mut row = item.clone();
            row.updated_at = now;
            match mode {
                WriteMode::ById => {
                    if natural_key_taken(&state, &row) {
                        return Err(unique_violation("canonical_items_natural_key"));
                    }
                    if let Some(existing) = state.canonical_items.get(&row.id) {
                        row.created_at = existing.created_at;
                    }
                }
                WriteMode::ByNaturalKey => {
                    let existing = state.canonical_items.values().find(|other| {
                        other.tenant_id == row.tenant_id
                            && other.location_id == row.location_id
                            && other.identifier == row.identifier
                            && other.bucket == row.bucket
                    });
                    if let Some(existing) = existing {
                        row.id = existing.id;
                        row.created_at = existing.created_at;
                    }
                }
                WriteMode::Direct => {
                    if state.canonical_items.contains_key(&row.id) {
                        return Err(unique_violation("canonical_items_pkey"));
                    }
                    if natural_key_taken(&state, &row) {
                        return Err(unique_violation("canonical_items_natural_key"));
                    }
                }
            }
            state.canonical_items.insert(row.id, row);
        }

        Ok(items.len() as u64)
    }

    async fn delete_canonical_items(
        &self,
        scope: &InventoryScope,
        ids: &[Uuid],
    ) -> StoreResult<u64> {
        self.check_canonical_write()?;
        let mut state = self.state.write().await;
        let before = state.canonical_items.len();
        state
            .canonical_items
            .retain(|id, item| !(item.belongs_to(scope) && ids.contains(id)));
        Ok((before - state.canonical_items.len()) as u64)
    }

    async fn insert_conflict_groups(&self, groups: &[ConflictGroup]) -> StoreResult<u64> {
        self.check_conflict_write()?;
        let mut state = self.state.write().await;
        let now = Utc::now();

        for group in groups {
            let open = state.conflict_groups.values_mut().find(|g| {
                g.is_open()
                    && g.tenant_id == group.tenant_id
                    && g.location_id == group.location_id
                    && g.identifier == group.identifier
            });
            match open {
                Some(existing) => {
                    existing.sources = group.sources.clone();
                    existing.reasons = group.reasons.clone();
                    existing.updated_at = now;
                }
                None => {
                    let mut row = group.clone();
                    row.status = ConflictStatus::Open;
                    state.conflict_groups.insert(row.id, row);
                }
            }
        }

        Ok(groups.len() as u64)
    }

    async fn refresh_conflict_groups(&self, groups: &[ConflictGroup]) -> StoreResult<u64> {
        self.check_conflict_write()?;
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut updated = 0;

        for group in groups {
            if let Some(existing) = state
                .conflict_groups
                .get_mut(&group.id)
                .filter(|g| g.is_open())
            {
                existing.sources = group.sources.clone();
                existing.reasons = group.reasons.clone();
                existing.updated_at = now;
                updated += 1;
            }
        }

        Ok(updated)
    }

    async fn resolve_conflict_groups(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
        note: &str,
    ) -> StoreResult<u64> {
        self.check_conflict_write()?;
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut resolved = 0;

        for group in state.conflict_groups.values_mut() {
            if group.is_open() && group.belongs_to(scope) && identifiers.contains(&group.identifier)
            {
                group.status = ConflictStatus::Resolved;
                group.resolved_at = Some(now);
                group.updated_at = now;
                group.resolution_note = Some(note.to_string());
                resolved += 1;
            }
        }

        Ok(resolved)
    }

    async fn resolve_conflict(
        &self,
        scope: &InventoryScope,
        conflict_id: Uuid,
        note: &str,
    ) -> StoreResult<Option<ConflictGroup>> {
        self.check_conflict_write()?;
        let mut state = self.state.write().await;
        let now = Utc::now();

        let Some(group) = state
            .conflict_groups
            .get_mut(&conflict_id)
            .filter(|g| g.is_open() && g.belongs_to(scope))
        else {
            return Ok(None);
        };
        group.status = ConflictStatus::Resolved;
        group.resolved_at = Some(now);
        group.updated_at = now;
        group.resolution_note = Some(note.to_string());
        Ok(Some(group.clone()))
    }

    async fn append_change_events(&self, events: &[ChangeEvent]) -> StoreResult<u64> {
        if take_failure(&self.faults.event_appends) {
            return Err(injected("event append"));
        }

        let mut state = self.state.write().await;
        let mut inserted = 0;
        for event in events {
            if state.change_events.iter().any(|e| e.id == event.id) {
                continue;
            }
            state.change_events.push(event.clone());
            inserted += 1;
        }
        drop(state);

        if take_failure(&self.faults.event_appends_after_apply) {
            return Err(injected("event append acknowledgement"));
        }
        Ok(inserted)
    }

    async fn replace_feed_snapshot(
        &self,
        scope: &InventoryScope,
        source_type: SourceType,
        records: &[NewSourceRecord],
    ) -> StoreResult<Vec<String>> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut touched: Vec<String> = Vec::with_capacity(records.len());

        for record in records {
            let mut row = record.clone().into_record(scope, now);
            if let Some(existing) = state.source_records.iter().find(|r| {
                r.belongs_to(scope)
                    && r.source_type == source_type
                    && r.identifier == record.identifier
            }) {
                row.id = existing.id;
                row.created_at = existing.created_at;
            }
            state.source_records.retain(|r| {
                !(r.belongs_to(scope)
                    && r.source_type == source_type
                    && r.identifier == record.identifier)
            });
            state.source_records.push(row);
            touched.push(record.identifier.clone());
        }

        let keep: Vec<&String> = records.iter().map(|r| &r.identifier).collect();
        state.source_records.retain(|r| {
            let absent = r.belongs_to(scope)
                && r.source_type == source_type
                && !keep.contains(&&r.identifier);
            if absent {
                touched.push(r.identifier.clone());
            }
            !absent
        });

        touched.sort_unstable();
        touched.dedup();
        state.enqueue(scope, &touched, now);
        Ok(touched)
    }

    async fn pending_identifiers(&self, limit: i64) -> StoreResult<Vec<PendingIdentifier>> {
        self.check_reads()?;
        let state = self.state.read().await;
        let mut entries: Vec<_> = state.queue.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then(a.tenant_id.cmp(&b.tenant_id))
                .then(a.location_id.cmp(&b.location_id))
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        entries.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(entries)
    }

    async fn complete_pending(
        &self,
        scope: &InventoryScope,
        entries: &[PendingIdentifier],
    ) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let mut removed = 0;
        for entry in entries.iter().filter(|e| e.belongs_to(scope)) {
            let key = (entry.tenant_id, entry.location_id, entry.identifier.clone());
            if state.queue.get(&key).is_some_and(|q| q.version == entry.version) {
                state.queue.remove(&key);
                removed += 1;
            }
        }
        Ok(removed)
    }
}
