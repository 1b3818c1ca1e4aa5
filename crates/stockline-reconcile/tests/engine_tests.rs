//! Reconciliation engine tests
//!
//! End-to-end runs against the in-memory store covering:
//! - Idempotence and determinism of canonical output
//! - Synthetic identity uniqueness
//! - Conflict detection, auto-close and manual resolution
//! - Appearance, disappearance and field-level change events
//! - Failure semantics (read, canonical write, audit append) and retries
//! - Progress reported for rows written before a failing stage
//! - Cancellation between chunks, resume, and scope isolation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use stockline_core::{InventoryScope, LocationId, TenantId};
use stockline_db::{
    Bucket, CanonicalItem, ChangeEvent, ChangeKind, ConflictGroup, ConflictReason, ConflictStatus,
    NewSourceRecord, PendingIdentifier, SourceRecord, SourceType,
};
use stockline_reconcile::store::memory::ALWAYS;
use stockline_reconcile::{
    is_synthetic, ConflictClosePolicy, FeedIngestor, InMemoryStore, ReconciliationConfig,
    ReconciliationEngine, ReconciliationError, ReconciliationStore, StoreResult, WriteMode,
    WriteStage,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// =============================================================================
// Helpers
// =============================================================================

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("stockline_reconcile=debug")
        .with_test_writer()
        .try_init();
}

fn scope() -> InventoryScope {
    InventoryScope::new(TenantId::new(), LocationId::new())
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

fn new_record(source_type: SourceType, identifier: &str) -> NewSourceRecord {
    NewSourceRecord {
        source_type,
        identifier: identifier.to_string(),
        bucket: None,
        state: None,
        model: None,
        quantity: None,
        grouping_key: None,
        status_code: None,
        message_code: None,
        last_seen_at: None,
        raw_payload: json!({}),
    }
}

fn test_config() -> ReconciliationConfig {
    ReconciliationConfig {
        retry_backoff_ms: 0,
        ..ReconciliationConfig::default()
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    engine: ReconciliationEngine,
    scope: InventoryScope,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: ReconciliationConfig) -> Self {
        init_test_logging();
        let store = Arc::new(InMemoryStore::new());
        let engine = ReconciliationEngine::with_config(store.clone(), config).unwrap();
        Self {
            store,
            engine,
            scope: scope(),
        }
    }

    async fn put(&self, record: NewSourceRecord) -> SourceRecord {
        let row = record.into_record(&self.scope, Utc::now());
        self.store.put_source_record(row.clone()).await;
        row
    }

    async fn canonical(&self) -> Vec<CanonicalItem> {
        self.store.canonical_items(&self.scope).await
    }

    async fn events_of(&self, kind: ChangeKind) -> usize {
        self.store
            .change_events(&self.scope)
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

/// Delegates to an [`InMemoryStore`] and cancels `token` once the first
/// chunk has appended its events, which is the last write of a chunk.
struct CancelAfterFirstChunk {
    inner: Arc<InMemoryStore>,
    token: CancellationToken,
    fired: AtomicBool,
}

#[async_trait]
impl ReconciliationStore for CancelAfterFirstChunk {
    async fn load_source_records(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<SourceRecord>> {
        self.inner.load_source_records(scope, identifiers).await
    }

    async fn load_canonical_items(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<CanonicalItem>> {
        self.inner.load_canonical_items(scope, identifiers).await
    }

    async fn load_open_conflicts(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<ConflictGroup>> {
        self.inner.load_open_conflicts(scope, identifiers).await
    }

    async fn upsert_canonical_items(
        &self,
        mode: WriteMode,
        items: &[CanonicalItem],
    ) -> StoreResult<u64> {
        self.inner.upsert_canonical_items(mode, items).await
    }

    async fn delete_canonical_items(
        &self,
        scope: &InventoryScope,
        ids: &[Uuid],
    ) -> StoreResult<u64> {
        self.inner.delete_canonical_items(scope, ids).await
    }

    async fn insert_conflict_groups(&self, groups: &[ConflictGroup]) -> StoreResult<u64> {
        self.inner.insert_conflict_groups(groups).await
    }

    async fn refresh_conflict_groups(&self, groups: &[ConflictGroup]) -> StoreResult<u64> {
        self.inner.refresh_conflict_groups(groups).await
    }

    async fn resolve_conflict_groups(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
        note: &str,
    ) -> StoreResult<u64> {
        self.inner
            .resolve_conflict_groups(scope, identifiers, note)
            .await
    }

    async fn resolve_conflict(
        &self,
        scope: &InventoryScope,
        conflict_id: Uuid,
        note: &str,
    ) -> StoreResult<Option<ConflictGroup>> {
        self.inner.resolve_conflict(scope, conflict_id, note).await
    }

    async fn append_change_events(&self, events: &[ChangeEvent]) -> StoreResult<u64> {
        let appended = self.inner.append_change_events(events).await?;
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.token.cancel();
        }
        Ok(appended)
    }

    async fn replace_feed_snapshot(
        &self,
        scope: &InventoryScope,
        source_type: SourceType,
        records: &[NewSourceRecord],
    ) -> StoreResult<Vec<String>> {
        self.inner
            .replace_feed_snapshot(scope, source_type, records)
            .await
    }

    async fn pending_identifiers(&self, limit: i64) -> StoreResult<Vec<PendingIdentifier>> {
        self.inner.pending_identifiers(limit).await
    }

    async fn complete_pending(
        &self,
        scope: &InventoryScope,
        entries: &[PendingIdentifier],
    ) -> StoreResult<u64> {
        self.inner.complete_pending(scope, entries).await
    }
}

// =============================================================================
// Idempotence and determinism
// =============================================================================

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let h = Harness::new();
    let mut fg = new_record(SourceType::FinishedGoods, "SN1");
    fg.bucket = Some(Bucket::Fg);
    fg.model = Some("X1".to_string());
    fg.quantity = Some(1);
    h.put(fg).await;
    let mut returns = new_record(SourceType::Returns, "SN2");
    returns.model = Some("ABC123".to_string());
    h.put(returns).await;
    let mut fg2 = new_record(SourceType::FinishedGoods, "SN2");
    fg2.model = Some("ABC124".to_string());
    h.put(fg2).await;

    let first = h.engine.run(&h.scope, &ids(&["SN1", "SN2"])).await.unwrap();
    assert_eq!(first.appeared, 2);
    assert_eq!(first.conflicts_opened, 1);
    let canonical_before = h.canonical().await;
    let events_before = h.store.change_events(&h.scope).await.len();

    let second = h.engine.run(&h.scope, &ids(&["SN1", "SN2"])).await.unwrap();
    assert_eq!(second.events_logged, 0);
    assert_eq!(second.appeared, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(second.conflicts_opened, 0);
    assert_eq!(second.conflicts_open, 1);
    assert_eq!(h.store.change_events(&h.scope).await.len(), events_before);

    let canonical_after = h.canonical().await;
    assert_eq!(canonical_before.len(), canonical_after.len());
    for (before, after) in canonical_before.iter().zip(&canonical_after) {
        assert_eq!(before.id, after.id);
        assert_eq!(before.bucket, after.bucket);
        assert_eq!(before.source_id, after.source_id);
    }
}

#[tokio::test]
async fn test_input_order_does_not_change_output() {
    let scope = scope();
    let mut rows = Vec::new();
    for (source_type, bucket, seen) in [
        (SourceType::Inbound, Some(Bucket::Inb), 7),
        (SourceType::Returns, Some(Bucket::Asis), 8),
        (SourceType::FinishedGoods, Some(Bucket::Fg), 9),
    ] {
        let mut record = new_record(source_type, "SN1");
        record.bucket = bucket;
        record.model = Some("M1".to_string());
        record.last_seen_at = Some(at(seen));
        rows.push(record.into_record(&scope, at(10)));
    }

    let mut outputs = Vec::new();
    for order in [vec![0, 1, 2], vec![2, 1, 0], vec![1, 2, 0]] {
        let store = Arc::new(InMemoryStore::new());
        for index in order {
            store.put_source_record(rows[index].clone()).await;
        }
        let engine = ReconciliationEngine::with_config(store.clone(), test_config()).unwrap();
        engine.run(&scope, &ids(&["SN1"])).await.unwrap();

        let item = store.canonical_items(&scope).await.remove(0);
        outputs.push((item.bucket, item.state, item.source_type, item.source_id));
    }

    assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(outputs[0].2, SourceType::Returns);
    assert_eq!(outputs[0].0, Bucket::Asis);
}

// =============================================================================
// Identity
// =============================================================================

#[tokio::test]
async fn test_rows_without_serial_get_distinct_identifiers() {
    let h = Harness::new();
    let ingestor = FeedIngestor::new(h.store.clone());

    let rows = vec![
        json!({"model": "WX-100", "load": "L1"}),
        json!({"model": "WX-100", "load": "L1"}),
        json!({"model": "WX-100", "load": "L1"}),
    ];
    let ingested = ingestor
        .ingest(&h.scope, SourceType::Inbound, &rows)
        .await
        .unwrap();
    assert_eq!(ingested.synthesized, 3);
    assert_eq!(ingested.touched.len(), 3);

    let summary = h.engine.run(&h.scope, &ingested.touched).await.unwrap();
    assert_eq!(summary.appeared, 3);

    let canonical = h.canonical().await;
    assert_eq!(canonical.len(), 3);
    assert!(canonical.iter().all(|item| item.is_synthetic));
    assert!(canonical.iter().all(|item| is_synthetic(&item.identifier)));
}

// =============================================================================
// Conflicts
// =============================================================================

#[tokio::test]
async fn test_model_mismatch_opens_conflict() {
    let h = Harness::new();
    let mut returns = new_record(SourceType::Returns, "SN1");
    returns.model = Some("ABC123".to_string());
    h.put(returns).await;
    let mut fg = new_record(SourceType::FinishedGoods, "SN1");
    fg.model = Some("ABC124".to_string());
    h.put(fg).await;

    let summary = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();
    assert_eq!(summary.conflicts_opened, 1);
    assert_eq!(summary.conflicts_open, 1);

    let groups = h.store.conflict_groups(&h.scope).await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].status, ConflictStatus::Open);
    assert_eq!(groups[0].reasons.0, vec![ConflictReason::ModelMismatch]);
    assert_eq!(groups[0].sources.0.len(), 2);
    assert_eq!(groups[0].sources.0[0].source_type, SourceType::Returns);
}

#[tokio::test]
async fn test_bucket_mismatch_opens_conflict() {
    let h = Harness::new();
    let mut fg = new_record(SourceType::FinishedGoods, "SN1");
    fg.bucket = Some(Bucket::Fg);
    h.put(fg).await;
    let mut returns = new_record(SourceType::Returns, "SN1");
    returns.bucket = Some(Bucket::Asis);
    h.put(returns).await;

    h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();

    let groups = h.store.conflict_groups(&h.scope).await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].reasons.0, vec![ConflictReason::BucketMismatch]);
}

#[tokio::test]
async fn test_staging_bucket_never_conflicts() {
    let h = Harness::new();
    let mut inbound = new_record(SourceType::Inbound, "SN1");
    inbound.bucket = Some(Bucket::Sta);
    h.put(inbound).await;
    let mut returns = new_record(SourceType::Returns, "SN1");
    returns.bucket = Some(Bucket::Asis);
    h.put(returns).await;

    let summary = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();
    assert_eq!(summary.conflicts_opened, 0);
    assert!(h.store.conflict_groups(&h.scope).await.is_empty());
}

#[tokio::test]
async fn test_conflict_auto_closes_when_sources_agree() {
    let h = Harness::new();
    let mut returns = new_record(SourceType::Returns, "SN1");
    returns.model = Some("ABC123".to_string());
    h.put(returns).await;
    let mut fg = new_record(SourceType::FinishedGoods, "SN1");
    fg.model = Some("ABC124".to_string());
    h.put(fg.clone()).await;

    h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();

    fg.model = Some("abc-123".to_string());
    h.put(fg).await;
    let summary = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();

    assert_eq!(summary.conflicts_closed, 1);
    assert_eq!(summary.conflicts_open, 0);
    let groups = h.store.conflict_groups(&h.scope).await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].status, ConflictStatus::Resolved);
    assert!(groups[0].resolved_at.is_some());
}

#[tokio::test]
async fn test_manual_policy_keeps_conflict_open_until_resolved() {
    let h = Harness::with_config(ReconciliationConfig {
        conflict_close_policy: ConflictClosePolicy::Manual,
        ..test_config()
    });
    let mut returns = new_record(SourceType::Returns, "SN1");
    returns.model = Some("ABC123".to_string());
    h.put(returns).await;
    let mut fg = new_record(SourceType::FinishedGoods, "SN1");
    fg.model = Some("ABC124".to_string());
    h.put(fg.clone()).await;

    h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();
    fg.model = Some("ABC123".to_string());
    h.put(fg).await;

    let summary = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();
    assert_eq!(summary.conflicts_closed, 0);
    assert_eq!(summary.conflicts_open, 1);

    let group = h.store.conflict_groups(&h.scope).await.remove(0);
    assert!(group.is_open());

    let resolved = h
        .engine
        .resolve_conflict(&h.scope, group.id, "checked on the floor")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.status, ConflictStatus::Resolved);
    assert_eq!(
        resolved.resolution_note.as_deref(),
        Some("checked on the floor")
    );

    let again = h
        .engine
        .resolve_conflict(&h.scope, group.id, "twice")
        .await
        .unwrap();
    assert!(again.is_none());
}

// =============================================================================
// Change events
// =============================================================================

#[tokio::test]
async fn test_appearance_and_disappearance() {
    let h = Harness::new();
    let mut fg = new_record(SourceType::FinishedGoods, "SN1");
    fg.bucket = Some(Bucket::Fg);
    h.put(fg).await;

    let summary = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();
    assert_eq!(summary.appeared, 1);
    assert_eq!(summary.event_count(ChangeKind::Appeared), 1);
    assert_eq!(h.canonical().await.len(), 1);

    h.store.remove_source_records(&h.scope, "SN1").await;
    let summary = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.event_count(ChangeKind::Disappeared), 1);
    assert!(h.canonical().await.is_empty());

    let events = h.store.change_events(&h.scope).await;
    let disappeared = events
        .iter()
        .find(|e| e.kind == ChangeKind::Disappeared)
        .unwrap();
    assert_eq!(disappeared.old_value.as_deref(), Some("FG"));
    assert_eq!(disappeared.new_value, None);
}

#[tokio::test]
async fn test_quantity_change_emits_single_event() {
    let h = Harness::new();
    let mut fg = new_record(SourceType::FinishedGoods, "SN1");
    fg.bucket = Some(Bucket::Fg);
    fg.quantity = Some(5);
    h.put(fg.clone()).await;
    h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();

    fg.quantity = Some(3);
    h.put(fg).await;
    let summary = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();

    assert_eq!(summary.events_logged, 1);
    assert_eq!(summary.updated, 1);
    let events = h.store.change_events(&h.scope).await;
    let change = events
        .iter()
        .find(|e| e.kind == ChangeKind::QuantityChanged)
        .unwrap();
    assert_eq!(change.field.as_deref(), Some("quantity"));
    assert_eq!(change.old_value.as_deref(), Some("5"));
    assert_eq!(change.new_value.as_deref(), Some("3"));
    assert_eq!(h.canonical().await[0].quantity, Some(3));
}

#[tokio::test]
async fn test_staged_record_is_authoritative() {
    let h = Harness::new();
    let mut staging = new_record(SourceType::Staging, "SN100");
    staging.state = Some("staged".to_string());
    staging.bucket = Some(Bucket::Asis);
    staging.model = Some("X1".to_string());
    staging.last_seen_at = Some(at(9));
    let staged = h.put(staging).await;
    let mut fg = new_record(SourceType::FinishedGoods, "SN100");
    fg.bucket = Some(Bucket::Fg);
    fg.model = Some("X1".to_string());
    fg.last_seen_at = Some(at(8));
    h.put(fg).await;

    let summary = h.engine.run(&h.scope, &ids(&["SN100"])).await.unwrap();
    assert_eq!(summary.conflicts_opened, 0);

    let item = h.canonical().await.remove(0);
    assert_eq!(item.bucket, Bucket::Fg);
    assert_eq!(item.state.as_deref(), Some("staged"));
    assert_eq!(item.source_type, SourceType::Staging);
    assert_eq!(item.source_id, staged.id);
    assert_eq!(item.last_seen_at, Some(at(9)));
}

#[tokio::test]
async fn test_leftover_duplicate_rows_are_collapsed() {
    let h = Harness::new();
    let mut fg = new_record(SourceType::FinishedGoods, "SN1");
    fg.bucket = Some(Bucket::Fg);
    let source = h.put(fg).await;

    for bucket in [Bucket::Fg, Bucket::Asis] {
        h.store
            .put_canonical_item(CanonicalItem {
                id: Uuid::new_v4(),
                tenant_id: h.scope.tenant_uuid(),
                location_id: h.scope.location_uuid(),
                identifier: "SN1".to_string(),
                bucket,
                state: None,
                source_type: SourceType::FinishedGoods,
                source_id: source.id,
                model: None,
                quantity: None,
                grouping_key: None,
                status_code: None,
                message_code: None,
                is_synthetic: false,
                last_seen_at: None,
                created_at: at(1),
                updated_at: at(1),
            })
            .await;
    }

    let summary = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();
    assert_eq!(summary.deleted, 1);

    let canonical = h.canonical().await;
    assert_eq!(canonical.len(), 1);
    assert_eq!(canonical[0].bucket, Bucket::Fg);
}

// =============================================================================
// Failure semantics
// =============================================================================

#[tokio::test]
async fn test_read_failure_aborts_before_writes() {
    let h = Harness::new();
    h.put(new_record(SourceType::Inbound, "SN1")).await;
    h.store.fail_reads(true);

    let err = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap_err();
    assert!(matches!(err, ReconciliationError::Read { .. }));
    assert!(h.canonical().await.is_empty());
    assert_eq!(h.store.canonical_write_attempts(), 0);
}

#[tokio::test]
async fn test_audit_failure_does_not_fail_run() {
    let h = Harness::new();
    h.put(new_record(SourceType::Inbound, "SN1")).await;
    h.store.fail_event_appends(ALWAYS);

    let summary = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();
    assert_eq!(summary.appeared, 1);
    assert_eq!(summary.audit_failures, 1);
    assert_eq!(summary.events_logged, 0);
    assert_eq!(h.canonical().await.len(), 1);
    assert!(h.store.change_events(&h.scope).await.is_empty());
}

#[tokio::test]
async fn test_canonical_write_failure_reports_progress() {
    let h = Harness::with_config(ReconciliationConfig {
        batch_size: 1,
        max_concurrent_chunks: 1,
        max_retries: 1,
        ..test_config()
    });
    h.put(new_record(SourceType::Inbound, "SN1")).await;
    h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();

    h.put(new_record(SourceType::Inbound, "SN2")).await;
    h.store.fail_canonical_writes(ALWAYS);

    let err = h
        .engine
        .run(&h.scope, &ids(&["SN1", "SN2"]))
        .await
        .unwrap_err();

    match &err {
        ReconciliationError::Write { stage, .. } => {
            assert_eq!(*stage, WriteStage::CanonicalUpsert);
        }
        other => panic!("unexpected error: {other}"),
    }
    let progress = err.progress().unwrap();
    assert_eq!(progress.chunks_committed, 1);
    assert_eq!(progress.identifiers_processed, 1);
    assert!(err.is_retryable());
    assert_eq!(h.store.canonical_write_attempts(), 3);
}

#[tokio::test]
async fn test_conflict_write_failure_reports_committed_canonical_rows() {
    let h = Harness::with_config(ReconciliationConfig {
        max_retries: 1,
        ..test_config()
    });
    let mut returns = new_record(SourceType::Returns, "SN1");
    returns.model = Some("ABC123".to_string());
    h.put(returns).await;
    let mut fg = new_record(SourceType::FinishedGoods, "SN1");
    fg.model = Some("ABC124".to_string());
    h.put(fg).await;
    h.store.fail_conflict_writes(ALWAYS);

    let err = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap_err();

    assert!(matches!(
        err,
        ReconciliationError::Write {
            stage: WriteStage::ConflictUpsert,
            ..
        }
    ));
    let progress = err.progress().unwrap();
    assert_eq!(progress.appeared, 1);
    assert_eq!(progress.chunks_committed, 0);
    assert_eq!(progress.identifiers_processed, 0);
    assert_eq!(h.canonical().await.len(), 1);
}

#[tokio::test]
async fn test_transient_write_failure_is_retried() {
    let h = Harness::new();
    h.put(new_record(SourceType::Inbound, "SN1")).await;
    h.store.fail_canonical_writes(2);

    let summary = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();
    assert_eq!(summary.appeared, 1);
    assert_eq!(h.store.canonical_write_attempts(), 3);
}

#[tokio::test]
async fn test_event_retry_does_not_duplicate_rows() {
    let h = Harness::new();
    h.put(new_record(SourceType::Inbound, "SN1")).await;
    h.store.fail_event_appends_after_apply(1);

    let summary = h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();
    assert_eq!(summary.audit_failures, 0);
    assert_eq!(h.events_of(ChangeKind::Appeared).await, 1);
}

// =============================================================================
// Cancellation, chunking and scope
// =============================================================================

#[tokio::test]
async fn test_cancelled_run_writes_nothing_and_can_resume() {
    let h = Harness::new();
    h.put(new_record(SourceType::Inbound, "SN1")).await;
    h.put(new_record(SourceType::Inbound, "SN2")).await;

    let token = CancellationToken::new();
    token.cancel();
    let summary = h
        .engine
        .run_with_cancellation(&h.scope, &ids(&["SN1", "SN2"]), &token)
        .await
        .unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.chunks_committed, 0);
    assert!(h.canonical().await.is_empty());

    let resumed = h.engine.run(&h.scope, &ids(&["SN1", "SN2"])).await.unwrap();
    assert!(!resumed.cancelled);
    assert_eq!(resumed.appeared, 2);
}

#[tokio::test]
async fn test_cancel_between_chunks_keeps_committed_work() {
    init_test_logging();
    let inner = Arc::new(InMemoryStore::new());
    let token = CancellationToken::new();
    let store = Arc::new(CancelAfterFirstChunk {
        inner: inner.clone(),
        token: token.clone(),
        fired: AtomicBool::new(false),
    });
    let config = ReconciliationConfig {
        batch_size: 1,
        max_concurrent_chunks: 1,
        ..test_config()
    };
    let engine = ReconciliationEngine::with_config(store, config.clone()).unwrap();
    let scope = scope();
    for identifier in ["SN1", "SN2", "SN3"] {
        let row = new_record(SourceType::Inbound, identifier).into_record(&scope, Utc::now());
        inner.put_source_record(row).await;
    }

    let summary = engine
        .run_with_cancellation(&scope, &ids(&["SN1", "SN2", "SN3"]), &token)
        .await
        .unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.chunks_committed, 1);
    assert_eq!(summary.appeared, 1);
    let committed: Vec<_> = inner
        .canonical_items(&scope)
        .await
        .into_iter()
        .map(|item| item.identifier)
        .collect();
    assert_eq!(committed, ids(&["SN1"]));

    let resumed = ReconciliationEngine::with_config(inner.clone(), config)
        .unwrap()
        .run(&scope, &ids(&["SN1", "SN2", "SN3"]))
        .await
        .unwrap();
    assert!(!resumed.cancelled);
    assert_eq!(resumed.appeared, 2);
    assert_eq!(resumed.updated, 0);
    assert_eq!(resumed.events_logged, 2);

    let events = inner.change_events(&scope).await;
    assert_eq!(events.iter().filter(|e| e.identifier == "SN1").count(), 1);
    assert_eq!(inner.canonical_items(&scope).await.len(), 3);
}

#[tokio::test]
async fn test_many_chunks_run_concurrently() {
    let h = Harness::with_config(ReconciliationConfig {
        batch_size: 3,
        write_batch_size: 2,
        max_concurrent_chunks: 4,
        ..test_config()
    });
    let identifiers: Vec<String> = (0..20).map(|i| format!("SN{i:03}")).collect();
    for identifier in &identifiers {
        h.put(new_record(SourceType::Returns, identifier)).await;
    }

    let summary = h.engine.run(&h.scope, &identifiers).await.unwrap();
    assert_eq!(summary.identifiers_processed, 20);
    assert_eq!(summary.chunks_committed, 7);
    assert_eq!(summary.appeared, 20);
    assert_eq!(h.events_of(ChangeKind::Appeared).await, 20);
}

#[tokio::test]
async fn test_runs_are_scope_isolated() {
    let h = Harness::new();
    let other = scope();
    h.put(new_record(SourceType::Inbound, "SN1")).await;
    h.store
        .put_source_record(new_record(SourceType::Inbound, "SN1").into_record(&other, Utc::now()))
        .await;

    h.engine.run(&h.scope, &ids(&["SN1"])).await.unwrap();

    assert_eq!(h.canonical().await.len(), 1);
    assert!(h.store.canonical_items(&other).await.is_empty());
    assert!(h.store.change_events(&other).await.is_empty());
}

#[tokio::test]
async fn test_ingest_then_reconcile() {
    let h = Harness::new();
    let ingestor = FeedIngestor::new(h.store.clone());

    let fg = ingestor
        .ingest(
            &h.scope,
            SourceType::FinishedGoods,
            &[json!({"Serial_Number": " sn-9 ", "Model": "R2", "Qty": "4", "category": "fg"})],
        )
        .await
        .unwrap();
    h.engine.run(&h.scope, &fg.touched).await.unwrap();

    let item = h.canonical().await.remove(0);
    assert_eq!(item.identifier, "SN-9");
    assert_eq!(item.bucket, Bucket::Fg);
    assert_eq!(item.quantity, Some(4));

    // Dropping the row from the feed removes the canonical item.
    let cleared = ingestor
        .ingest(&h.scope, SourceType::FinishedGoods, &[])
        .await
        .unwrap();
    assert_eq!(cleared.touched, vec!["SN-9".to_string()]);
    let summary = h.engine.run(&h.scope, &cleared.touched).await.unwrap();
    assert_eq!(summary.deleted, 1);
}
