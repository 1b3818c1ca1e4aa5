//! Postgres-backed store.

use async_trait::async_trait;
use sqlx::PgPool;
use stockline_core::InventoryScope;
use stockline_db::{
    CanonicalItem, ChangeEvent, ConflictGroup, DbPool, NewSourceRecord, PendingIdentifier,
    SourceRecord, SourceType,
};
use tracing::instrument;
use uuid::Uuid;

use super::{ReconciliationStore, StoreResult, WriteMode};

/// Source rows per statement when replacing a feed snapshot.
const SNAPSHOT_CHUNK: usize = 500;

/// [`ReconciliationStore`] over the `stockline-db` models.
#[derive(Debug, Clone)]
pub struct PgReconciliationStore {
    pool: PgPool,
}

impl PgReconciliationStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn from_db_pool(pool: &DbPool) -> Self {
        Self::new(pool.inner().clone())
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ReconciliationStore for PgReconciliationStore {
    #[instrument(skip(self, identifiers), fields(scope = %scope, count = identifiers.len()))]
    async fn load_source_records(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<SourceRecord>> {
        Ok(SourceRecord::list_for_identifiers(
            &self.pool,
            scope.tenant_uuid(),
            scope.location_uuid(),
            identifiers,
        )
        .await?)
    }

    #[instrument(skip(self, identifiers), fields(scope = %scope, count = identifiers.len()))]
    async fn load_canonical_items(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<CanonicalItem>> {
        Ok(CanonicalItem::list_for_identifiers(
            &self.pool,
            scope.tenant_uuid(),
            scope.location_uuid(),
            identifiers,
        )
        .await?)
    }

    #[instrument(skip(self, identifiers), fields(scope = %scope, count = identifiers.len()))]
    async fn load_open_conflicts(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
    ) -> StoreResult<Vec<ConflictGroup>> {
        Ok(ConflictGroup::list_open_for_identifiers(
            &self.pool,
            scope.tenant_uuid(),
            scope.location_uuid(),
            identifiers,
        )
        .await?)
    }

    #[instrument(skip(self, items), fields(mode = %mode, count = items.len()))]
    async fn upsert_canonical_items(
        &self,
        mode: WriteMode,
        items: &[CanonicalItem],
    ) -> StoreResult<u64> {
        let affected = match mode {
            WriteMode::ById => CanonicalItem::upsert_by_id_batch(&self.pool, items).await?,
            WriteMode::ByNaturalKey => {
                CanonicalItem::upsert_by_natural_key_batch(&self.pool, items).await?
            }
            WriteMode::Direct => CanonicalItem::insert_batch(&self.pool, items).await?,
        };
        Ok(affected)
    }

    #[instrument(skip(self, ids), fields(scope = %scope, count = ids.len()))]
    async fn delete_canonical_items(
        &self,
        scope: &InventoryScope,
        ids: &[Uuid],
    ) -> StoreResult<u64> {
        Ok(CanonicalItem::delete_by_ids(
            &self.pool,
            scope.tenant_uuid(),
            scope.location_uuid(),
            ids,
        )
        .await?)
    }

    #[instrument(skip(self, groups), fields(count = groups.len()))]
    async fn insert_conflict_groups(&self, groups: &[ConflictGroup]) -> StoreResult<u64> {
        Ok(ConflictGroup::insert_open_batch(&self.pool, groups).await?)
    }

    #[instrument(skip(self, groups), fields(count = groups.len()))]
    async fn refresh_conflict_groups(&self, groups: &[ConflictGroup]) -> StoreResult<u64> {
        Ok(ConflictGroup::update_by_id_batch(&self.pool, groups).await?)
    }

    #[instrument(skip(self, identifiers), fields(scope = %scope, count = identifiers.len()))]
    async fn resolve_conflict_groups(
        &self,
        scope: &InventoryScope,
        identifiers: &[String],
        note: &str,
    ) -> StoreResult<u64> {
        Ok(ConflictGroup::resolve_open(
            &self.pool,
            scope.tenant_uuid(),
            scope.location_uuid(),
            identifiers,
            note,
        )
        .await?)
    }

    #[instrument(skip(self), fields(scope = %scope))]
    async fn resolve_conflict(
        &self,
        scope: &InventoryScope,
        conflict_id: Uuid,
        note: &str,
    ) -> StoreResult<Option<ConflictGroup>> {
        Ok(ConflictGroup::resolve_by_id(
            &self.pool,
            scope.tenant_uuid(),
            scope.location_uuid(),
            conflict_id,
            note,
        )
        .await?)
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_change_events(&self, events: &[ChangeEvent]) -> StoreResult<u64> {
        Ok(ChangeEvent::append_batch(&self.pool, events).await?)
    }

    #[instrument(skip(self, records), fields(scope = %scope, source_type = %source_type, count = records.len()))]
    async fn replace_feed_snapshot(
        &self,
        scope: &InventoryScope,
        source_type: SourceType,
        records: &[NewSourceRecord],
    ) -> StoreResult<Vec<String>> {
        let tenant_id = scope.tenant_uuid();
        let location_id = scope.location_uuid();
        let keep: Vec<String> = records.iter().map(|r| r.identifier.clone()).collect();

        let mut tx = self.pool.begin().await?;

        for chunk in records.chunks(SNAPSHOT_CHUNK) {
            SourceRecord::upsert_batch(&mut *tx, tenant_id, location_id, chunk).await?;
        }
        let removed =
            SourceRecord::delete_absent(&mut *tx, tenant_id, location_id, source_type, &keep)
                .await?;
        let removed_count = removed.len();

        let mut touched = keep;
        touched.extend(removed);
        touched.sort_unstable();
        touched.dedup();

        for chunk in touched.chunks(SNAPSHOT_CHUNK) {
            PendingIdentifier::enqueue_batch(&mut *tx, tenant_id, location_id, chunk).await?;
        }

        tx.commit().await?;

        tracing::info!(
            scope = %scope,
            source_type = %source_type,
            upserted = records.len(),
            removed = removed_count,
            queued = touched.len(),
            "Replaced feed snapshot"
        );

        Ok(touched)
    }

    #[instrument(skip(self))]
    async fn pending_identifiers(&self, limit: i64) -> StoreResult<Vec<PendingIdentifier>> {
        Ok(PendingIdentifier::list_oldest(&self.pool, limit).await?)
    }

    #[instrument(skip(self, entries), fields(scope = %scope, count = entries.len()))]
    async fn complete_pending(
        &self,
        scope: &InventoryScope,
        entries: &[PendingIdentifier],
    ) -> StoreResult<u64> {
        Ok(PendingIdentifier::complete_batch(
            &self.pool,
            scope.tenant_uuid(),
            scope.location_uuid(),
            entries,
        )
        .await?)
    }
}
