//! Canonical Item model.
//!
//! The single reconciled truth for one identifier within a scope. A row
//! exists iff at least one source record references the identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, Postgres, QueryBuilder};
use stockline_core::{InventoryScope, ScopeAware};
use uuid::Uuid;

use super::source_record::{Bucket, SourceType};

const INSERT_COLUMNS: &str = r"INSERT INTO canonical_items (
    id, tenant_id, location_id, identifier, bucket, state, source_type, source_id,
    model, quantity, grouping_key, status_code, message_code, is_synthetic,
    last_seen_at, created_at, updated_at
) ";

const UPDATE_SET: &str = r"
    bucket = EXCLUDED.bucket,
    state = EXCLUDED.state,
    source_type = EXCLUDED.source_type,
    source_id = EXCLUDED.source_id,
    model = EXCLUDED.model,
    quantity = EXCLUDED.quantity,
    grouping_key = EXCLUDED.grouping_key,
    status_code = EXCLUDED.status_code,
    message_code = EXCLUDED.message_code,
    is_synthetic = EXCLUDED.is_synthetic,
    last_seen_at = EXCLUDED.last_seen_at,
    updated_at = NOW()
";

/// A persisted canonical item.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct CanonicalItem {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub identifier: String,
    pub bucket: Bucket,
    pub state: Option<String>,
    /// Feed kind of the authoritative source record.
    pub source_type: SourceType,
    /// Id of the authoritative source record.
    pub source_id: Uuid,
    pub model: Option<String>,
    pub quantity: Option<i32>,
    pub grouping_key: Option<String>,
    pub status_code: Option<String>,
    pub message_code: Option<String>,
    pub is_synthetic: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScopeAware for CanonicalItem {
    fn scope(&self) -> InventoryScope {
        InventoryScope::from_uuids(self.tenant_id, self.location_id)
    }
}

impl CanonicalItem {
    /// Load every canonical row (including leftover duplicates) for the given
    /// identifiers within one scope.
    pub async fn list_for_identifiers<'e, E>(
        executor: E,
        tenant_id: Uuid,
        location_id: Uuid,
        identifiers: &[String],
    ) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            SELECT * FROM canonical_items
            WHERE tenant_id = $1 AND location_id = $2 AND identifier = ANY($3)
            ORDER BY identifier, updated_at DESC
            ",
        )
        .bind(tenant_id)
        .bind(location_id)
        .bind(identifiers)
        .fetch_all(executor)
        .await
    }

    fn push_rows(qb: &mut QueryBuilder<'_, Postgres>, items: &[Self]) {
        qb.push_values(items, |mut row, item| {
            row.push_bind(item.id)
                .push_bind(item.tenant_id)
                .push_bind(item.location_id)
                .push_bind(item.identifier.clone())
                .push_bind(item.bucket)
                .push_bind(item.state.clone())
                .push_bind(item.source_type)
                .push_bind(item.source_id)
                .push_bind(item.model.clone())
                .push_bind(item.quantity)
                .push_bind(item.grouping_key.clone())
                .push_bind(item.status_code.clone())
                .push_bind(item.message_code.clone())
                .push_bind(item.is_synthetic)
                .push_bind(item.last_seen_at)
                .push("NOW()")
                .push("NOW()");
        });
    }

    /// Upsert rows whose id is already known.
    pub async fn upsert_by_id_batch<'e, E>(executor: E, items: &[Self]) -> Result<u64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        if items.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new(INSERT_COLUMNS);
        Self::push_rows(&mut qb, items);
        qb.push(" ON CONFLICT (id) DO UPDATE SET ");
        qb.push(UPDATE_SET);

        Ok(qb.build().execute(executor).await?.rows_affected())
    }

    /// Upsert rows on the natural key (tenant, location, identifier, bucket).
    ///
    /// The supplied id is used only when a new row is created.
    pub async fn upsert_by_natural_key_batch<'e, E>(
        executor: E,
        items: &[Self],
    ) -> Result<u64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        if items.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new(INSERT_COLUMNS);
        Self::push_rows(&mut qb, items);
        qb.push(" ON CONFLICT ON CONSTRAINT canonical_items_natural_key DO UPDATE SET ");
        qb.push(UPDATE_SET);

        Ok(qb.build().execute(executor).await?.rows_affected())
    }

    /// Plain insert, no upsert semantics.
    pub async fn insert_batch<'e, E>(executor: E, items: &[Self]) -> Result<u64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        if items.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new(INSERT_COLUMNS);
        Self::push_rows(&mut qb, items);

        Ok(qb.build().execute(executor).await?.rows_affected())
    }

    /// Delete rows by id within one scope.
    pub async fn delete_by_ids<'e, E>(
        executor: E,
        tenant_id: Uuid,
        location_id: Uuid,
        ids: &[Uuid],
    ) -> Result<u64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r"
            DELETE FROM canonical_items
            WHERE tenant_id = $1 AND location_id = $2 AND id = ANY($3)
            ",
        )
        .bind(tenant_id)
        .bind(location_id)
        .bind(ids)
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(bucket: Bucket) -> CanonicalItem {
        let now = Utc::now();
        CanonicalItem {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            location_id: Uuid::new_v4(),
            identifier: "SN1".to_string(),
            bucket,
            state: Some("staged".to_string()),
            source_type: SourceType::Staging,
            source_id: Uuid::new_v4(),
            model: Some("X1".to_string()),
            quantity: Some(1),
            grouping_key: None,
            status_code: None,
            message_code: None,
            is_synthetic: false,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_scope_of_item() {
        let item = item(Bucket::Fg);
        let scope = InventoryScope::from_uuids(item.tenant_id, item.location_id);
        assert!(item.belongs_to(&scope));
    }

    #[test]
    fn test_serializes_enums_as_labels() {
        let json = serde_json::to_value(item(Bucket::Asis)).unwrap();
        assert_eq!(json["bucket"], "ASIS");
        assert_eq!(json["source_type"], "staging");
        assert_eq!(json["is_synthetic"], false);
    }
}
