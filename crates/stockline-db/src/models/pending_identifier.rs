//! Pending Identifier model.
//!
//! One row per identifier waiting to be reconciled. Enqueueing an identifier
//! that is already queued bumps its `version` and keeps its place in line;
//! completing only removes the versions that were actually reconciled, so a
//! change that lands while a run is in flight stays queued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};
use stockline_core::{InventoryScope, ScopeAware};
use uuid::Uuid;

/// A queued identifier.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct PendingIdentifier {
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub identifier: String,
    pub version: i64,
    pub enqueued_at: DateTime<Utc>,
}

impl ScopeAware for PendingIdentifier {
    fn scope(&self) -> InventoryScope {
        InventoryScope::from_uuids(self.tenant_id, self.location_id)
    }
}

impl PendingIdentifier {
    /// Queue identifiers within one scope. Duplicates in `identifiers` are
    /// collapsed.
    pub async fn enqueue_batch<'e, E>(
        executor: E,
        tenant_id: Uuid,
        location_id: Uuid,
        identifiers: &[String],
    ) -> Result<u64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        if identifiers.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r"
            INSERT INTO reconcile_queue (tenant_id, location_id, identifier, version, enqueued_at)
            SELECT DISTINCT $1, $2, t.identifier, 1, NOW()
            FROM UNNEST($3::text[]) AS t(identifier)
            ON CONFLICT (tenant_id, location_id, identifier) DO UPDATE SET
                version = reconcile_queue.version + 1
            ",
        )
        .bind(tenant_id)
        .bind(location_id)
        .bind(identifiers)
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }

    /// Oldest queued identifiers across all scopes.
    ///
    /// Ties on `enqueued_at` (one snapshot enqueues many rows with the same
    /// transaction timestamp) are ordered by scope and identifier, so paging
    /// never skips rows.
    pub async fn list_oldest<'e, E>(executor: E, limit: i64) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            SELECT * FROM reconcile_queue
            ORDER BY enqueued_at, tenant_id, location_id, identifier
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(executor)
        .await
    }

    /// Remove the given entries, but only at the version they were read at.
    pub async fn complete_batch<'e, E>(
        executor: E,
        tenant_id: Uuid,
        location_id: Uuid,
        entries: &[Self],
    ) -> Result<u64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        if entries.is_empty() {
            return Ok(0);
        }

        let identifiers: Vec<&str> = entries.iter().map(|e| e.identifier.as_str()).collect();
        let versions: Vec<i64> = entries.iter().map(|e| e.version).collect();

        let result = sqlx::query(
            r"
            DELETE FROM reconcile_queue q
            USING UNNEST($3::text[], $4::bigint[]) AS c(identifier, version)
            WHERE q.tenant_id = $1
                AND q.location_id = $2
                AND q.identifier = c.identifier
                AND q.version = c.version
            ",
        )
        .bind(tenant_id)
        .bind(location_id)
        .bind(identifiers)
        .bind(versions)
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }
}
