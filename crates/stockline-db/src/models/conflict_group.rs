//! Conflict Group model.
//!
//! A flagged identifier where feeds disagree on model or bucket. At most one
//! group per identifier is open at a time (partial unique index).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgExecutor, QueryBuilder};
use stockline_core::{InventoryScope, ScopeAware};
use uuid::Uuid;

use super::source_record::{Bucket, SourceType};

/// Lifecycle of a conflict group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
}

impl ConflictStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Open => "open",
            ConflictStatus::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConflictStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(ConflictStatus::Open),
            "resolved" => Ok(ConflictStatus::Resolved),
            _ => Err(format!("Unknown conflict status: {s}")),
        }
    }
}

/// Why an identifier was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Feeds report more than one distinct normalized model.
    ModelMismatch,
    /// Feeds report more than one distinct non-staging bucket.
    BucketMismatch,
}

impl ConflictReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::ModelMismatch => "model_mismatch",
            ConflictReason::BucketMismatch => "bucket_mismatch",
        }
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One candidate's view of the identifier, as captured in a conflict snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSourceSummary {
    pub source_type: SourceType,
    pub bucket: Option<Bucket>,
    pub state: Option<String>,
    pub identifier: String,
    pub model: Option<String>,
    pub quantity: Option<i32>,
    pub grouping_key: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// A persisted conflict group.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ConflictGroup {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub identifier: String,
    pub status: ConflictStatus,
    /// Ordered snapshot, one entry per candidate in resolution order.
    pub sources: Json<Vec<ConflictSourceSummary>>,
    pub reasons: Json<Vec<ConflictReason>>,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

impl ScopeAware for ConflictGroup {
    fn scope(&self) -> InventoryScope {
        InventoryScope::from_uuids(self.tenant_id, self.location_id)
    }
}

impl ConflictGroup {
    /// Whether the group is still awaiting resolution.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == ConflictStatus::Open
    }

    /// Open groups for the given identifiers within one scope.
    pub async fn list_open_for_identifiers<'e, E>(
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
            SELECT * FROM conflict_groups
            WHERE tenant_id = $1 AND location_id = $2 AND identifier = ANY($3)
                AND status = 'open'
            ORDER BY identifier
            ",
        )
        .bind(tenant_id)
        .bind(location_id)
        .bind(identifiers)
        .fetch_all(executor)
        .await
    }

    /// Insert new open groups keyed on the open-identifier partial index.
    ///
    /// If a concurrent run already opened a group for the identifier, its
    /// snapshot is refreshed instead.
    pub async fn insert_open_batch<'e, E>(executor: E, groups: &[Self]) -> Result<u64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        if groups.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new(
            r"INSERT INTO conflict_groups (
                id, tenant_id, location_id, identifier, status, sources, reasons,
                detected_at, updated_at
            ) ",
        );
        qb.push_values(groups, |mut row, group| {
            row.push_bind(group.id)
                .push_bind(group.tenant_id)
                .push_bind(group.location_id)
                .push_bind(group.identifier.clone())
                .push_bind(ConflictStatus::Open)
                .push_bind(group.sources.clone())
                .push_bind(group.reasons.clone())
                .push_bind(group.detected_at)
                .push("NOW()");
        });
        qb.push(
            r"
            ON CONFLICT (tenant_id, location_id, identifier) WHERE status = 'open'
            DO UPDATE SET
                sources = EXCLUDED.sources,
                reasons = EXCLUDED.reasons,
                updated_at = NOW()
            ",
        );

        Ok(qb.build().execute(executor).await?.rows_affected())
    }

    /// Refresh the snapshot of groups that are known to be open, by id.
    pub async fn update_by_id_batch<'e, E>(executor: E, groups: &[Self]) -> Result<u64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        if groups.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new(
            r"UPDATE conflict_groups AS g SET
                sources = v.sources,
                reasons = v.reasons,
                updated_at = NOW()
            FROM (",
        );
        qb.push_values(groups, |mut row, group| {
            row.push_bind(group.id)
                .push_bind(group.sources.clone())
                .push_bind(group.reasons.clone());
        });
        qb.push(
            r") AS v(id, sources, reasons)
            WHERE g.id = v.id AND g.status = 'open'",
        );

        Ok(qb.build().execute(executor).await?.rows_affected())
    }

    /// Resolve every open group for the given identifiers.
    pub async fn resolve_open<'e, E>(
        executor: E,
        tenant_id: Uuid,
        location_id: Uuid,
        identifiers: &[String],
        note: &str,
    ) -> Result<u64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        if identifiers.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r"
            UPDATE conflict_groups
            SET status = 'resolved', resolved_at = NOW(), updated_at = NOW(),
                resolution_note = $4
            WHERE tenant_id = $1 AND location_id = $2 AND identifier = ANY($3)
                AND status = 'open'
            ",
        )
        .bind(tenant_id)
        .bind(location_id)
        .bind(identifiers)
        .bind(note)
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }

    /// Resolve one group by id (operator action).
    pub async fn resolve_by_id<'e, E>(
        executor: E,
        tenant_id: Uuid,
        location_id: Uuid,
        id: Uuid,
        note: &str,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            UPDATE conflict_groups
            SET status = 'resolved', resolved_at = NOW(), updated_at = NOW(),
                resolution_note = $4
            WHERE tenant_id = $1 AND location_id = $2 AND id = $3 AND status = 'open'
            RETURNING *
            ",
        )
        .bind(tenant_id)
        .bind(location_id)
        .bind(id)
        .bind(note)
        .fetch_optional(executor)
        .await
    }
}
