//! Change Event model.
//!
//! Append-only audit log of observed differences. Ids are computed by the
//! caller so that re-appending the same event is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, QueryBuilder};
use stockline_core::{InventoryScope, ScopeAware};
use uuid::Uuid;

use super::source_record::SourceType;

/// Classification of a change event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Appeared,
    Disappeared,
    BucketChanged,
    StateChanged,
    SourceChanged,
    StatusChanged,
    QuantityChanged,
    GroupingChanged,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 8] = [
        ChangeKind::Appeared,
        ChangeKind::Disappeared,
        ChangeKind::BucketChanged,
        ChangeKind::StateChanged,
        ChangeKind::SourceChanged,
        ChangeKind::StatusChanged,
        ChangeKind::QuantityChanged,
        ChangeKind::GroupingChanged,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Appeared => "appeared",
            ChangeKind::Disappeared => "disappeared",
            ChangeKind::BucketChanged => "bucket_changed",
            ChangeKind::StateChanged => "state_changed",
            ChangeKind::SourceChanged => "source_changed",
            ChangeKind::StatusChanged => "status_changed",
            ChangeKind::QuantityChanged => "quantity_changed",
            ChangeKind::GroupingChanged => "grouping_changed",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChangeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown change kind: {s}"))
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub run_id: Uuid,
    pub identifier: String,
    pub kind: ChangeKind,
    /// Field name for field-level changes.
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub source_type: Option<SourceType>,
    pub source_id: Option<Uuid>,
    /// Canonical view at the time of an `appeared` event.
    pub snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ScopeAware for ChangeEvent {
    fn scope(&self) -> InventoryScope {
        InventoryScope::from_uuids(self.tenant_id, self.location_id)
    }
}

impl ChangeEvent {
    /// Append events, skipping ids that already exist.
    ///
    /// Returns the number of rows actually inserted.
    pub async fn append_batch<'e, E>(executor: E, events: &[Self]) -> Result<u64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        if events.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new(
            r"INSERT INTO change_events (
                id, tenant_id, location_id, run_id, identifier, kind, field,
                old_value, new_value, source_type, source_id, snapshot, created_at
            ) ",
        );
        qb.push_values(events, |mut row, event| {
            row.push_bind(event.id)
                .push_bind(event.tenant_id)
                .push_bind(event.location_id)
                .push_bind(event.run_id)
                .push_bind(event.identifier.clone())
                .push_bind(event.kind)
                .push_bind(event.field.clone())
                .push_bind(event.old_value.clone())
                .push_bind(event.new_value.clone())
                .push_bind(event.source_type)
                .push_bind(event.source_id)
                .push_bind(event.snapshot.clone())
                .push_bind(event.created_at);
        });
        qb.push(" ON CONFLICT (id) DO NOTHING");

        Ok(qb.build().execute(executor).await?.rows_affected())
    }

    /// History of one identifier, newest first.
    pub async fn list_for_identifier<'e, E>(
        executor: E,
        tenant_id: Uuid,
        location_id: Uuid,
        identifier: &str,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            SELECT * FROM change_events
            WHERE tenant_id = $1 AND location_id = $2 AND identifier = $3
            ORDER BY created_at DESC, kind
            LIMIT $4
            ",
        )
        .bind(tenant_id)
        .bind(location_id)
        .bind(identifier)
        .bind(limit)
        .fetch_all(executor)
        .await
    }
}
