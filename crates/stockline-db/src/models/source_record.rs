//! Source Record model.
//!
//! One feed's observation of one item at one point in time. Rows are written
//! by feed ingestion and only read by reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, Postgres, QueryBuilder};
use stockline_core::{InventoryScope, ScopeAware};
use uuid::Uuid;

/// Kind of upstream feed that produced a source record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Items staged for an outbound load.
    Staging,
    /// Fine-grained returns feed carrying per-unit status and message codes.
    ReturnsDetail,
    /// Salvage / as-is returns inventory.
    Returns,
    /// Finished goods on hand.
    FinishedGoods,
    /// Inbound receipts not yet put away.
    Inbound,
    /// Backhaul pickups in transit to the location.
    Backhaul,
}

impl SourceType {
    /// Every feed kind, in declaration order.
    pub const ALL: [SourceType; 6] = [
        SourceType::Staging,
        SourceType::ReturnsDetail,
        SourceType::Returns,
        SourceType::FinishedGoods,
        SourceType::Inbound,
        SourceType::Backhaul,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Staging => "staging",
            SourceType::ReturnsDetail => "returns_detail",
            SourceType::Returns => "returns",
            SourceType::FinishedGoods => "finished_goods",
            SourceType::Inbound => "inbound",
            SourceType::Backhaul => "backhaul",
        }
    }

    /// Short upper-case code used in synthetic identifiers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            SourceType::Staging => "STA",
            SourceType::ReturnsDetail => "RTD",
            SourceType::Returns => "RTN",
            SourceType::FinishedGoods => "FG",
            SourceType::Inbound => "INB",
            SourceType::Backhaul => "BKH",
        }
    }

    /// Prefix of identifiers synthesized for rows of this feed that carry no serial.
    #[must_use]
    pub fn synthetic_prefix(&self) -> &'static str {
        match self {
            SourceType::Staging => "STA-NOSN",
            SourceType::ReturnsDetail => "RTD-NOSN",
            SourceType::Returns => "RTN-NOSN",
            SourceType::FinishedGoods => "FG-NOSN",
            SourceType::Inbound => "INB-NOSN",
            SourceType::Backhaul => "BKH-NOSN",
        }
    }

    /// Find the feed kind owning a synthetic prefix.
    #[must_use]
    pub fn from_synthetic_prefix(prefix: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|source_type| source_type.synthetic_prefix() == prefix)
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "staging" => Ok(SourceType::Staging),
            "returns_detail" => Ok(SourceType::ReturnsDetail),
            "returns" => Ok(SourceType::Returns),
            "finished_goods" => Ok(SourceType::FinishedGoods),
            "inbound" => Ok(SourceType::Inbound),
            "backhaul" => Ok(SourceType::Backhaul),
            _ => Err(format!("Unknown source type: {s}")),
        }
    }
}

/// Coarse inventory category.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "varchar", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Bucket {
    /// As-is returns and salvage.
    Asis,
    /// Finished goods.
    Fg,
    /// Staged for an outbound load. Compatible with every other bucket.
    Sta,
    /// Inbound, not yet put away.
    Inb,
    /// Explicit "we could not tell" sentinel.
    Unknown,
}

impl Bucket {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Asis => "ASIS",
            Bucket::Fg => "FG",
            Bucket::Sta => "STA",
            Bucket::Inb => "INB",
            Bucket::Unknown => "UNKNOWN",
        }
    }

    /// Parse the free-text bucket label feeds send. Unrecognized text maps to
    /// [`Bucket::Unknown`] instead of failing the row.
    #[must_use]
    pub fn parse_lenient(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_uppercase();

        match normalized.as_str() {
            "ASIS" | "SALVAGE" | "RETURNS" => Bucket::Asis,
            "FG" | "FINISHED" | "FINISHEDGOODS" => Bucket::Fg,
            "STA" | "STAGED" | "STAGING" => Bucket::Sta,
            "INB" | "INBOUND" => Bucket::Inb,
            _ => Bucket::Unknown,
        }
    }

    /// Whether this bucket carries real information.
    #[must_use]
    pub fn is_known(&self) -> bool {
        *self != Bucket::Unknown
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Bucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ASIS" => Ok(Bucket::Asis),
            "FG" => Ok(Bucket::Fg),
            "STA" => Ok(Bucket::Sta),
            "INB" => Ok(Bucket::Inb),
            "UNKNOWN" => Ok(Bucket::Unknown),
            _ => Err(format!("Unknown bucket: {s}")),
        }
    }
}

/// A persisted source record.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub source_type: SourceType,
    /// Natural serial or synthetic stand-in.
    pub identifier: String,
    pub bucket: Option<Bucket>,
    pub state: Option<String>,
    pub model: Option<String>,
    pub quantity: Option<i32>,
    /// Load / route association.
    pub grouping_key: Option<String>,
    pub status_code: Option<String>,
    pub message_code: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Opaque snapshot of the feed row, kept for traceability.
    pub raw_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScopeAware for SourceRecord {
    fn scope(&self) -> InventoryScope {
        InventoryScope::from_uuids(self.tenant_id, self.location_id)
    }
}

/// A source record as produced by ingestion, before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSourceRecord {
    pub source_type: SourceType,
    pub identifier: String,
    pub bucket: Option<Bucket>,
    pub state: Option<String>,
    pub model: Option<String>,
    pub quantity: Option<i32>,
    pub grouping_key: Option<String>,
    pub status_code: Option<String>,
    pub message_code: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub raw_payload: serde_json::Value,
}

impl NewSourceRecord {
    /// Materialize into a persisted row shape (used by non-SQL stores).
    #[must_use]
    pub fn into_record(self, scope: &InventoryScope, now: DateTime<Utc>) -> SourceRecord {
        SourceRecord {
            id: Uuid::new_v4(),
            tenant_id: scope.tenant_uuid(),
            location_id: scope.location_uuid(),
            source_type: self.source_type,
            identifier: self.identifier,
            bucket: self.bucket,
            state: self.state,
            model: self.model,
            quantity: self.quantity,
            grouping_key: self.grouping_key,
            status_code: self.status_code,
            message_code: self.message_code,
            last_seen_at: self.last_seen_at,
            raw_payload: self.raw_payload,
            created_at: now,
            updated_at: now,
        }
    }
}

impl SourceRecord {
    /// Load every source row for the given identifiers within one scope.
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
            SELECT * FROM source_records
            WHERE tenant_id = $1 AND location_id = $2 AND identifier = ANY($3)
            ORDER BY identifier, source_type
            ",
        )
        .bind(tenant_id)
        .bind(location_id)
        .bind(identifiers)
        .fetch_all(executor)
        .await
    }

    /// Upsert a batch of feed rows keyed on (tenant, location, feed, identifier).
    ///
    /// `created_at` and `id` of existing rows are preserved.
    pub async fn upsert_batch<'e, E>(
        executor: E,
        tenant_id: Uuid,
        location_id: Uuid,
        records: &[NewSourceRecord],
    ) -> Result<u64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        if records.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            r"INSERT INTO source_records (
                id, tenant_id, location_id, source_type, identifier, bucket, state,
                model, quantity, grouping_key, status_code, message_code,
                last_seen_at, raw_payload, created_at, updated_at
            ) ",
        );
        qb.push_values(records, |mut row, record| {
            row.push_bind(Uuid::new_v4())
                .push_bind(tenant_id)
                .push_bind(location_id)
                .push_bind(record.source_type)
                .push_bind(&record.identifier)
                .push_bind(record.bucket)
                .push_bind(record.state.as_deref())
                .push_bind(record.model.as_deref())
                .push_bind(record.quantity)
                .push_bind(record.grouping_key.as_deref())
                .push_bind(record.status_code.as_deref())
                .push_bind(record.message_code.as_deref())
                .push_bind(record.last_seen_at)
                .push_bind(&record.raw_payload)
                .push("NOW()")
                .push("NOW()");
        });
        qb.push(
            r"
            ON CONFLICT (tenant_id, location_id, source_type, identifier) DO UPDATE SET
                bucket = EXCLUDED.bucket,
                state = EXCLUDED.state,
                model = EXCLUDED.model,
                quantity = EXCLUDED.quantity,
                grouping_key = EXCLUDED.grouping_key,
                status_code = EXCLUDED.status_code,
                message_code = EXCLUDED.message_code,
                last_seen_at = EXCLUDED.last_seen_at,
                raw_payload = EXCLUDED.raw_payload,
                updated_at = NOW()
            ",
        );

        Ok(qb.build().execute(executor).await?.rows_affected())
    }

    /// Delete one feed's rows in scope whose identifier is not in `keep`.
    ///
    /// Returns the identifiers that lost a source row.
    pub async fn delete_absent<'e, E>(
        executor: E,
        tenant_id: Uuid,
        location_id: Uuid,
        source_type: SourceType,
        keep: &[String],
    ) -> Result<Vec<String>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_scalar(
            r"
            DELETE FROM source_records
            WHERE tenant_id = $1 AND location_id = $2 AND source_type = $3
                AND NOT (identifier = ANY($4))
            RETURNING identifier
            ",
        )
        .bind(tenant_id)
        .bind(location_id)
        .bind(source_type)
        .bind(keep)
        .fetch_all(executor)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_roundtrip() {
        for source_type in SourceType::ALL {
            let parsed: SourceType = source_type.as_str().parse().unwrap();
            assert_eq!(parsed, source_type);
        }
        assert!("scanner".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_synthetic_prefixes_are_distinct() {
        let mut prefixes: Vec<_> = SourceType::ALL.iter().map(|s| s.synthetic_prefix()).collect();
        prefixes.sort_unstable();
        prefixes.dedup();
        assert_eq!(prefixes.len(), SourceType::ALL.len());

        assert_eq!(
            SourceType::from_synthetic_prefix("FG-NOSN"),
            Some(SourceType::FinishedGoods)
        );
        assert_eq!(SourceType::from_synthetic_prefix("FG"), None);
    }

    #[test]
    fn test_bucket_parse_lenient() {
        assert_eq!(Bucket::parse_lenient("ASIS"), Bucket::Asis);
        assert_eq!(Bucket::parse_lenient("as-is"), Bucket::Asis);
        assert_eq!(Bucket::parse_lenient(" fg "), Bucket::Fg);
        assert_eq!(Bucket::parse_lenient("Staged"), Bucket::Sta);
        assert_eq!(Bucket::parse_lenient("inbound"), Bucket::Inb);
        assert_eq!(Bucket::parse_lenient("???"), Bucket::Unknown);
        assert_eq!(Bucket::parse_lenient(""), Bucket::Unknown);
    }

    #[test]
    fn test_bucket_strict_parse_and_display() {
        assert_eq!("fg".parse::<Bucket>().unwrap(), Bucket::Fg);
        assert_eq!(Bucket::Asis.to_string(), "ASIS");
        assert!("as-is".parse::<Bucket>().is_err());
        assert!(!Bucket::Unknown.is_known());
        assert!(Bucket::Sta.is_known());
    }

    #[test]
    fn test_bucket_serde_uses_upper_case() {
        let json = serde_json::to_string(&Bucket::Asis).unwrap();
        assert_eq!(json, "\"ASIS\"");
        let json = serde_json::to_string(&SourceType::ReturnsDetail).unwrap();
        assert_eq!(json, "\"returns_detail\"");
    }

    #[test]
    fn test_into_record_carries_scope() {
        let scope = InventoryScope::from_uuids(Uuid::new_v4(), Uuid::new_v4());
        let record = NewSourceRecord {
            source_type: SourceType::Inbound,
            identifier: "SN1".to_string(),
            bucket: None,
            state: None,
            model: Some("X1".to_string()),
            quantity: Some(1),
            grouping_key: None,
            status_code: None,
            message_code: None,
            last_seen_at: None,
            raw_payload: serde_json::json!({}),
        }
        .into_record(&scope, Utc::now());

        assert!(record.belongs_to(&scope));
        assert_eq!(record.identifier, "SN1");
    }
}
