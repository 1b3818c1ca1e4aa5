//! Canonical resolution.
//!
//! [`resolve`] turns every source record sharing one identifier into a single
//! [`CanonicalView`]. It is a pure function of the record set: input order
//! never changes the result.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockline_db::{Bucket, SourceRecord, SourceType};
use uuid::Uuid;

use crate::identity::is_synthetic;
use crate::precedence::{
    bucket_by_presence, feed_rank, normalize_state, state_by_presence, STAGED_STATE, STATUS_SOURCE,
};

/// The reconciled view of one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalView {
    pub identifier: String,
    pub bucket: Bucket,
    pub state: Option<String>,
    /// Feed kind of the authoritative record.
    pub source_type: SourceType,
    /// Id of the authoritative record.
    pub source_id: Uuid,
    pub model: Option<String>,
    pub quantity: Option<i32>,
    pub grouping_key: Option<String>,
    pub status_code: Option<String>,
    pub message_code: Option<String>,
    pub is_synthetic: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Resolver output: the view plus the ordered candidate set it came from.
#[derive(Debug, Clone)]
pub struct Resolution<'a> {
    pub view: CanonicalView,
    /// Candidates in precedence order; the first one is authoritative.
    pub candidates: Vec<&'a SourceRecord>,
}

impl Resolution<'_> {
    #[must_use]
    pub fn authoritative(&self) -> &SourceRecord {
        self.candidates[0]
    }
}

/// Total order used to pick the authoritative record.
///
/// Feed priority first, then most recent `last_seen_at` (absent last), then
/// feed code, then record id.
#[must_use]
pub fn candidate_order(a: &SourceRecord, b: &SourceRecord) -> Ordering {
    feed_rank(a.source_type)
        .cmp(&feed_rank(b.source_type))
        .then_with(|| match (a.last_seen_at, b.last_seen_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.source_type.code().cmp(b.source_type.code()))
        .then_with(|| a.id.cmp(&b.id))
}

/// Staged records when any exist, otherwise all records, in precedence order.
#[must_use]
pub fn order_candidates(records: &[SourceRecord]) -> Vec<&SourceRecord> {
    let staged: Vec<&SourceRecord> = records
        .iter()
        .filter(|r| normalize_state(r.state.as_deref()) == STAGED_STATE)
        .collect();
    let mut candidates = if staged.is_empty() {
        records.iter().collect()
    } else {
        staged
    };
    candidates.sort_by(|a, b| candidate_order(a, b));
    candidates
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// First non-blank value across `ordered`.
fn first_text<'a, F>(ordered: impl IntoIterator<Item = &'a SourceRecord>, field: F) -> Option<String>
where
    F: Fn(&SourceRecord) -> Option<&String>,
{
    ordered.into_iter().find_map(|r| non_blank(field(r)))
}

/// Status-style field: the dedicated status feed's value when present,
/// otherwise the generic merge.
fn status_text<F>(
    status_row: Option<&SourceRecord>,
    candidates: &[&SourceRecord],
    field: F,
) -> Option<String>
where
    F: Fn(&SourceRecord) -> Option<&String>,
{
    status_row
        .and_then(|r| non_blank(field(r)))
        .or_else(|| first_text(candidates.iter().copied(), field))
}

/// Resolve one identifier's records. Returns `None` for an empty set.
#[must_use]
pub fn resolve(records: &[SourceRecord]) -> Option<Resolution<'_>> {
    let candidates = order_candidates(records);
    let authoritative = *candidates.first()?;

    let mut present: Vec<SourceType> = records.iter().map(|r| r.source_type).collect();
    present.sort_unstable();
    present.dedup();

    // Full record set in precedence order, for the bucket fallback.
    let mut all_ordered: Vec<&SourceRecord> = records.iter().collect();
    all_ordered.sort_by(|a, b| candidate_order(a, b));

    let bucket = bucket_by_presence(&present)
        .or_else(|| {
            all_ordered
                .iter()
                .filter_map(|r| r.bucket)
                .find(Bucket::is_known)
        })
        .unwrap_or(Bucket::Unknown);

    let state = state_by_presence(&present)
        .map(str::to_string)
        .or_else(|| non_blank(authoritative.state.as_ref()))
        .or_else(|| first_text(candidates.iter().copied(), |r| r.state.as_ref()));

    let status_row = candidates
        .iter()
        .copied()
        .find(|r| r.source_type == STATUS_SOURCE);

    let quantity = candidates.iter().find_map(|r| r.quantity);
    let last_seen_at = records.iter().filter_map(|r| r.last_seen_at).max();

    let view = CanonicalView {
        identifier: authoritative.identifier.clone(),
        bucket,
        state,
        source_type: authoritative.source_type,
        source_id: authoritative.id,
        model: first_text(candidates.iter().copied(), |r| r.model.as_ref()),
        quantity,
        grouping_key: first_text(candidates.iter().copied(), |r| r.grouping_key.as_ref()),
        status_code: status_text(status_row, &candidates, |r| r.status_code.as_ref()),
        message_code: status_text(status_row, &candidates, |r| r.message_code.as_ref()),
        is_synthetic: is_synthetic(&authoritative.identifier),
        last_seen_at,
    };

    Some(Resolution { view, candidates })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn record(source_type: SourceType, identifier: &str) -> SourceRecord {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        SourceRecord {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            location_id: Uuid::nil(),
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
            raw_payload: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    fn at(hour: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap())
    }

    #[test]
    fn test_empty_set_resolves_to_none() {
        assert!(resolve(&[]).is_none());
    }

    #[test]
    fn test_priority_picks_authoritative() {
        let mut fg = record(SourceType::FinishedGoods, "SN1");
        fg.model = Some("X1".into());
        fg.quantity = Some(2);
        let mut returns = record(SourceType::Returns, "SN1");
        returns.grouping_key = Some("L7".into());

        let records = vec![fg.clone(), returns.clone()];
        let resolution = resolve(&records).unwrap();

        assert_eq!(resolution.authoritative().id, returns.id);
        assert_eq!(resolution.view.source_type, SourceType::Returns);
        assert_eq!(resolution.view.bucket, Bucket::Asis);
        // Authoritative has no model or quantity; merged from the next row.
        assert_eq!(resolution.view.model.as_deref(), Some("X1"));
        assert_eq!(resolution.view.quantity, Some(2));
        assert_eq!(resolution.view.grouping_key.as_deref(), Some("L7"));
    }

    #[test]
    fn test_staged_rows_restrict_candidates() {
        let mut inbound = record(SourceType::Inbound, "SN1");
        inbound.state = Some(" STAGED ".into());
        let returns = record(SourceType::Returns, "SN1");

        let records = vec![returns, inbound.clone()];
        let resolution = resolve(&records).unwrap();

        assert_eq!(resolution.candidates.len(), 1);
        assert_eq!(resolution.authoritative().id, inbound.id);
        assert_eq!(resolution.view.state.as_deref(), Some("STAGED"));
        // Bucket presence looks at every record, not just candidates.
        assert_eq!(resolution.view.bucket, Bucket::Asis);
    }

    #[test]
    fn test_last_seen_breaks_priority_ties() {
        let mut older = record(SourceType::Inbound, "SN1");
        older.last_seen_at = at(1);
        let mut newer = record(SourceType::Inbound, "SN1");
        newer.last_seen_at = at(5);
        let unseen = record(SourceType::Inbound, "SN1");

        let records = vec![unseen.clone(), older.clone(), newer.clone()];
        let resolution = resolve(&records).unwrap();
        let order: Vec<Uuid> = resolution.candidates.iter().map(|r| r.id).collect();
        assert_eq!(order, vec![newer.id, older.id, unseen.id]);
    }

    #[test]
    fn test_full_ties_break_on_id() {
        let mut a = record(SourceType::Backhaul, "SN1");
        let mut b = record(SourceType::Backhaul, "SN1");
        a.id = Uuid::from_u128(2);
        b.id = Uuid::from_u128(1);

        for records in [vec![a.clone(), b.clone()], vec![b.clone(), a.clone()]] {
            let resolution = resolve(&records).unwrap();
            assert_eq!(resolution.authoritative().id, b.id);
        }
    }

    #[test]
    fn test_bucket_falls_back_to_explicit_then_unknown() {
        let mut backhaul = record(SourceType::Backhaul, "SN1");
        backhaul.bucket = Some(Bucket::Fg);
        let records = vec![backhaul];
        assert_eq!(resolve(&records).unwrap().view.bucket, Bucket::Fg);

        let mut backhaul = record(SourceType::Backhaul, "SN1");
        backhaul.bucket = Some(Bucket::Unknown);
        let records = vec![backhaul];
        assert_eq!(resolve(&records).unwrap().view.bucket, Bucket::Unknown);
    }

    #[test]
    fn test_state_fallbacks() {
        let mut returns = record(SourceType::Returns, "SN1");
        returns.state = Some("  ".into());
        let mut fg = record(SourceType::FinishedGoods, "SN1");
        fg.state = Some("available".into());

        let records = vec![returns, fg];
        let resolution = resolve(&records).unwrap();
        assert_eq!(resolution.view.state.as_deref(), Some("available"));
    }

    #[test]
    fn test_status_prefers_returns_detail() {
        let mut staging = record(SourceType::Staging, "SN1");
        staging.status_code = Some("S0".into());
        staging.message_code = Some("M0".into());
        let mut detail = record(SourceType::ReturnsDetail, "SN1");
        detail.status_code = Some("E4".into());

        let records = vec![staging.clone(), detail];
        let resolution = resolve(&records).unwrap();
        assert_eq!(resolution.authoritative().id, staging.id);
        assert_eq!(resolution.view.status_code.as_deref(), Some("E4"));
        // No message on the detail row: generic merge applies.
        assert_eq!(resolution.view.message_code.as_deref(), Some("M0"));
        assert_eq!(resolution.view.state.as_deref(), Some("staged"));
    }

    #[test]
    fn test_synthetic_flag_follows_identifier() {
        let records = vec![record(SourceType::Inbound, "INB-NOSN:X1:1")];
        assert!(resolve(&records).unwrap().view.is_synthetic);

        let records = vec![record(SourceType::Inbound, "SN1")];
        assert!(!resolve(&records).unwrap().view.is_synthetic);
    }

    #[test]
    fn test_resolution_is_order_independent() {
        let mut records = Vec::new();
        for (i, source_type) in SourceType::ALL.into_iter().enumerate() {
            let mut r = record(source_type, "SN1");
            r.model = Some(format!("M{i}"));
            r.bucket = Some(Bucket::Fg);
            r.last_seen_at = at(i as u32);
            records.push(r);
        }

        let expected = resolve(&records).unwrap().view;
        let last = records.len() - 1;
        for rotation in 1..records.len() {
            let mut permuted = records.clone();
            permuted.rotate_left(rotation);
            permuted.swap(0, last);
            assert_eq!(resolve(&permuted).unwrap().view, expected);
        }
    }
}
