//! Conflict detection.
//!
//! An identifier is in conflict when its candidate records disagree on the
//! normalized model or on a non-staging bucket. [`plan_conflict`] turns the
//! assessment and the currently open group (if any) into the single write the
//! identifier needs.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use stockline_core::InventoryScope;
use stockline_db::{
    Bucket, ConflictGroup, ConflictReason, ConflictSourceSummary, ConflictStatus, SourceRecord,
};
use uuid::Uuid;

use crate::config::ConflictClosePolicy;

/// Why and how an identifier is in conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictAssessment {
    pub reasons: Vec<ConflictReason>,
    /// One entry per candidate, in resolver order.
    pub sources: Vec<ConflictSourceSummary>,
}

/// The conflict write one identifier needs.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictPlan {
    /// Nothing to write.
    None,
    /// Insert a new open group.
    Open(ConflictGroup),
    /// Replace the snapshot of the existing open group.
    Refresh(ConflictGroup),
    /// Resolve the open group for this identifier.
    Close(String),
    /// Divergence is gone but the policy keeps the group open.
    KeepOpen,
}

impl ConflictPlan {
    /// Whether the identifier has an open group after this plan is applied.
    #[must_use]
    pub fn leaves_open(&self, had_open: bool) -> bool {
        match self {
            ConflictPlan::Open(_) | ConflictPlan::Refresh(_) | ConflictPlan::KeepOpen => true,
            ConflictPlan::Close(_) => false,
            ConflictPlan::None => had_open,
        }
    }
}

/// Uppercase alphanumeric model used for comparison.
fn normalize_model(model: Option<&str>) -> Option<String> {
    let normalized: String = model
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    (!normalized.is_empty()).then_some(normalized)
}

/// Buckets that take part in the mismatch check.
fn comparable_bucket(bucket: Option<Bucket>) -> Option<Bucket> {
    bucket.filter(|b| !matches!(b, Bucket::Sta | Bucket::Unknown))
}

fn summarize(record: &SourceRecord) -> ConflictSourceSummary {
    ConflictSourceSummary {
        source_type: record.source_type,
        bucket: record.bucket,
        state: record.state.clone(),
        identifier: record.identifier.clone(),
        model: record.model.clone(),
        quantity: record.quantity,
        grouping_key: record.grouping_key.clone(),
        last_seen_at: record.last_seen_at,
    }
}

/// Assess the resolver's ordered candidates. `None` means no conflict.
#[must_use]
pub fn detect_conflict(candidates: &[&SourceRecord]) -> Option<ConflictAssessment> {
    if candidates.len() < 2 {
        return None;
    }

    let models: BTreeSet<String> = candidates
        .iter()
        .filter_map(|r| normalize_model(r.model.as_deref()))
        .collect();
    let buckets: BTreeSet<Bucket> = candidates
        .iter()
        .filter_map(|r| comparable_bucket(r.bucket))
        .collect();

    let mut reasons = Vec::new();
    if models.len() > 1 {
        reasons.push(ConflictReason::ModelMismatch);
    }
    if buckets.len() > 1 {
        reasons.push(ConflictReason::BucketMismatch);
    }
    if reasons.is_empty() {
        return None;
    }

    Some(ConflictAssessment {
        reasons,
        sources: candidates.iter().map(|r| summarize(r)).collect(),
    })
}

/// Decide the conflict write for one identifier.
#[must_use]
pub fn plan_conflict(
    scope: &InventoryScope,
    identifier: &str,
    assessment: Option<ConflictAssessment>,
    existing: Option<&ConflictGroup>,
    policy: ConflictClosePolicy,
    now: DateTime<Utc>,
) -> ConflictPlan {
    match (assessment, existing) {
        (None, None) => ConflictPlan::None,
        (None, Some(_)) => match policy {
            ConflictClosePolicy::AutoClose => ConflictPlan::Close(identifier.to_string()),
            ConflictClosePolicy::Manual => ConflictPlan::KeepOpen,
        },
        (Some(assessment), Some(group)) => {
            if group.sources.0 == assessment.sources && group.reasons.0 == assessment.reasons {
                return ConflictPlan::None;
            }
            let mut refreshed = group.clone();
            refreshed.sources = Json(assessment.sources);
            refreshed.reasons = Json(assessment.reasons);
            refreshed.updated_at = now;
            ConflictPlan::Refresh(refreshed)
        }
        (Some(assessment), None) => ConflictPlan::Open(ConflictGroup {
            id: Uuid::new_v4(),
            tenant_id: scope.tenant_uuid(),
            location_id: scope.location_uuid(),
            identifier: identifier.to_string(),
            status: ConflictStatus::Open,
            sources: Json(assessment.sources),
            reasons: Json(assessment.reasons),
            detected_at: now,
            updated_at: now,
            resolved_at: None,
            resolution_note: None,
        }),
    }
}
