//! Change detection between a freshly resolved view and persisted state.
//!
//! [`diff_identifier`] emits the minimal set of change events explaining the
//! transition and the canonical writes that bring the store in line. Feeding
//! its own output back in as the prior state yields an empty outcome.

use chrono::{DateTime, Utc};
use stockline_core::InventoryScope;
use stockline_db::{CanonicalItem, ChangeKind, SourceType};
use uuid::Uuid;

use crate::resolver::CanonicalView;
use crate::store::WriteMode;

/// A change event before it is stamped with a run id and event id.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEvent {
    pub identifier: String,
    pub kind: ChangeKind,
    pub field: Option<&'static str>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub source_type: Option<SourceType>,
    pub source_id: Option<Uuid>,
    pub snapshot: Option<serde_json::Value>,
}

/// One canonical row to persist and how to key it.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalWrite {
    pub mode: WriteMode,
    pub item: CanonicalItem,
}

/// Everything one identifier needs written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffOutcome {
    pub events: Vec<PlannedEvent>,
    pub write: Option<CanonicalWrite>,
    /// Canonical rows to delete by id, after `write` is applied.
    pub deletes: Vec<Uuid>,
}

impl DiffOutcome {
    /// Whether the identifier needs no writes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.write.is_none() && self.deletes.is_empty()
    }
}

fn text(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// The prior row kept for an identifier: same bucket as the new view if one
/// exists, otherwise the most recently updated.
fn retained<'a>(prior: &'a [CanonicalItem], view: &CanonicalView) -> Option<&'a CanonicalItem> {
    prior.iter().find(|item| item.bucket == view.bucket).or_else(|| {
        prior
            .iter()
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| b.id.cmp(&a.id)))
    })
}

fn build_item(
    scope: &InventoryScope,
    view: &CanonicalView,
    id: Uuid,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> CanonicalItem {
    CanonicalItem {
        id,
        tenant_id: scope.tenant_uuid(),
        location_id: scope.location_uuid(),
        identifier: view.identifier.clone(),
        bucket: view.bucket,
        state: view.state.clone(),
        source_type: view.source_type,
        source_id: view.source_id,
        model: view.model.clone(),
        quantity: view.quantity,
        grouping_key: view.grouping_key.clone(),
        status_code: view.status_code.clone(),
        message_code: view.message_code.clone(),
        is_synthetic: view.is_synthetic,
        last_seen_at: view.last_seen_at,
        created_at,
        updated_at: now,
    }
}

/// Field-level events between a retained prior row and the new view.
fn field_events(prior: &CanonicalItem, view: &CanonicalView) -> Vec<PlannedEvent> {
    let compared: [(ChangeKind, &'static str, String, String); 7] = [
        (
            ChangeKind::BucketChanged,
            "bucket",
            prior.bucket.as_str().to_string(),
            view.bucket.as_str().to_string(),
        ),
        (
            ChangeKind::StateChanged,
            "state",
            text(prior.state.as_deref()),
            text(view.state.as_deref()),
        ),
        (
            ChangeKind::SourceChanged,
            "source_type",
            prior.source_type.as_str().to_string(),
            view.source_type.as_str().to_string(),
        ),
        (
            ChangeKind::StatusChanged,
            "status_code",
            text(prior.status_code.as_deref()),
            text(view.status_code.as_deref()),
        ),
        (
            ChangeKind::StatusChanged,
            "message_code",
            text(prior.message_code.as_deref()),
            text(view.message_code.as_deref()),
        ),
        (
            ChangeKind::QuantityChanged,
            "quantity",
            prior.quantity.map(|q| q.to_string()).unwrap_or_default(),
            view.quantity.map(|q| q.to_string()).unwrap_or_default(),
        ),
        (
            ChangeKind::GroupingChanged,
            "grouping_key",
            text(prior.grouping_key.as_deref()),
            text(view.grouping_key.as_deref()),
        ),
    ];

    compared
        .into_iter()
        .filter(|(_, _, old, new)| old != new)
        .map(|(kind, field, old, new)| PlannedEvent {
            identifier: view.identifier.clone(),
            kind,
            field: Some(field),
            old_value: non_empty(old),
            new_value: non_empty(new),
            source_type: Some(view.source_type),
            source_id: Some(view.source_id),
            snapshot: None,
        })
        .collect()
}

/// Fields refreshed on the stored row without an audit event.
fn refresh_needed(prior: &CanonicalItem, view: &CanonicalView) -> bool {
    prior.model != view.model
        || prior.source_id != view.source_id
        || prior.last_seen_at != view.last_seen_at
        || prior.is_synthetic != view.is_synthetic
}

/// Diff one identifier.
///
/// `prior` holds every persisted canonical row for the identifier; more than
/// one means leftover duplicates, which are deleted once the retained row is
/// written.
#[must_use]
pub fn diff_identifier(
    scope: &InventoryScope,
    identifier: &str,
    view: Option<&CanonicalView>,
    prior: &[CanonicalItem],
    now: DateTime<Utc>,
) -> DiffOutcome {
    let Some(view) = view else {
        return DiffOutcome {
            events: prior
                .iter()
                .map(|item| PlannedEvent {
                    identifier: identifier.to_string(),
                    kind: ChangeKind::Disappeared,
                    field: None,
                    old_value: Some(item.bucket.as_str().to_string()),
                    new_value: None,
                    source_type: Some(item.source_type),
                    source_id: Some(item.source_id),
                    snapshot: None,
                })
                .collect(),
            write: None,
            deletes: prior.iter().map(|item| item.id).collect(),
        };
    };

    let Some(kept) = retained(prior, view) else {
        let mode = if view.identifier.trim().is_empty() {
            WriteMode::Direct
        } else {
            WriteMode::ByNaturalKey
        };
        return DiffOutcome {
            events: vec![PlannedEvent {
                identifier: identifier.to_string(),
                kind: ChangeKind::Appeared,
                field: None,
                old_value: None,
                new_value: Some(view.bucket.as_str().to_string()),
                source_type: Some(view.source_type),
                source_id: Some(view.source_id),
                snapshot: serde_json::to_value(view).ok(),
            }],
            write: Some(CanonicalWrite {
                mode,
                item: build_item(scope, view, Uuid::new_v4(), now, now),
            }),
            deletes: Vec::new(),
        };
    };

    let events = field_events(kept, view);
    let write = (!events.is_empty() || refresh_needed(kept, view)).then(|| CanonicalWrite {
        mode: WriteMode::ById,
        item: build_item(scope, view, kept.id, kept.created_at, now),
    });
    let deletes = prior
        .iter()
        .filter(|item| item.id != kept.id)
        .map(|item| item.id)
        .collect();

    DiffOutcome {
        events,
        write,
        deletes,
    }
}
