//! Run statistics tracking for reconciliation.
//!
//! Chunks report into a shared [`StatisticsTracker`]; the caller gets a
//! [`RunSummary`] snapshot at the end of the run, or attached to the error
//! when a write fails.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use stockline_core::RunId;
use stockline_db::ChangeKind;
use uuid::Uuid;

use crate::writer::WriteOutcome;

/// Summary of a reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Identifiers whose chunk was committed.
    #[serde(default)]
    pub identifiers_processed: u64,
    #[serde(default)]
    pub events_logged: u64,
    /// Canonical rows created.
    #[serde(default)]
    pub appeared: u64,
    /// Canonical rows rewritten in place.
    #[serde(default)]
    pub updated: u64,
    /// Canonical rows deleted.
    #[serde(default)]
    pub deleted: u64,
    /// Processed identifiers still under an open conflict group.
    #[serde(default)]
    pub conflicts_open: u64,
    #[serde(default)]
    pub conflicts_opened: u64,
    #[serde(default)]
    pub conflicts_closed: u64,
    /// Change events that could not be appended.
    #[serde(default)]
    pub audit_failures: u64,
    #[serde(default)]
    pub events_by_kind: HashMap<String, u64>,
    #[serde(default)]
    pub chunks_committed: u64,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl RunSummary {
    /// Get count for a specific event kind.
    #[must_use]
    pub fn event_count(&self, kind: ChangeKind) -> u64 {
        self.events_by_kind
            .get(kind.as_str())
            .copied()
            .unwrap_or(0)
    }

    /// Whether the run changed anything in the store.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.appeared + self.updated + self.deleted + self.events_logged > 0
            || self.conflicts_opened + self.conflicts_closed > 0
    }

    /// Fold another run's counts into this one. Keeps this run's id.
    pub fn merge(&mut self, other: &RunSummary) {
        self.identifiers_processed += other.identifiers_processed;
        self.events_logged += other.events_logged;
        self.appeared += other.appeared;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.conflicts_open += other.conflicts_open;
        self.conflicts_opened += other.conflicts_opened;
        self.conflicts_closed += other.conflicts_closed;
        self.audit_failures += other.audit_failures;
        self.chunks_committed += other.chunks_committed;
        self.cancelled |= other.cancelled;
        self.duration_ms += other.duration_ms;

        for (key, value) in &other.events_by_kind {
            *self.events_by_kind.entry(key.clone()).or_insert(0) += value;
        }
    }
}

/// Thread-safe tracker for accumulating statistics during a run.
pub struct StatisticsTracker {
    run_id: RunId,
    identifiers_processed: AtomicU64,
    events_logged: AtomicU64,
    appeared: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    conflicts_open: AtomicU64,
    conflicts_opened: AtomicU64,
    conflicts_closed: AtomicU64,
    audit_failures: AtomicU64,
    chunks_committed: AtomicU64,
    cancelled: AtomicBool,
    events_by_kind: RwLock<HashMap<ChangeKind, u64>>,
    start_time: Instant,
}

impl StatisticsTracker {
    /// Create a new tracker for a run.
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            identifiers_processed: AtomicU64::new(0),
            events_logged: AtomicU64::new(0),
            appeared: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            conflicts_open: AtomicU64::new(0),
            conflicts_opened: AtomicU64::new(0),
            conflicts_closed: AtomicU64::new(0),
            audit_failures: AtomicU64::new(0),
            chunks_committed: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            events_by_kind: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Record a committed chunk.
    pub fn record_chunk(&self, identifiers: u64, conflicts_open: u64, outcome: &WriteOutcome) {
        self.identifiers_processed
            .fetch_add(identifiers, Ordering::SeqCst);
        self.conflicts_open.fetch_add(conflicts_open, Ordering::SeqCst);
        self.chunks_committed.fetch_add(1, Ordering::SeqCst);
        self.record_writes(outcome);
    }

    /// Record the writes of a chunk that failed part way. The chunk itself
    /// does not count as committed.
    pub fn record_partial(&self, outcome: &WriteOutcome) {
        self.record_writes(outcome);
    }

    fn record_writes(&self, outcome: &WriteOutcome) {
        self.appeared.fetch_add(outcome.appeared, Ordering::SeqCst);
        self.updated.fetch_add(outcome.updated, Ordering::SeqCst);
        self.deleted.fetch_add(outcome.deleted, Ordering::SeqCst);
        self.conflicts_opened
            .fetch_add(outcome.conflicts_opened, Ordering::SeqCst);
        self.conflicts_closed
            .fetch_add(outcome.conflicts_closed, Ordering::SeqCst);
        self.events_logged
            .fetch_add(outcome.events_logged, Ordering::SeqCst);
        self.audit_failures
            .fetch_add(outcome.audit_failures, Ordering::SeqCst);

        if let Ok(mut map) = self.events_by_kind.write() {
            for (kind, count) in &outcome.events_by_kind {
                *map.entry(*kind).or_insert(0) += count;
            }
        }
    }

    /// Mark the run as cancelled.
    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Get elapsed duration in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Snapshot current statistics.
    pub fn snapshot(&self) -> RunSummary {
        let events_by_kind = self
            .events_by_kind
            .read()
            .map(|map| map.iter().map(|(k, v)| (k.to_string(), *v)).collect())
            .unwrap_or_default();

        RunSummary {
            run_id: self.run_id.into_uuid(),
            identifiers_processed: self.identifiers_processed.load(Ordering::SeqCst),
            events_logged: self.events_logged.load(Ordering::SeqCst),
            appeared: self.appeared.load(Ordering::SeqCst),
            updated: self.updated.load(Ordering::SeqCst),
            deleted: self.deleted.load(Ordering::SeqCst),
            conflicts_open: self.conflicts_open.load(Ordering::SeqCst),
            conflicts_opened: self.conflicts_opened.load(Ordering::SeqCst),
            conflicts_closed: self.conflicts_closed.load(Ordering::SeqCst),
            audit_failures: self.audit_failures.load(Ordering::SeqCst),
            events_by_kind,
            chunks_committed: self.chunks_committed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            duration_ms: self.elapsed_ms(),
        }
    }
}

impl Default for StatisticsTracker {
    fn default() -> Self {
        Self::new(RunId::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> WriteOutcome {
        let mut outcome = WriteOutcome {
            appeared: 2,
            updated: 1,
            events_logged: 3,
            ..WriteOutcome::default()
        };
        outcome.events_by_kind.insert(ChangeKind::Appeared, 2);
        outcome.events_by_kind.insert(ChangeKind::QuantityChanged, 1);
        outcome
    }

    #[test]
    fn test_run_summary_default() {
        let summary = RunSummary::default();
        assert_eq!(summary.identifiers_processed, 0);
        assert!(summary.events_by_kind.is_empty());
        assert!(!summary.cancelled);
        assert!(!summary.has_changes());
    }

    #[test]
    fn test_tracker_accumulates_chunks() {
        let run_id = RunId::new();
        let tracker = StatisticsTracker::new(run_id);

        tracker.record_chunk(10, 1, &outcome());
        tracker.record_chunk(5, 0, &outcome());

        let summary = tracker.snapshot();
        assert_eq!(summary.run_id, run_id.into_uuid());
        assert_eq!(summary.identifiers_processed, 15);
        assert_eq!(summary.conflicts_open, 1);
        assert_eq!(summary.appeared, 4);
        assert_eq!(summary.updated, 2);
        assert_eq!(summary.chunks_committed, 2);
        assert_eq!(summary.event_count(ChangeKind::Appeared), 4);
        assert_eq!(summary.event_count(ChangeKind::QuantityChanged), 2);
        assert_eq!(summary.event_count(ChangeKind::Disappeared), 0);
        assert!(summary.has_changes());
    }

    #[test]
    fn test_partial_writes_are_counted_without_committing() {
        let tracker = StatisticsTracker::default();
        tracker.record_chunk(10, 0, &outcome());
        tracker.record_partial(&WriteOutcome {
            appeared: 4,
            ..WriteOutcome::default()
        });

        let summary = tracker.snapshot();
        assert_eq!(summary.appeared, 6);
        assert_eq!(summary.identifiers_processed, 10);
        assert_eq!(summary.chunks_committed, 1);
    }

    #[test]
    fn test_tracker_cancelled_flag() {
        let tracker = StatisticsTracker::default();
        assert!(!tracker.snapshot().cancelled);

        tracker.mark_cancelled();
        assert!(tracker.is_cancelled());
        assert!(tracker.snapshot().cancelled);
    }

    #[test]
    #[allow(clippy::field_reassign_with_default)]
    fn test_run_summary_merge() {
        let mut first = RunSummary::default();
        first.identifiers_processed = 3;
        first.events_by_kind.insert("appeared".to_string(), 3);

        let mut second = RunSummary::default();
        second.identifiers_processed = 2;
        second.cancelled = true;
        second.events_by_kind.insert("appeared".to_string(), 1);
        second.events_by_kind.insert("bucket_changed".to_string(), 2);

        first.merge(&second);

        assert_eq!(first.identifiers_processed, 5);
        assert!(first.cancelled);
        assert_eq!(first.event_count(ChangeKind::Appeared), 4);
        assert_eq!(first.event_count(ChangeKind::BucketChanged), 2);
    }

    #[test]
    fn test_run_summary_serializes() {
        let summary = StatisticsTracker::default().snapshot();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["chunks_committed"], 0);
        assert_eq!(json["cancelled"], false);
    }
}
