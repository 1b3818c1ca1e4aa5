//! Declarative precedence tables used by the resolver.

use stockline_db::{Bucket, SourceType};

/// State label that makes a source record outrank unstaged ones.
pub const STAGED_STATE: &str = "staged";

/// Feed priority, highest first.
pub const FEED_PRIORITY: [SourceType; 6] = [
    SourceType::Staging,
    SourceType::ReturnsDetail,
    SourceType::Returns,
    SourceType::FinishedGoods,
    SourceType::Inbound,
    SourceType::Backhaul,
];

/// Bucket forced by the presence of a feed kind, first match wins.
pub const BUCKET_BY_PRESENCE: [(SourceType, Bucket); 5] = [
    (SourceType::Returns, Bucket::Asis),
    (SourceType::ReturnsDetail, Bucket::Asis),
    (SourceType::FinishedGoods, Bucket::Fg),
    (SourceType::Inbound, Bucket::Inb),
    (SourceType::Staging, Bucket::Sta),
];

/// State forced by the presence of a feed kind, first match wins.
pub const STATE_BY_PRESENCE: [(SourceType, &str); 1] = [(SourceType::Staging, STAGED_STATE)];

/// Feed whose status and message codes override the generic merge.
pub const STATUS_SOURCE: SourceType = SourceType::ReturnsDetail;

/// Position of a feed in [`FEED_PRIORITY`]; lower ranks higher.
#[must_use]
pub fn feed_rank(source_type: SourceType) -> usize {
    FEED_PRIORITY
        .iter()
        .position(|candidate| *candidate == source_type)
        .unwrap_or(FEED_PRIORITY.len())
}

/// Bucket implied by the feed kinds present, if any.
#[must_use]
pub fn bucket_by_presence(present: &[SourceType]) -> Option<Bucket> {
    BUCKET_BY_PRESENCE
        .iter()
        .find(|(source_type, _)| present.contains(source_type))
        .map(|(_, bucket)| *bucket)
}

/// State implied by the feed kinds present, if any.
#[must_use]
pub fn state_by_presence(present: &[SourceType]) -> Option<&'static str> {
    STATE_BY_PRESENCE
        .iter()
        .find(|(source_type, _)| present.contains(source_type))
        .map(|(_, state)| *state)
}

/// Trimmed, lowercased state used for the staged check.
#[must_use]
pub fn normalize_state(state: Option<&str>) -> String {
    state.map(|s| s.trim().to_lowercase()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_feed_has_a_rank() {
        for source_type in SourceType::ALL {
            assert!(feed_rank(source_type) < FEED_PRIORITY.len());
        }
        assert_eq!(feed_rank(SourceType::Staging), 0);
        assert!(feed_rank(SourceType::ReturnsDetail) < feed_rank(SourceType::Returns));
    }

    #[test]
    fn test_bucket_presence_order() {
        assert_eq!(
            bucket_by_presence(&[SourceType::FinishedGoods, SourceType::Returns]),
            Some(Bucket::Asis)
        );
        assert_eq!(
            bucket_by_presence(&[SourceType::Inbound, SourceType::FinishedGoods]),
            Some(Bucket::Fg)
        );
        assert_eq!(
            bucket_by_presence(&[SourceType::Staging, SourceType::Inbound]),
            Some(Bucket::Inb)
        );
        assert_eq!(bucket_by_presence(&[SourceType::Staging]), Some(Bucket::Sta));
        assert_eq!(bucket_by_presence(&[SourceType::Backhaul]), None);
    }

    #[test]
    fn test_state_presence() {
        assert_eq!(
            state_by_presence(&[SourceType::Returns, SourceType::Staging]),
            Some("staged")
        );
        assert_eq!(state_by_presence(&[SourceType::Returns]), None);
    }

    #[test]
    fn test_normalize_state() {
        assert_eq!(normalize_state(Some("  Staged ")), "staged");
        assert_eq!(normalize_state(None), "");
    }
}
