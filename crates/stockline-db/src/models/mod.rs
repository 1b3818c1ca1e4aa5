//! Database models.

pub mod canonical_item;
pub mod change_event;
pub mod conflict_group;
pub mod pending_identifier;
pub mod source_record;

pub use canonical_item::CanonicalItem;
pub use change_event::{ChangeEvent, ChangeKind};
pub use conflict_group::{ConflictGroup, ConflictReason, ConflictSourceSummary, ConflictStatus};
pub use pending_identifier::PendingIdentifier;
pub use source_record::{Bucket, NewSourceRecord, SourceRecord, SourceType};
