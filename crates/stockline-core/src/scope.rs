//! Identifier scope.
//!
//! Item identifiers are unique only within a (tenant, location) pair. Every
//! lookup, diff and conflict check in stockline is keyed by an
//! [`InventoryScope`].

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

use crate::ids::{LocationId, TenantId};

/// The (tenant, location) pair within which identifiers are unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InventoryScope {
    pub tenant_id: TenantId,
    pub location_id: LocationId,
}

impl InventoryScope {
    #[must_use]
    pub fn new(tenant_id: TenantId, location_id: LocationId) -> Self {
        Self {
            tenant_id,
            location_id,
        }
    }

    /// Build a scope from raw database UUIDs.
    #[must_use]
    pub fn from_uuids(tenant_id: Uuid, location_id: Uuid) -> Self {
        Self::new(TenantId::from_uuid(tenant_id), LocationId::from_uuid(location_id))
    }

    #[must_use]
    pub fn tenant_uuid(&self) -> Uuid {
        *self.tenant_id.as_uuid()
    }

    #[must_use]
    pub fn location_uuid(&self) -> Uuid {
        *self.location_id.as_uuid()
    }
}

impl Display for InventoryScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.location_id)
    }
}

/// Trait for rows that live inside one inventory scope.
///
/// This trait is object-safe.
pub trait ScopeAware {
    /// Returns the scope this row belongs to.
    fn scope(&self) -> InventoryScope;

    /// Whether this row belongs to `scope`.
    fn belongs_to(&self, scope: &InventoryScope) -> bool {
        self.scope() == *scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row {
        tenant_id: Uuid,
        location_id: Uuid,
    }

    impl ScopeAware for Row {
        fn scope(&self) -> InventoryScope {
            InventoryScope::from_uuids(self.tenant_id, self.location_id)
        }
    }

    #[test]
    fn test_from_uuids_roundtrip() {
        let tenant = Uuid::new_v4();
        let location = Uuid::new_v4();
        let scope = InventoryScope::from_uuids(tenant, location);
        assert_eq!(scope.tenant_uuid(), tenant);
        assert_eq!(scope.location_uuid(), location);
    }

    #[test]
    fn test_same_tenant_different_location_is_different_scope() {
        let tenant = TenantId::new();
        let a = InventoryScope::new(tenant, LocationId::new());
        let b = InventoryScope::new(tenant, LocationId::new());
        assert_ne!(a, b);
    }

    #[test]
    fn test_belongs_to() {
        let row = Row {
            tenant_id: Uuid::new_v4(),
            location_id: Uuid::new_v4(),
        };
        let scope = row.scope();
        assert!(row.belongs_to(&scope));

        let dyn_row: &dyn ScopeAware = &row;
        let other = InventoryScope::new(TenantId::new(), LocationId::new());
        assert!(!dyn_row.belongs_to(&other));
    }

    #[test]
    fn test_display() {
        let scope = InventoryScope::from_uuids(
            Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap(),
            Uuid::parse_str("00000000-0000-0000-0000-000000000002").unwrap(),
        );
        assert_eq!(
            scope.to_string(),
            "00000000-0000-0000-0000-000000000001/00000000-0000-0000-0000-000000000002"
        );
    }
}
