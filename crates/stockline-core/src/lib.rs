//! Stockline Core Library
//!
//! Shared types and traits for stockline.
//!
//! # Modules
//!
//! - [`ids`] - Strongly typed identifiers (TenantId, LocationId, RunId)
//! - [`scope`] - The (tenant, location) pair within which item identifiers are unique
//!
//! # Example
//!
//! ```
//! use stockline_core::{InventoryScope, LocationId, ScopeAware, TenantId};
//!
//! let scope = InventoryScope::new(TenantId::new(), LocationId::new());
//!
//! struct Row {
//!     scope: InventoryScope,
//! }
//!
//! impl ScopeAware for Row {
//!     fn scope(&self) -> InventoryScope {
//!         self.scope
//!     }
//! }
//!
//! assert!(Row { scope }.belongs_to(&scope));
//! ```

pub mod ids;
pub mod scope;

pub use ids::{LocationId, ParseIdError, RunId, TenantId};
pub use scope::{InventoryScope, ScopeAware};
