//! Row-level access control for tenant-scoped storage.
//!
//! # Purpose
//! Defines the per-table row-visibility predicates and the filter-injection
//! stores that apply them. The predicates are pure functions over
//! `(policy, context, row, memberships)` with no default-allow path: any
//! missing context value evaluates to deny.
//!
//! # How it fits
//! Request handlers establish a `TenantContext` (stratum-context) and pass it
//! into every `ScopedStore` call; the store injects the predicate the way the
//! original system's storage engine evaluated native row security. The
//! system-admin bypass lives one layer up (stratum-access), never here.
//!
//! # Key invariants
//! - No context ⇒ zero rows, never an error and never unfiltered data.
//! - Cross-tenant read applies to context entities only and never to writes.
//! - Identity columns are immutable after insert, on every path.

pub mod policy;
pub mod store;

pub use policy::{can_read, can_write, row_visible, table_policy, TablePolicy};
pub use store::memory::MemoryStore;
pub use store::postgres::PgScopedStore;
pub use store::{
    EntityPatch, EntityRow, MembershipStore, ScopedStore, StoreError, StoreResult,
};
