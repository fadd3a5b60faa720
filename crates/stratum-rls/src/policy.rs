//! Table classification and the three predicate families.
//!
//! One canonical registry maps logical table names to a [`TablePolicy`];
//! nothing else in the workspace classifies tables.

use stratum_context::TenantContext;
use stratum_core::ids::TenantId;
use stratum_core::Membership;

use crate::store::EntityRow;

/// Predicate family evaluated for every row of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePolicy {
    /// Visible/mutable only inside the caller's tenant, with an active
    /// membership linking the caller to that tenant.
    Strict,
    /// As strict, but rows flagged public are readable by anyone.
    PublicAware,
    /// Context entities readable by anyone holding a membership under the
    /// entity's tenant, even when the active tenant differs. Never writable
    /// through this family.
    CrossTenantRead,
}

/// Canonical table → policy registry.
pub fn table_policy(table: &str) -> Option<TablePolicy> {
    match table {
        "organizations" => Some(TablePolicy::CrossTenantRead),
        "projects" => Some(TablePolicy::PublicAware),
        "tasks" => Some(TablePolicy::Strict),
        "attachments" => Some(TablePolicy::Strict),
        _ => None,
    }
}

// True when the caller holds an active membership under `tenant`.
fn has_active_membership(ctx: &TenantContext, tenant: TenantId, memberships: &[Membership]) -> bool {
    let user_id = match ctx.user_id {
        Some(user_id) => user_id,
        None => return false,
    };
    memberships
        .iter()
        .any(|m| m.user_id == user_id && m.tenant_id == tenant && m.is_active())
}

// The strict predicate every family builds on: authenticated caller, matching
// tenant, active membership. Any missing input denies.
fn strict_visible(
    ctx: &TenantContext,
    row_tenant: TenantId,
    memberships: &[Membership],
) -> bool {
    if !ctx.is_authenticated {
        return false;
    }
    let tenant = match ctx.tenant_id {
        Some(tenant) => tenant,
        None => return false,
    };
    row_tenant == tenant && has_active_membership(ctx, tenant, memberships)
}

/// Read predicate over the row's denormalized identity. The stream gateway
/// calls this with fields lifted from an activity; stores call [`can_read`]
/// with a full row. There is no default-allow arm: every family bottoms out
/// in an explicit deny when context is missing.
pub fn row_visible(
    policy: TablePolicy,
    ctx: &TenantContext,
    row_tenant: TenantId,
    is_public: bool,
    memberships: &[Membership],
) -> bool {
    match policy {
        TablePolicy::Strict => strict_visible(ctx, row_tenant, memberships),
        TablePolicy::PublicAware => is_public || strict_visible(ctx, row_tenant, memberships),
        TablePolicy::CrossTenantRead => {
            // Readable from any active tenant as long as the caller belongs
            // to the row's own tenant.
            strict_visible(ctx, row_tenant, memberships)
                || (ctx.is_authenticated && has_active_membership(ctx, row_tenant, memberships))
        }
    }
}

/// Read predicate over a stored row.
pub fn can_read(
    policy: TablePolicy,
    ctx: &TenantContext,
    row: &EntityRow,
    memberships: &[Membership],
) -> bool {
    row_visible(policy, ctx, row.tenant_id, row.is_public, memberships)
}

/// Write predicate. Cross-tenant read never grants writes; public visibility
/// never grants writes.
pub fn can_write(
    policy: TablePolicy,
    ctx: &TenantContext,
    row: &EntityRow,
    memberships: &[Membership],
) -> bool {
    match policy {
        TablePolicy::Strict | TablePolicy::PublicAware | TablePolicy::CrossTenantRead => {
            strict_visible(ctx, row.tenant_id, memberships)
        }
    }
}
