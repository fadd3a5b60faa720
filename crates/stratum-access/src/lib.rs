//! Application-level permission checks, layered above row security.
//!
//! # Purpose
//! Decides whether a user may perform an action on an entity, given their
//! memberships and a fixed per-entity-type role threshold table. This is
//! defense in depth above the row predicates in stratum-rls, not a
//! replacement for them.
//!
//! # Key invariants
//! - Pure: decisions depend only on the inputs and the fixed role table.
//! - No membership under the entity's tenant ⇒ deny.
//! - An unknown (action, entity kind) pairing is a configuration defect and
//!   surfaces as an error, never as a denial.
//! - The system-admin bypass lives here and only here; the row predicates
//!   below never see it.

use stratum_core::ids::EntityId;
use stratum_core::{EntityKind, EntityRef, Membership, Role, UserAccount};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccessError {
    /// 403-class: the caller lacks the required role.
    #[error("action {action:?} denied on entity {entity}")]
    Denied {
        action: PermittedAction,
        entity: EntityId,
    },
    /// 500-class: the role table has no entry for this pairing. A programming
    /// defect, logged loudly by callers and never retried.
    #[error("no role threshold configured for {action:?} on {kind:?}")]
    Config {
        action: PermittedAction,
        kind: EntityKind,
    },
}

/// Actions the role table knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermittedAction {
    View,
    Edit,
    Archive,
    Delete,
    Invite,
    ManageMembers,
}

/// Minimum role required for `action` on entities of `kind`.
///
/// The table is total over meaningful pairings; asking for a pairing that
/// cannot occur (inviting someone to a task) is a configuration error.
pub fn required_role(kind: EntityKind, action: PermittedAction) -> Result<Role, AccessError> {
    use EntityKind::*;
    use PermittedAction::*;
    match (kind, action) {
        (Organization, View) => Ok(Role::Member),
        (Organization, Edit | Archive | Delete | Invite | ManageMembers) => Ok(Role::Admin),

        (Project, View | Edit) => Ok(Role::Member),
        (Project, Archive | Delete | Invite | ManageMembers) => Ok(Role::Admin),

        (Task, View | Edit | Delete) => Ok(Role::Member),
        (Task, Archive) => Ok(Role::Admin),

        (Attachment, View | Edit | Delete) => Ok(Role::Member),

        // Memberships attach to context entities only; these pairings
        // cannot occur in a well-formed caller.
        (Task, Invite | ManageMembers) | (Attachment, Archive | Invite | ManageMembers) => {
            Err(AccessError::Config { action, kind })
        }
    }
}

// Highest active role the user holds under the entity's tenant. Membership
// rows carry their resolved tenant ancestor, so no per-entity walk is needed.
fn effective_role(memberships: &[Membership], entity: &EntityRef) -> Option<Role> {
    memberships
        .iter()
        .filter(|m| m.tenant_id == entity.tenant_id && m.is_active())
        .map(|m| m.role)
        .max()
}

/// Pure decision: does any active membership meet the threshold?
///
/// Returns `Ok(false)` for a plain denial; the error arm is reserved for
/// role-table configuration defects.
pub fn is_allowed(
    memberships: &[Membership],
    action: PermittedAction,
    entity: &EntityRef,
) -> Result<bool, AccessError> {
    let required = required_role(entity.kind, action)?;
    match effective_role(memberships, entity) {
        Some(role) => Ok(role >= required),
        None => Ok(false),
    }
}

/// Caller-facing check with the superuser escape hatch applied.
///
/// System admins pass unconditionally (and the bypass is logged); everyone
/// else goes through [`is_allowed`].
pub fn check_access(
    user: &UserAccount,
    memberships: &[Membership],
    action: PermittedAction,
    entity: &EntityRef,
) -> Result<(), AccessError> {
    if user.is_system_admin() {
        tracing::debug!(
            user_id = %user.id,
            entity_id = %entity.id,
            ?action,
            "system admin bypass"
        );
        return Ok(());
    }
    if is_allowed(memberships, action, entity)? {
        Ok(())
    } else {
        Err(AccessError::Denied {
            action,
            entity: entity.id,
        })
    }
}
