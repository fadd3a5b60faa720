//! Scoped storage traits: every operation takes the caller's `TenantContext`
//! and applies the table's predicate before any row is returned or mutated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_context::TenantContext;
use stratum_core::ids::{EntityId, TenantId, UserId};
use stratum_core::{EntityKind, Membership, Role};
use thiserror::Error;

use crate::policy::{table_policy, TablePolicy};

pub mod memory;
pub mod postgres;

pub type StoreResult<T> = Result<T, StoreError>;

// Every store operation resolves its table through here, so a missing
// registry entry is logged loudly at the point of refusal.
pub(crate) fn classified(table: &str) -> Result<TablePolicy, StoreError> {
    match table_policy(table) {
        Some(policy) => Ok(policy),
        None => {
            tracing::warn!(table, "refusing access to unclassified table");
            Err(StoreError::UnclassifiedTable(table.to_string()))
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The predicate rejected the operation (403-class). Reads never surface
    /// this; they return an empty result instead.
    #[error("access denied")]
    Denied,
    /// Table missing from the policy registry (programming defect).
    #[error("unclassified table: {0}")]
    UnclassifiedTable(String),
    #[error("not found: {0}")]
    NotFound(EntityId),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// A tenant-scoped row. Identity columns (`id`, `entity_kind`, `tenant_id`,
/// `created_by`, `created_at`) are fixed at insert and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: EntityId,
    pub entity_kind: EntityKind,
    pub tenant_id: TenantId,
    pub is_public: bool,
    pub created_by: UserId,
    pub modified_by: UserId,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EntityRow {
    pub fn new(
        entity_kind: EntityKind,
        tenant_id: TenantId,
        created_by: UserId,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new(),
            entity_kind,
            tenant_id,
            is_public: false,
            created_by,
            modified_by: created_by,
            created_at: now,
            modified_at: now,
            payload,
        }
    }
}

/// Mutable subset of a row. Identity columns are not representable here, so
/// no caller (bypass paths included) can rewrite them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityPatch {
    pub is_public: Option<bool>,
    pub payload: Option<serde_json::Value>,
}

/// Filter-injected storage for tenant-scoped rows.
///
/// Reads silently narrow to visible rows; mutations on rows the caller cannot
/// write fail with [`StoreError::Denied`]. A table absent from the policy
/// registry is a configuration defect, not a denial.
#[async_trait]
pub trait ScopedStore: Send + Sync {
    async fn select(&self, ctx: &TenantContext, table: &str) -> StoreResult<Vec<EntityRow>>;
    async fn get(
        &self,
        ctx: &TenantContext,
        table: &str,
        id: EntityId,
    ) -> StoreResult<Option<EntityRow>>;
    async fn insert(&self, ctx: &TenantContext, table: &str, row: EntityRow)
        -> StoreResult<EntityRow>;
    async fn update(
        &self,
        ctx: &TenantContext,
        table: &str,
        id: EntityId,
        patch: EntityPatch,
    ) -> StoreResult<EntityRow>;
    async fn delete(&self, ctx: &TenantContext, table: &str, id: EntityId) -> StoreResult<()>;
}

/// Membership persistence. Upsert keyed by (context_id, user_id) keeps the
/// one-membership-per-pair invariant.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn upsert(&self, membership: Membership) -> StoreResult<Membership>;
    async fn memberships_for_user(&self, user_id: UserId) -> StoreResult<Vec<Membership>>;
    async fn set_role(&self, context_id: EntityId, user_id: UserId, role: Role)
        -> StoreResult<()>;
    async fn remove(&self, context_id: EntityId, user_id: UserId) -> StoreResult<()>;
}
