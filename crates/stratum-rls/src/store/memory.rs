//! In-memory scoped store, the reference implementation of the predicates.
//! Used by the pipeline service and by every test that does not need
//! Postgres.

use ahash::RandomState;
use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::RwLock;
use stratum_context::TenantContext;
use stratum_core::ids::{EntityId, UserId};
use stratum_core::{Membership, Role};

use crate::policy::{can_read, can_write};
use crate::store::{
    classified, EntityPatch, EntityRow, MembershipStore, ScopedStore, StoreError, StoreResult,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    // Table name -> rows. The predicate runs on every access; rows are never
    // handed out unfiltered.
    tables: RwLock<HashMap<String, Vec<EntityRow>, RandomState>>,
    // (context_id, user_id) -> membership, the at-most-one invariant by key.
    memberships: RwLock<HashMap<(EntityId, UserId), Membership, RandomState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn memberships_snapshot(&self, ctx: &TenantContext) -> Vec<Membership> {
        let user_id = match ctx.user_id {
            Some(user_id) => user_id,
            None => return Vec::new(),
        };
        self.memberships
            .read()
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ScopedStore for MemoryStore {
    async fn select(&self, ctx: &TenantContext, table: &str) -> StoreResult<Vec<EntityRow>> {
        let policy = classified(table)?;
        let memberships = self.memberships_snapshot(ctx);
        let guard = self.tables.read();
        let rows = match guard.get(table) {
            Some(rows) => rows,
            // Unknown-but-classified table simply has no rows yet.
            None => return Ok(Vec::new()),
        };
        Ok(rows
            .iter()
            .filter(|row| can_read(policy, ctx, row, &memberships))
            .cloned()
            .collect())
    }

    async fn get(
        &self,
        ctx: &TenantContext,
        table: &str,
        id: EntityId,
    ) -> StoreResult<Option<EntityRow>> {
        let policy = classified(table)?;
        let memberships = self.memberships_snapshot(ctx);
        let guard = self.tables.read();
        Ok(guard.get(table).and_then(|rows| {
            rows.iter()
                .find(|row| row.id == id && can_read(policy, ctx, row, &memberships))
                .cloned()
        }))
    }

    async fn insert(
        &self,
        ctx: &TenantContext,
        table: &str,
        row: EntityRow,
    ) -> StoreResult<EntityRow> {
        let policy = classified(table)?;
        let memberships = self.memberships_snapshot(ctx);
        // Inserting is a write against the row being created.
        if !can_write(policy, ctx, &row, &memberships) {
            return Err(StoreError::Denied);
        }
        let mut guard = self.tables.write();
        guard
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        ctx: &TenantContext,
        table: &str,
        id: EntityId,
        patch: EntityPatch,
    ) -> StoreResult<EntityRow> {
        let policy = classified(table)?;
        let memberships = self.memberships_snapshot(ctx);
        let mut guard = self.tables.write();
        let rows = guard.get_mut(table).ok_or(StoreError::NotFound(id))?;
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StoreError::NotFound(id))?;
        if !can_write(policy, ctx, row, &memberships) {
            return Err(StoreError::Denied);
        }
        // Only the mutable subset changes; identity columns stay as inserted.
        if let Some(is_public) = patch.is_public {
            row.is_public = is_public;
        }
        if let Some(payload) = patch.payload {
            row.payload = payload;
        }
        if let Some(user_id) = ctx.user_id {
            row.modified_by = user_id;
        }
        row.modified_at = Utc::now();
        Ok(row.clone())
    }

    async fn delete(&self, ctx: &TenantContext, table: &str, id: EntityId) -> StoreResult<()> {
        let policy = classified(table)?;
        let memberships = self.memberships_snapshot(ctx);
        let mut guard = self.tables.write();
        let rows = guard.get_mut(table).ok_or(StoreError::NotFound(id))?;
        let index = rows
            .iter()
            .position(|row| row.id == id)
            .ok_or(StoreError::NotFound(id))?;
        if !can_write(policy, ctx, &rows[index], &memberships) {
            return Err(StoreError::Denied);
        }
        rows.remove(index);
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn upsert(&self, membership: Membership) -> StoreResult<Membership> {
        let key = (membership.context_id, membership.user_id);
        self.memberships.write().insert(key, membership.clone());
        Ok(membership)
    }

    async fn memberships_for_user(&self, user_id: UserId) -> StoreResult<Vec<Membership>> {
        Ok(self
            .memberships
            .read()
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn set_role(
        &self,
        context_id: EntityId,
        user_id: UserId,
        role: Role,
    ) -> StoreResult<()> {
        let mut guard = self.memberships.write();
        match guard.get_mut(&(context_id, user_id)) {
            Some(membership) => {
                membership.role = role;
                Ok(())
            }
            None => Err(StoreError::NotFound(context_id)),
        }
    }

    async fn remove(&self, context_id: EntityId, user_id: UserId) -> StoreResult<()> {
        self.memberships.write().remove(&(context_id, user_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::ids::TenantId;
    use stratum_core::{ContextKind, EntityKind};

    fn org_membership(user: UserId, tenant: TenantId) -> Membership {
        Membership::new(
            user,
            EntityId::from_uuid(tenant.as_uuid()),
            ContextKind::Organization,
            tenant,
            Role::Member,
        )
    }

    async fn seeded_store() -> (MemoryStore, TenantId, UserId) {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let user = UserId::new();
        store
            .upsert(org_membership(user, tenant))
            .await
            .expect("membership");
        let ctx = TenantContext::authenticated(tenant, user);
        store
            .insert(
                &ctx,
                "tasks",
                EntityRow::new(
                    EntityKind::Task,
                    tenant,
                    user,
                    serde_json::json!({"status": "open"}),
                ),
            )
            .await
            .expect("insert");
        (store, tenant, user)
    }

    #[tokio::test]
    async fn no_context_returns_empty_not_error() {
        let (store, _, _) = seeded_store().await;
        let rows = store
            .select(&TenantContext::none(), "tasks")
            .await
            .expect("select");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn rows_of_other_tenants_are_invisible() {
        let (store, _, _) = seeded_store().await;
        // A fully set-up user of a different tenant sees nothing.
        let other_tenant = TenantId::new();
        let other_user = UserId::new();
        store
            .upsert(org_membership(other_user, other_tenant))
            .await
            .expect("membership");
        let ctx = TenantContext::authenticated(other_tenant, other_user);
        let rows = store.select(&ctx, "tasks").await.expect("select");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn member_sees_own_tenant_rows() {
        let (store, tenant, user) = seeded_store().await;
        let ctx = TenantContext::authenticated(tenant, user);
        let rows = store.select(&ctx, "tasks").await.expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tenant_id, tenant);
    }

    #[tokio::test]
    async fn insert_without_membership_is_denied() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let user = UserId::new();
        let ctx = TenantContext::authenticated(tenant, user);
        let err = store
            .insert(
                &ctx,
                "tasks",
                EntityRow::new(EntityKind::Task, tenant, user, serde_json::json!({})),
            )
            .await
            .expect_err("denied");
        assert!(matches!(err, StoreError::Denied));
    }

    #[tokio::test]
    async fn update_cannot_touch_identity_columns() {
        let (store, tenant, user) = seeded_store().await;
        let ctx = TenantContext::authenticated(tenant, user);
        let row = store.select(&ctx, "tasks").await.expect("select")[0].clone();
        let updated = store
            .update(
                &ctx,
                "tasks",
                row.id,
                EntityPatch {
                    is_public: None,
                    payload: Some(serde_json::json!({"status": "done"})),
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.id, row.id);
        assert_eq!(updated.tenant_id, row.tenant_id);
        assert_eq!(updated.created_by, row.created_by);
        assert_eq!(updated.payload["status"], "done");
    }

    #[tokio::test]
    async fn public_project_is_visible_without_auth() {
        let (store, tenant, user) = seeded_store().await;
        let ctx = TenantContext::authenticated(tenant, user);
        let mut project =
            EntityRow::new(EntityKind::Project, tenant, user, serde_json::json!({}));
        project.is_public = true;
        store
            .insert(&ctx, "projects", project)
            .await
            .expect("insert");
        let anon = TenantContext::public_scope(tenant);
        let rows = store.select(&anon, "projects").await.expect("select");
        assert_eq!(rows.len(), 1);
        // But the anonymous context cannot mutate it.
        let err = store
            .delete(&anon, "projects", rows[0].id)
            .await
            .expect_err("denied");
        assert!(matches!(err, StoreError::Denied));
    }

    #[tokio::test]
    async fn cross_tenant_org_read_is_read_only() {
        let store = MemoryStore::new();
        let home = TenantId::new();
        let away = TenantId::new();
        let user = UserId::new();
        let away_user = UserId::new();
        store
            .upsert(org_membership(user, home))
            .await
            .expect("membership");
        store
            .upsert(org_membership(user, away))
            .await
            .expect("membership");
        store
            .upsert(org_membership(away_user, away))
            .await
            .expect("membership");
        // The away tenant's org row, created by one of its own members.
        let away_ctx = TenantContext::authenticated(away, away_user);
        let org = store
            .insert(
                &away_ctx,
                "organizations",
                EntityRow::new(
                    EntityKind::Organization,
                    away,
                    away_user,
                    serde_json::json!({"name": "away"}),
                ),
            )
            .await
            .expect("insert");
        // Visible while the user's active tenant is `home`.
        let ctx = TenantContext::authenticated(home, user);
        let fetched = store
            .get(&ctx, "organizations", org.id)
            .await
            .expect("get");
        assert!(fetched.is_some());
        // But not writable from there.
        let err = store
            .update(&ctx, "organizations", org.id, EntityPatch::default())
            .await
            .expect_err("denied");
        assert!(matches!(err, StoreError::Denied));
    }

    #[tokio::test]
    async fn unclassified_table_is_a_config_error() {
        let store = MemoryStore::new();
        let err = store
            .select(&TenantContext::none(), "sessions")
            .await
            .expect_err("unclassified");
        assert!(matches!(err, StoreError::UnclassifiedTable(_)));
    }

    #[tokio::test]
    async fn membership_upsert_keeps_single_row_per_pair() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let user = UserId::new();
        let mut membership = org_membership(user, tenant);
        store.upsert(membership.clone()).await.expect("first");
        membership.role = Role::Admin;
        store.upsert(membership).await.expect("second");
        let all = store
            .memberships_for_user(user)
            .await
            .expect("memberships");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].role, Role::Admin);
    }
}
