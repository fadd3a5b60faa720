//! Postgres-backed scoped store.
//!
//! The original design leaned on the database evaluating native row-security
//! policies from session variables. Here the same predicates are injected as
//! `WHERE` clauses built from the caller's `TenantContext` — a fixed set of
//! per-policy statements, no dynamic SQL. The default-deny fallback is
//! explicit: when a predicate's required context values are missing, reads
//! return empty without touching the database and writes are denied.
//!
//! Schema is applied at connect via `CREATE TABLE IF NOT EXISTS`; durability
//! and uniqueness come from Postgres. Tests are skipped unless `DATABASE_URL`
//! is set.

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use stratum_context::TenantContext;
use stratum_core::ids::{EntityId, TenantId, UserId};
use stratum_core::{ContextKind, EntityKind, Membership, Role};

use crate::policy::TablePolicy;
use crate::store::{
    classified, EntityPatch, EntityRow, MembershipStore, ScopedStore, StoreError, StoreResult,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entity_rows (
    id UUID PRIMARY KEY,
    table_name TEXT NOT NULL,
    entity_kind TEXT NOT NULL,
    tenant_id UUID NOT NULL,
    is_public BOOLEAN NOT NULL DEFAULT FALSE,
    created_by UUID NOT NULL,
    modified_by UUID NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    modified_at TIMESTAMPTZ NOT NULL,
    payload JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS entity_rows_table_tenant
    ON entity_rows (table_name, tenant_id);
CREATE TABLE IF NOT EXISTS memberships (
    context_id UUID NOT NULL,
    user_id UUID NOT NULL,
    context_kind TEXT NOT NULL,
    tenant_id UUID NOT NULL,
    role TEXT NOT NULL,
    archived BOOLEAN NOT NULL DEFAULT FALSE,
    muted BOOLEAN NOT NULL DEFAULT FALSE,
    PRIMARY KEY (context_id, user_id)
);
"#;

const ROW_COLUMNS: &str = "id, table_name, entity_kind, tenant_id, is_public, \
     created_by, modified_by, created_at, modified_at, payload";

// Active-membership subquery shared by the strict arms. $t = tenant, $u = user.
const MEMBER_EXISTS: &str = "EXISTS (SELECT 1 FROM memberships m \
     WHERE m.user_id = $3 AND m.tenant_id = $2 AND NOT m.archived)";

/// Durable scoped store backed by Postgres.
#[derive(Clone)]
pub struct PgScopedStore {
    pool: PgPool,
}

impl PgScopedStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connect postgres")?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        // Idempotent schema application; safe across concurrent starts.
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("apply scoped store schema")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // Returns (tenant, user) or None when the strict predicate cannot hold.
    fn strict_keys(ctx: &TenantContext) -> Option<(TenantId, UserId)> {
        if !ctx.is_authenticated {
            return None;
        }
        Some((ctx.tenant_id?, ctx.user_id?))
    }

    async fn fetch_rows(
        &self,
        sql: &str,
        table: &str,
        tenant: Option<TenantId>,
        user: Option<UserId>,
    ) -> StoreResult<Vec<EntityRow>> {
        let mut query = sqlx::query_as::<_, PgEntityRow>(sql).bind(table.to_string());
        if let Some(tenant) = tenant {
            query = query.bind(tenant.as_uuid());
        }
        if let Some(user) = user {
            query = query.bind(user.as_uuid());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("select entity rows")?;
        rows.into_iter().map(PgEntityRow::into_entity).collect()
    }

    // One fixed statement per (policy, context shape) pair.
    async fn visible_rows(
        &self,
        policy: TablePolicy,
        ctx: &TenantContext,
        table: &str,
    ) -> StoreResult<Vec<EntityRow>> {
        match policy {
            TablePolicy::Strict => match Self::strict_keys(ctx) {
                Some((tenant, user)) => {
                    let sql = format!(
                        "SELECT {ROW_COLUMNS} FROM entity_rows \
                         WHERE table_name = $1 AND tenant_id = $2 AND {MEMBER_EXISTS}"
                    );
                    self.fetch_rows(&sql, table, Some(tenant), Some(user)).await
                }
                None => Ok(Vec::new()),
            },
            TablePolicy::PublicAware => match Self::strict_keys(ctx) {
                Some((tenant, user)) => {
                    let sql = format!(
                        "SELECT {ROW_COLUMNS} FROM entity_rows \
                         WHERE table_name = $1 AND \
                         (is_public OR (tenant_id = $2 AND {MEMBER_EXISTS}))"
                    );
                    self.fetch_rows(&sql, table, Some(tenant), Some(user)).await
                }
                None => {
                    let sql = format!(
                        "SELECT {ROW_COLUMNS} FROM entity_rows \
                         WHERE table_name = $1 AND is_public"
                    );
                    self.fetch_rows(&sql, table, None, None).await
                }
            },
            TablePolicy::CrossTenantRead => match Self::strict_keys(ctx) {
                Some((tenant, user)) => {
                    // Readable when the caller belongs to the row's own
                    // tenant, whichever tenant is currently active.
                    let sql = format!(
                        "SELECT {ROW_COLUMNS} FROM entity_rows \
                         WHERE table_name = $1 AND \
                         ((tenant_id = $2 AND {MEMBER_EXISTS}) OR \
                          EXISTS (SELECT 1 FROM memberships m \
                                  WHERE m.user_id = $3 \
                                    AND m.tenant_id = entity_rows.tenant_id \
                                    AND NOT m.archived))"
                    );
                    self.fetch_rows(&sql, table, Some(tenant), Some(user)).await
                }
                None => Ok(Vec::new()),
            },
        }
    }

    // Distinguish "row missing" from "row exists but predicate denied".
    async fn classify_zero_affected(&self, table: &str, id: EntityId) -> StoreError {
        let exists = sqlx::query("SELECT 1 FROM entity_rows WHERE table_name = $1 AND id = $2")
            .bind(table.to_string())
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await;
        match exists {
            Ok(Some(_)) => StoreError::Denied,
            Ok(None) => StoreError::NotFound(id),
            Err(err) => StoreError::Unexpected(anyhow::Error::new(err)),
        }
    }
}

#[async_trait]
impl ScopedStore for PgScopedStore {
    async fn select(&self, ctx: &TenantContext, table: &str) -> StoreResult<Vec<EntityRow>> {
        let policy = classified(table)?;
        self.visible_rows(policy, ctx, table).await
    }

    async fn get(
        &self,
        ctx: &TenantContext,
        table: &str,
        id: EntityId,
    ) -> StoreResult<Option<EntityRow>> {
        // Narrow server-side result sets are not worth a fourth statement
        // family here; visibility filtering already happened.
        let rows = self.select(ctx, table).await?;
        Ok(rows.into_iter().find(|row| row.id == id))
    }

    async fn insert(
        &self,
        ctx: &TenantContext,
        table: &str,
        row: EntityRow,
    ) -> StoreResult<EntityRow> {
        classified(table)?;
        let (tenant, user) = Self::strict_keys(ctx).ok_or(StoreError::Denied)?;
        if row.tenant_id != tenant {
            return Err(StoreError::Denied);
        }
        // Insert only when the membership predicate holds, in one statement.
        let inserted = sqlx::query(
            "INSERT INTO entity_rows \
             (id, table_name, entity_kind, tenant_id, is_public, created_by, \
              modified_by, created_at, modified_at, payload) \
             SELECT $4, $1, $5, $2, $6, $7, $8, $9, $10, $11 \
             WHERE EXISTS (SELECT 1 FROM memberships m \
                           WHERE m.user_id = $3 AND m.tenant_id = $2 AND NOT m.archived)",
        )
        .bind(table.to_string())
        .bind(tenant.as_uuid())
        .bind(user.as_uuid())
        .bind(row.id.as_uuid())
        .bind(row.entity_kind.as_str())
        .bind(row.is_public)
        .bind(row.created_by.as_uuid())
        .bind(row.modified_by.as_uuid())
        .bind(row.created_at)
        .bind(row.modified_at)
        .bind(row.payload.clone())
        .execute(&self.pool)
        .await
        .context("insert entity row")?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::Denied);
        }
        Ok(row)
    }

    async fn update(
        &self,
        ctx: &TenantContext,
        table: &str,
        id: EntityId,
        patch: EntityPatch,
    ) -> StoreResult<EntityRow> {
        classified(table)?;
        let (tenant, user) = Self::strict_keys(ctx).ok_or(StoreError::Denied)?;
        // Identity columns never appear in the SET list; COALESCE keeps
        // unpatched mutable columns as-is.
        let sql = format!(
            "UPDATE entity_rows SET \
                 is_public = COALESCE($5, is_public), \
                 payload = COALESCE($6, payload), \
                 modified_by = $3, \
                 modified_at = $7 \
             WHERE table_name = $1 AND id = $4 AND tenant_id = $2 AND {MEMBER_EXISTS} \
             RETURNING {ROW_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, PgEntityRow>(&sql)
            .bind(table.to_string())
            .bind(tenant.as_uuid())
            .bind(user.as_uuid())
            .bind(id.as_uuid())
            .bind(patch.is_public)
            .bind(patch.payload)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .context("update entity row")?;
        match updated {
            Some(row) => row.into_entity(),
            None => Err(self.classify_zero_affected(table, id).await),
        }
    }

    async fn delete(&self, ctx: &TenantContext, table: &str, id: EntityId) -> StoreResult<()> {
        classified(table)?;
        let (tenant, user) = Self::strict_keys(ctx).ok_or(StoreError::Denied)?;
        let sql = format!(
            "DELETE FROM entity_rows \
             WHERE table_name = $1 AND id = $4 AND tenant_id = $2 AND {MEMBER_EXISTS}"
        );
        let deleted = sqlx::query(&sql)
            .bind(table.to_string())
            .bind(tenant.as_uuid())
            .bind(user.as_uuid())
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .context("delete entity row")?;
        if deleted.rows_affected() == 0 {
            return Err(self.classify_zero_affected(table, id).await);
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for PgScopedStore {
    async fn upsert(&self, membership: Membership) -> StoreResult<Membership> {
        sqlx::query(
            "INSERT INTO memberships \
             (context_id, user_id, context_kind, tenant_id, role, archived, muted) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (context_id, user_id) DO UPDATE SET \
                 context_kind = EXCLUDED.context_kind, \
                 tenant_id = EXCLUDED.tenant_id, \
                 role = EXCLUDED.role, \
                 archived = EXCLUDED.archived, \
                 muted = EXCLUDED.muted",
        )
        .bind(membership.context_id.as_uuid())
        .bind(membership.user_id.as_uuid())
        .bind(membership.context_kind.as_str())
        .bind(membership.tenant_id.as_uuid())
        .bind(role_str(membership.role))
        .bind(membership.archived)
        .bind(membership.muted)
        .execute(&self.pool)
        .await
        .context("upsert membership")?;
        Ok(membership)
    }

    async fn memberships_for_user(&self, user_id: UserId) -> StoreResult<Vec<Membership>> {
        let rows = sqlx::query_as::<_, PgMembership>(
            "SELECT context_id, user_id, context_kind, tenant_id, role, archived, muted \
             FROM memberships WHERE user_id = $1",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .context("select memberships")?;
        rows.into_iter().map(PgMembership::into_membership).collect()
    }

    async fn set_role(
        &self,
        context_id: EntityId,
        user_id: UserId,
        role: Role,
    ) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE memberships SET role = $3 WHERE context_id = $1 AND user_id = $2",
        )
        .bind(context_id.as_uuid())
        .bind(user_id.as_uuid())
        .bind(role_str(role))
        .execute(&self.pool)
        .await
        .context("set membership role")?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(context_id));
        }
        Ok(())
    }

    async fn remove(&self, context_id: EntityId, user_id: UserId) -> StoreResult<()> {
        sqlx::query("DELETE FROM memberships WHERE context_id = $1 AND user_id = $2")
            .bind(context_id.as_uuid())
            .bind(user_id.as_uuid())
            .execute(&self.pool)
            .await
            .context("remove membership")?;
        Ok(())
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::Member => "member",
        Role::Admin => "admin",
    }
}

fn role_from_str(value: &str) -> StoreResult<Role> {
    match value {
        "member" => Ok(Role::Member),
        "admin" => Ok(Role::Admin),
        other => Err(StoreError::Unexpected(anyhow::anyhow!(
            "unknown role in storage: {other}"
        ))),
    }
}

fn context_kind_from_str(value: &str) -> StoreResult<ContextKind> {
    match value {
        "organization" => Ok(ContextKind::Organization),
        "project" => Ok(ContextKind::Project),
        other => Err(StoreError::Unexpected(anyhow::anyhow!(
            "unknown context kind in storage: {other}"
        ))),
    }
}

#[derive(Debug, FromRow)]
struct PgEntityRow {
    id: uuid::Uuid,
    #[allow(dead_code)]
    table_name: String,
    entity_kind: String,
    tenant_id: uuid::Uuid,
    is_public: bool,
    created_by: uuid::Uuid,
    modified_by: uuid::Uuid,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl PgEntityRow {
    fn into_entity(self) -> StoreResult<EntityRow> {
        let entity_kind = EntityKind::from_str(&self.entity_kind)
            .map_err(|err| StoreError::Unexpected(anyhow::Error::new(err)))?;
        Ok(EntityRow {
            id: EntityId::from_uuid(self.id),
            entity_kind,
            tenant_id: TenantId::from_uuid(self.tenant_id),
            is_public: self.is_public,
            created_by: UserId::from_uuid(self.created_by),
            modified_by: UserId::from_uuid(self.modified_by),
            created_at: self.created_at,
            modified_at: self.modified_at,
            payload: self.payload,
        })
    }
}

#[derive(Debug, FromRow)]
struct PgMembership {
    context_id: uuid::Uuid,
    user_id: uuid::Uuid,
    context_kind: String,
    tenant_id: uuid::Uuid,
    role: String,
    archived: bool,
    muted: bool,
}

impl PgMembership {
    fn into_membership(self) -> StoreResult<Membership> {
        Ok(Membership {
            user_id: UserId::from_uuid(self.user_id),
            context_id: EntityId::from_uuid(self.context_id),
            context_kind: context_kind_from_str(&self.context_kind)?,
            tenant_id: TenantId::from_uuid(self.tenant_id),
            role: role_from_str(&self.role)?,
            archived: self.archived,
            muted: self.muted,
        })
    }
}
