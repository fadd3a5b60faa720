//! Request-scoped tenant/user identity.
//!
//! The original design threaded identity through database session variables;
//! here every store operation takes a [`TenantContext`] value instead, so no
//! ambient state can leak between concurrently handled requests. [`Session`]
//! models the per-request slot those session variables occupied: scoped
//! acquisition with guaranteed teardown on every exit path.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use stratum_core::ids::{TenantId, UserId};

/// Identity under which tenant-scoped queries run.
///
/// A missing tenant or user never widens access: predicates treat absent
/// values as deny (fail closed). The context is a plain value, created at
/// request start and dropped at request end; it is never persisted and never
/// shared across requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<UserId>,
    pub is_authenticated: bool,
    pub is_system_admin: bool,
}

impl TenantContext {
    /// The empty context: every tenant-scoped query returns zero rows.
    pub fn none() -> Self {
        Self {
            tenant_id: None,
            user_id: None,
            is_authenticated: false,
            is_system_admin: false,
        }
    }

    pub fn authenticated(tenant_id: TenantId, user_id: UserId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            user_id: Some(user_id),
            is_authenticated: true,
            is_system_admin: false,
        }
    }

    pub fn system_admin(tenant_id: TenantId, user_id: UserId) -> Self {
        Self {
            is_system_admin: true,
            ..Self::authenticated(tenant_id, user_id)
        }
    }

    /// Unauthenticated access to explicitly public resources of one tenant.
    pub fn public_scope(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            user_id: None,
            is_authenticated: false,
            is_system_admin: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tenant_id.is_none() && self.user_id.is_none()
    }
}

impl Default for TenantContext {
    fn default() -> Self {
        Self::none()
    }
}

/// Per-request session slot.
///
/// One `Session` exists per logical request; sessions are never shared, so
/// nested or concurrent invocations cannot observe each other's context.
#[derive(Debug, Default)]
pub struct Session {
    active: Arc<Mutex<Option<TenantContext>>>,
}

// Clears the slot when the scope exits, including on panic/error paths.
struct ScopeGuard {
    active: Arc<Mutex<Option<TenantContext>>>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        *self.active.lock() = None;
    }
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently active context, or the empty context when none is set.
    pub fn current(&self) -> TenantContext {
        self.active.lock().unwrap_or_default()
    }

    /// Run `f` with an authenticated context; the slot is cleared on every
    /// exit path, including when the future errors or panics.
    pub async fn with_context<F, Fut, T>(&self, tenant_id: TenantId, user_id: UserId, f: F) -> T
    where
        F: FnOnce(TenantContext) -> Fut,
        Fut: Future<Output = T>,
    {
        self.scoped(TenantContext::authenticated(tenant_id, user_id), f)
            .await
    }

    /// Run `f` with an unauthenticated public-scope context.
    pub async fn with_public_context<F, Fut, T>(&self, tenant_id: TenantId, f: F) -> T
    where
        F: FnOnce(TenantContext) -> Fut,
        Fut: Future<Output = T>,
    {
        self.scoped(TenantContext::public_scope(tenant_id), f).await
    }

    async fn scoped<F, Fut, T>(&self, ctx: TenantContext, f: F) -> T
    where
        F: FnOnce(TenantContext) -> Fut,
        Fut: Future<Output = T>,
    {
        *self.active.lock() = Some(ctx);
        let _guard = ScopeGuard {
            active: Arc::clone(&self.active),
        };
        // The context is passed by value; callees never read the slot
        // directly. The slot only exists so teardown is observable.
        f(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_is_cleared_after_scope() {
        let session = Session::new();
        let tenant = TenantId::new();
        let user = UserId::new();
        let seen = session
            .with_context(tenant, user, |ctx| async move { ctx })
            .await;
        assert_eq!(seen.tenant_id, Some(tenant));
        assert!(seen.is_authenticated);
        assert!(session.current().is_empty());
    }

    #[tokio::test]
    async fn context_is_cleared_when_scope_errors() {
        let session = Session::new();
        let result: Result<(), &str> = session
            .with_context(TenantId::new(), UserId::new(), |_ctx| async move {
                Err("boom")
            })
            .await;
        assert!(result.is_err());
        assert!(session.current().is_empty());
    }

    #[tokio::test]
    async fn concurrent_sessions_do_not_leak() {
        let a = Arc::new(Session::new());
        let b = Arc::new(Session::new());
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();

        let task_a = {
            let a = Arc::clone(&a);
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                a.with_context(tenant_a, UserId::new(), |ctx| async move {
                    // The other session must not see this scope's identity.
                    assert!(b.current().is_empty() || b.current().tenant_id != ctx.tenant_id);
                    ctx.tenant_id
                })
                .await
            })
        };
        let task_b = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                b.with_context(tenant_b, UserId::new(), |ctx| async move { ctx.tenant_id })
                    .await
            })
        };

        assert_eq!(task_a.await.expect("join a"), Some(tenant_a));
        assert_eq!(task_b.await.expect("join b"), Some(tenant_b));
        assert!(a.current().is_empty());
        assert!(b.current().is_empty());
    }

    #[tokio::test]
    async fn public_scope_is_unauthenticated() {
        let session = Session::new();
        let tenant = TenantId::new();
        let ctx = session
            .with_public_context(tenant, |ctx| async move { ctx })
            .await;
        assert_eq!(ctx.tenant_id, Some(tenant));
        assert!(!ctx.is_authenticated);
        assert!(ctx.user_id.is_none());
    }

    #[test]
    fn empty_context_fails_closed_flags() {
        let ctx = TenantContext::none();
        assert!(ctx.is_empty());
        assert!(!ctx.is_authenticated);
        assert!(!ctx.is_system_admin);
    }
}
