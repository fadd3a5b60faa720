//! End-to-end pipeline tests: scoped reads, permission checks, poison-event
//! handling, dead-letter replay, and live stream resume.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use stratum_access::{check_access, is_allowed, PermittedAction};
use stratum_activity::{Activity, ActivitySubscriber, SubscriberError};
use stratum_cdc::{ChangeOp, Lsn};
use stratum_context::TenantContext;
use stratum_core::ids::{EntityId, TenantId, UserId};
use stratum_core::{ContextKind, EntityKind, EntityRef, Membership, Role, UserAccount, UserRole};
use stratum_pipeline::{Pipeline, PipelineConfig};
use stratum_rls::EntityRow;
use stratum_stream::StreamOffset;

fn test_config() -> PipelineConfig {
    PipelineConfig {
        metrics_bind: "127.0.0.1:0".parse::<SocketAddr>().expect("addr"),
        database_url: None,
        log_capacity: 4096,
        client_queue_capacity: 64,
        dispatch_batch_size: 64,
        retry_max_attempts: 3,
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
    }
}

fn org_membership(user: UserId, tenant: TenantId, role: Role) -> Membership {
    Membership::new(
        user,
        EntityId::from_uuid(tenant.as_uuid()),
        ContextKind::Organization,
        tenant,
        role,
    )
}

async fn member_of(pipeline: &Pipeline, tenant: TenantId, role: Role) -> (UserId, TenantContext) {
    let user = UserId::new();
    pipeline
        .memberships
        .upsert(org_membership(user, tenant, role))
        .await
        .expect("membership");
    (user, TenantContext::authenticated(tenant, user))
}

// A subscriber that fails its first `failures` deliveries.
struct Crashy {
    failures: AtomicU32,
}

impl Crashy {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
        })
    }
}

#[async_trait]
impl ActivitySubscriber for Crashy {
    fn name(&self) -> &'static str {
        "crashy"
    }

    async fn deliver(&self, _activity: &Activity) -> Result<(), SubscriberError> {
        let remaining = self.failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::Relaxed);
            return Err(SubscriberError::with_code("handler crashed", "E_CRASH"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn query_without_context_returns_empty() {
    let pipeline = Pipeline::build(&test_config()).await.expect("build");
    let tenant = TenantId::new();
    let (user, ctx) = member_of(&pipeline, tenant, Role::Member).await;
    pipeline
        .store
        .insert(
            &ctx,
            "tasks",
            EntityRow::new(EntityKind::Task, tenant, user, serde_json::json!({})),
        )
        .await
        .expect("insert");

    let rows = pipeline
        .store
        .select(&TenantContext::none(), "tasks")
        .await
        .expect("select succeeds");
    assert!(rows.is_empty());
}

#[tokio::test]
async fn rows_never_cross_tenants() {
    let pipeline = Pipeline::build(&test_config()).await.expect("build");
    let tenant_a = TenantId::new();
    let tenant_b = TenantId::new();
    let (user_a, ctx_a) = member_of(&pipeline, tenant_a, Role::Member).await;
    let (_, ctx_b) = member_of(&pipeline, tenant_b, Role::Member).await;

    let row = EntityRow::new(EntityKind::Task, tenant_a, user_a, serde_json::json!({}));
    pipeline
        .store
        .insert(&ctx_a, "tasks", row.clone())
        .await
        .expect("insert");

    let own = pipeline.store.select(&ctx_a, "tasks").await.expect("select");
    assert!(own.iter().any(|r| r.id == row.id));
    let foreign = pipeline.store.select(&ctx_b, "tasks").await.expect("select");
    assert!(foreign.is_empty());
}

#[tokio::test]
async fn member_archive_is_denied_but_system_admin_passes() {
    let tenant = TenantId::new();
    let user = UserId::new();
    let memberships = vec![org_membership(user, tenant, Role::Member)];
    let entity = EntityRef {
        id: EntityId::new(),
        kind: EntityKind::Task,
        tenant_id: tenant,
    };

    assert!(!is_allowed(&memberships, PermittedAction::Archive, &entity).expect("decide"));

    let superuser = UserAccount {
        id: UserId::new(),
        role: UserRole::Admin,
    };
    check_access(&superuser, &[], PermittedAction::Archive, &entity).expect("bypass");
}

#[tokio::test]
async fn poison_event_is_dead_lettered_and_the_stream_advances() {
    let pipeline = Pipeline::build(&test_config()).await.expect("build");
    pipeline.bus.subscribe(Crashy::new(u32::MAX) as _);

    let lsn = pipeline
        .record_change(
            "tasks",
            ChangeOp::Update,
            None,
            Some(serde_json::json!({"id": EntityId::new().to_string(), "status": "done"})),
        )
        .await;
    pipeline.listener.run_once().await.expect("run");

    let entry = pipeline
        .dead_letters
        .get(lsn)
        .await
        .expect("get")
        .expect("recorded");
    assert_eq!(entry.retry_count, 3);
    assert!(!entry.resolved);
    // The acknowledged position moved past the poison event.
    assert_eq!(pipeline.listener.position(), lsn.next());
    assert_eq!(pipeline.dead_letters.list_unresolved().await.expect("list").len(), 1);
}

#[tokio::test]
async fn replaying_a_dead_letter_applies_counters_once() {
    let pipeline = Pipeline::build(&test_config()).await.expect("build");
    // Fails the three dispatch attempts, then recovers for replay.
    pipeline.bus.subscribe(Crashy::new(3) as _);

    let entity = EntityId::new();
    let lsn = pipeline
        .record_change(
            "tasks",
            ChangeOp::Update,
            None,
            Some(serde_json::json!({"id": entity.to_string(), "status": "done"})),
        )
        .await;
    pipeline.listener.run_once().await.expect("run");
    assert_eq!(pipeline.counters.count(entity), 0);

    let entry = pipeline.replayer.replay(lsn).await.expect("replay");
    assert!(entry.resolved);
    assert_eq!(pipeline.counters.count(entity), 1);

    // Replaying again is a no-op on derived state.
    pipeline.replayer.replay(lsn).await.expect("replay");
    assert_eq!(pipeline.counters.count(entity), 1);
}

#[tokio::test]
async fn stream_client_resumes_after_its_last_seen_offset() {
    let pipeline = Pipeline::build(&test_config()).await.expect("build");
    let tenant = TenantId::new();
    let user = UserId::new();
    let memberships = vec![org_membership(user, tenant, Role::Member)];
    let ctx = TenantContext::authenticated(tenant, user);

    let (backlog, mut sub) = pipeline
        .gateway
        .connect(ctx, memberships.clone(), StreamOffset::Now)
        .expect("connect");
    assert!(backlog.is_empty());

    let row = serde_json::json!({
        "id": EntityId::new().to_string(),
        "tenant_id": tenant.to_string(),
    });
    let first = pipeline
        .record_change("tasks", ChangeOp::Insert, None, Some(row.clone()))
        .await;
    let second = pipeline
        .record_change("tasks", ChangeOp::Update, None, Some(row))
        .await;
    pipeline.listener.run_once().await.expect("run");

    // Both arrive in LSN order within the session.
    assert_eq!(sub.recv().await.expect("activity").lsn, first);
    assert_eq!(sub.recv().await.expect("activity").lsn, second);

    // Disconnect after the first, reconnect with its offset: only the
    // second is replayed.
    drop(sub);
    let (backlog, _sub) = pipeline
        .gateway
        .connect(ctx, memberships, StreamOffset::After(first))
        .expect("reconnect");
    let lsns: Vec<Lsn> = backlog.iter().map(|a| a.lsn).collect();
    assert_eq!(lsns, vec![second]);
}

#[tokio::test]
async fn events_flow_to_subscribers_in_lsn_order() {
    let pipeline = Pipeline::build(&test_config()).await.expect("build");
    let tenant = TenantId::new();
    let user = UserId::new();
    let ctx = TenantContext::authenticated(tenant, user);
    let memberships = vec![org_membership(user, tenant, Role::Member)];
    let (_, mut sub) = pipeline
        .gateway
        .connect(ctx, memberships, StreamOffset::Now)
        .expect("connect");

    let mut appended = Vec::new();
    for n in 0..10 {
        let row = serde_json::json!({
            "id": EntityId::new().to_string(),
            "tenant_id": tenant.to_string(),
            "n": n,
        });
        appended.push(
            pipeline
                .record_change("tasks", ChangeOp::Insert, None, Some(row))
                .await,
        );
    }
    pipeline.listener.run_once().await.expect("run");

    for expected in appended {
        assert_eq!(sub.recv().await.expect("activity").lsn, expected);
    }
}
