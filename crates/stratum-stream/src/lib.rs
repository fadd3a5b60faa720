//! Live stream gateway: per-client push delivery of activities, scoped to
//! each client's tenant identity.
//!
//! # Purpose
//! Clients connect with a resume offset and receive every activity committed
//! after it, filtered by the same read predicates the stores apply. The
//! gateway holds a bounded in-memory backlog for resume; clients that fall
//! too far behind are disconnected and reconnect with their last seen
//! offset, or are told that offset is gone.
//!
//! # Key invariants
//! - Connect and publish serialize on one lock, so the backlog snapshot and
//!   live registration are atomic: within one session a client sees no gap
//!   and no duplicate.
//! - A client disconnect tears down only that subscription; the replication
//!   slot position and other clients are unaffected.
//! - Visibility is evaluated per client per activity; unclassified tables
//!   and activities without tenant identity are never delivered.

use parking_lot::Mutex;
use slab::Slab;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use thiserror::Error;

use async_trait::async_trait;
use stratum_activity::{Activity, ActivitySubscriber, SubscriberError};
use stratum_cdc::Lsn;
use stratum_context::TenantContext;
use stratum_core::{Membership, PipelineLimits};
use stratum_rls::{row_visible, table_policy};
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The requested resume position precedes the retained backlog.
    #[error("offset too old (oldest {oldest}, requested {requested})")]
    OffsetTooOld { oldest: Lsn, requested: Lsn },
}

/// Where a client wants its stream to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOffset {
    /// Tail of the stream: only activities committed after connect.
    Now,
    /// Every activity with `lsn >` the given position.
    After(Lsn),
}

#[derive(Debug)]
struct ClientIdentity {
    ctx: TenantContext,
    memberships: Vec<Membership>,
}

impl ClientIdentity {
    // The read predicate lifted onto activity fields. Fail closed: no
    // tenant identity or no table classification means no delivery.
    fn can_see(&self, activity: &Activity) -> bool {
        let Some(policy) = table_policy(&activity.table) else {
            return false;
        };
        let Some(tenant) = activity.tenant_id else {
            return false;
        };
        row_visible(
            policy,
            &self.ctx,
            tenant,
            activity.is_public,
            &self.memberships,
        )
    }

    // A user whose every active membership under the activity's tenant is
    // muted has opted out of live delivery for that tenant.
    fn is_muted_for(&self, activity: &Activity) -> bool {
        let Some(tenant) = activity.tenant_id else {
            return false;
        };
        let mut any = false;
        for membership in &self.memberships {
            if membership.tenant_id == tenant && membership.is_active() {
                if !membership.muted {
                    return false;
                }
                any = true;
            }
        }
        any
    }
}

#[derive(Debug)]
struct Client {
    identity: ClientIdentity,
    sender: mpsc::Sender<Activity>,
    // Distinguishes this registration from a later one reusing the same
    // slab slot; the unsubscribe guard only removes a matching token.
    token: u64,
}

#[derive(Debug)]
struct GatewayState {
    // Bounded backlog for resume; oldest entries trimmed as new ones arrive.
    backlog: VecDeque<Activity>,
    // Highest LSN ever trimmed out of the backlog; resume below this is gone.
    trimmed_to: Lsn,
    clients: Slab<Client>,
    next_token: u64,
}

pub struct StreamGateway {
    state: Mutex<GatewayState>,
    backlog_capacity: usize,
    client_queue_capacity: usize,
}

impl StreamGateway {
    pub fn new(limits: &PipelineLimits) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GatewayState {
                backlog: VecDeque::new(),
                trimmed_to: Lsn::ZERO,
                clients: Slab::new(),
                next_token: 0,
            }),
            backlog_capacity: limits.log_capacity,
            client_queue_capacity: limits.client_queue_capacity,
        })
    }

    /// Register a client and return its replay backlog plus the live handle.
    ///
    /// The backlog and the registration are taken under one lock, so every
    /// activity published afterwards arrives exactly once on the live side.
    pub fn connect(
        self: &Arc<Self>,
        ctx: TenantContext,
        memberships: Vec<Membership>,
        offset: StreamOffset,
    ) -> Result<(Vec<Activity>, LiveSubscription), StreamError> {
        let identity = ClientIdentity { ctx, memberships };
        let mut state = self.state.lock();

        let backlog = match offset {
            StreamOffset::Now => Vec::new(),
            StreamOffset::After(lsn) => {
                if lsn < state.trimmed_to {
                    return Err(StreamError::OffsetTooOld {
                        oldest: state.trimmed_to.next(),
                        requested: lsn,
                    });
                }
                state
                    .backlog
                    .iter()
                    .filter(|activity| activity.lsn > lsn)
                    .filter(|activity| {
                        identity.can_see(activity) && !identity.is_muted_for(activity)
                    })
                    .cloned()
                    .collect()
            }
        };

        let (sender, receiver) = mpsc::channel(self.client_queue_capacity);
        let token = state.next_token;
        state.next_token += 1;
        let id = state.clients.insert(Client {
            identity,
            sender,
            token,
        });
        metrics::gauge!("stratum_stream_clients").set(state.clients.len() as f64);

        Ok((
            backlog,
            LiveSubscription {
                receiver,
                _guard: SubscriptionGuard {
                    gateway: Arc::downgrade(self),
                    client_id: id,
                    token,
                },
            },
        ))
    }

    fn remove_client(&self, client_id: usize, token: u64) {
        let mut state = self.state.lock();
        let matches = state
            .clients
            .get(client_id)
            .is_some_and(|client| client.token == token);
        if matches {
            state.clients.remove(client_id);
            metrics::gauge!("stratum_stream_clients").set(state.clients.len() as f64);
        }
    }

    /// Append to the backlog and fan out to connected clients.
    fn publish(&self, activity: &Activity) {
        let mut state = self.state.lock();
        let state = &mut *state;

        state.backlog.push_back(activity.clone());
        let overflow = state.backlog.len().saturating_sub(self.backlog_capacity);
        if overflow > 0 {
            for trimmed in state.backlog.drain(..overflow) {
                state.trimmed_to = state.trimmed_to.max(trimmed.lsn);
            }
        }

        let mut closed = Vec::new();
        for (id, client) in state.clients.iter() {
            if !client.identity.can_see(activity) || client.identity.is_muted_for(activity) {
                continue;
            }
            match client.sender.try_send(activity.clone()) {
                Ok(()) => {
                    metrics::counter!("stratum_stream_delivered_total").increment(1);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow client: close its channel instead of dropping the
                    // activity, so the overflow is observable and the client
                    // reconnects with its last seen offset.
                    metrics::counter!("stratum_stream_overflow_disconnects_total").increment(1);
                    tracing::warn!(client_id = id, lsn = %activity.lsn, "client queue full, closing stream");
                    closed.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(id);
                }
            }
        }
        if !closed.is_empty() {
            for id in closed {
                state.clients.remove(id);
            }
            metrics::gauge!("stratum_stream_clients").set(state.clients.len() as f64);
        }
    }
}

#[async_trait]
impl ActivitySubscriber for StreamGateway {
    fn name(&self) -> &'static str {
        "stream-gateway"
    }

    // Fan-out never fails the pipeline: slow or gone clients are handled
    // locally, so the dispatcher never retries on the gateway's account.
    async fn deliver(&self, activity: &Activity) -> Result<(), SubscriberError> {
        self.publish(activity);
        Ok(())
    }
}

/// Drops the client registration when the subscription goes away.
#[derive(Debug)]
struct SubscriptionGuard {
    gateway: Weak<StreamGateway>,
    client_id: usize,
    token: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(gateway) = self.gateway.upgrade() {
            gateway.remove_client(self.client_id, self.token);
        }
    }
}

/// Live side of a stream connection.
#[derive(Debug)]
pub struct LiveSubscription {
    receiver: mpsc::Receiver<Activity>,
    _guard: SubscriptionGuard,
}

impl LiveSubscription {
    pub async fn recv(&mut self) -> Option<Activity> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Activity, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}
