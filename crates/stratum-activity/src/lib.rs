//! Activity dispatch: maps change events to domain activities and delivers
//! them to subscribers with bounded retry and dead-lettering.
//!
//! # Purpose
//! Sits between the replication listener (stratum-cdc) and everything that
//! consumes derived state: live stream clients, denormalized counters. One
//! poison event never blocks the pipeline; after retries are exhausted the
//! event is persisted to the dead-letter store and the stream advances.
//!
//! # Key invariants
//! - Handling is idempotent per LSN: the same event applied twice leaves the
//!   same downstream state as applied once.
//! - A dead letter is uniquely keyed by LSN; re-recording updates the entry.
//! - Dead letters are retained for audit after resolution, never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_cdc::{ChangeEvent, ChangeOp, Lsn};
use stratum_core::ids::{EntityId, TenantId};
use thiserror::Error;

pub mod bus;
pub mod counter;
pub mod dead_letter;
pub mod replay;

pub use bus::{ActivityBus, ActivitySubscriber, DispatchOutcome, RetryPolicy, SubscriberError};
pub use counter::ActivityCounters;
pub use dead_letter::memory::MemoryDeadLetterStore;
pub use dead_letter::postgres::PgDeadLetterStore;
pub use dead_letter::{DeadLetter, DeadLetterStore};
pub use replay::DeadLetterReplayer;

pub type Result<T> = std::result::Result<T, ActivityError>;

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("no dead letter recorded for lsn {0}")]
    NotFound(Lsn),
    /// The original change event is no longer retained, so replay cannot
    /// reconstruct it.
    #[error("change event {0} unavailable for replay")]
    EventUnavailable(Lsn),
    /// A manual replay failed again; `retry_count` was incremented and
    /// `resolved` left false. Requires operator attention.
    #[error("replay of lsn {lsn} failed: {message}")]
    ReplayFailed { lsn: Lsn, message: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// What a change event means in domain terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    MembershipCreated,
    MembershipUpdated,
    MembershipRemoved,
}

/// One domain activity derived from a change event.
///
/// Carries enough denormalized identity (`tenant_id`, `is_public`) for the
/// stream gateway to apply read predicates without a store round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub lsn: Lsn,
    pub kind: ActivityKind,
    pub table: String,
    pub entity_id: Option<EntityId>,
    pub tenant_id: Option<TenantId>,
    pub is_public: bool,
    pub payload: serde_json::Value,
    pub commit_ts: DateTime<Utc>,
}

const MEMBERSHIPS_TABLE: &str = "memberships";

fn parse_id<T>(image: &serde_json::Value, key: &str, wrap: fn(uuid::Uuid) -> T) -> Option<T> {
    image
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .map(wrap)
}

/// Map a change event to its domain activities.
///
/// Deletes are described by the `before` image, everything else by `after`.
/// An event with no row image still yields one activity with an empty
/// payload: subscribers decide relevance, the mapper never drops events.
pub fn activities_for(event: &ChangeEvent) -> Vec<Activity> {
    let image = match event.op {
        ChangeOp::Delete => event.before.as_ref(),
        ChangeOp::Insert | ChangeOp::Update => event.after.as_ref(),
    };
    let kind = if event.table == MEMBERSHIPS_TABLE {
        match event.op {
            ChangeOp::Insert => ActivityKind::MembershipCreated,
            ChangeOp::Update => ActivityKind::MembershipUpdated,
            ChangeOp::Delete => ActivityKind::MembershipRemoved,
        }
    } else {
        match event.op {
            ChangeOp::Insert => ActivityKind::EntityCreated,
            ChangeOp::Update => ActivityKind::EntityUpdated,
            ChangeOp::Delete => ActivityKind::EntityDeleted,
        }
    };
    let payload = image.cloned().unwrap_or(serde_json::Value::Null);
    vec![Activity {
        lsn: event.lsn,
        kind,
        table: event.table.clone(),
        entity_id: image.and_then(|i| parse_id(i, "id", EntityId::from_uuid)),
        tenant_id: image.and_then(|i| parse_id(i, "tenant_id", TenantId::from_uuid)),
        is_public: image
            .and_then(|i| i.get("is_public"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        payload,
        commit_ts: event.commit_ts,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(table: &str, op: ChangeOp, image: serde_json::Value) -> ChangeEvent {
        let (before, after) = match op {
            ChangeOp::Delete => (Some(image), None),
            _ => (None, Some(image)),
        };
        ChangeEvent {
            lsn: Lsn(7),
            table: table.to_string(),
            op,
            before,
            after,
            commit_ts: Utc::now(),
        }
    }

    #[test]
    fn task_update_maps_to_entity_updated() {
        let id = EntityId::new();
        let tenant = TenantId::new();
        let activities = activities_for(&event(
            "tasks",
            ChangeOp::Update,
            serde_json::json!({
                "id": id.to_string(),
                "tenant_id": tenant.to_string(),
                "status": "done"
            }),
        ));
        assert_eq!(activities.len(), 1);
        let activity = &activities[0];
        assert_eq!(activity.kind, ActivityKind::EntityUpdated);
        assert_eq!(activity.lsn, Lsn(7));
        assert_eq!(activity.entity_id, Some(id));
        assert_eq!(activity.tenant_id, Some(tenant));
        assert!(!activity.is_public);
    }

    #[test]
    fn membership_rows_map_to_membership_activities() {
        let activities = activities_for(&event(
            "memberships",
            ChangeOp::Insert,
            serde_json::json!({"user_id": "x"}),
        ));
        assert_eq!(activities[0].kind, ActivityKind::MembershipCreated);

        let removed = activities_for(&event(
            "memberships",
            ChangeOp::Delete,
            serde_json::json!({"user_id": "x"}),
        ));
        assert_eq!(removed[0].kind, ActivityKind::MembershipRemoved);
    }

    #[test]
    fn delete_uses_before_image() {
        let id = EntityId::new();
        let activities = activities_for(&event(
            "projects",
            ChangeOp::Delete,
            serde_json::json!({"id": id.to_string(), "is_public": true}),
        ));
        assert_eq!(activities[0].kind, ActivityKind::EntityDeleted);
        assert_eq!(activities[0].entity_id, Some(id));
        assert!(activities[0].is_public);
    }
}
