//! Denormalized per-entity activity counters.
//!
//! The canonical example of an idempotent subscriber: each entity tracks the
//! last LSN it applied, so redelivery and replay of the same event leave the
//! count unchanged.

use ahash::RandomState;
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use stratum_cdc::Lsn;
use stratum_core::ids::EntityId;

use crate::bus::{ActivitySubscriber, SubscriberError};
use crate::Activity;

#[derive(Debug, Clone, Copy, Default)]
struct CounterState {
    count: u64,
    last_applied: Lsn,
}

#[derive(Debug, Default)]
pub struct ActivityCounters {
    state: RwLock<HashMap<EntityId, CounterState, RandomState>>,
}

impl ActivityCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of activities applied for one entity.
    pub fn count(&self, entity: EntityId) -> u64 {
        self.state
            .read()
            .get(&entity)
            .map(|state| state.count)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ActivitySubscriber for ActivityCounters {
    fn name(&self) -> &'static str {
        "activity-counters"
    }

    async fn deliver(&self, activity: &Activity) -> Result<(), SubscriberError> {
        let Some(entity_id) = activity.entity_id else {
            // Activities without a row id (e.g. truncated images) have no
            // counter to advance.
            return Ok(());
        };
        let mut state = self.state.write();
        let entry = state.entry(entity_id).or_default();
        // Monotonic LSN comparison makes replay a no-op.
        if activity.lsn <= entry.last_applied {
            return Ok(());
        }
        entry.count += 1;
        entry.last_applied = activity.lsn;
        Ok(())
    }
}
