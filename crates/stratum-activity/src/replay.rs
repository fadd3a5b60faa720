//! Operator-triggered dead-letter replay.
//!
//! Modeled as an explicit command handler so an operational tool and a test
//! harness invoke it identically.

use std::sync::Arc;

use stratum_cdc::{ChangeLog, Lsn};

use crate::bus::ActivityBus;
use crate::dead_letter::{DeadLetter, DeadLetterStore};
use crate::{activities_for, ActivityError, Result};

pub struct DeadLetterReplayer<L> {
    log: Arc<L>,
    bus: Arc<ActivityBus>,
    store: Arc<dyn DeadLetterStore>,
}

impl<L: ChangeLog> DeadLetterReplayer<L> {
    pub fn new(log: Arc<L>, bus: Arc<ActivityBus>, store: Arc<dyn DeadLetterStore>) -> Self {
        Self { log, bus, store }
    }

    /// Re-deliver the original change event for a recorded dead letter.
    ///
    /// Success marks the entry resolved (it is retained for audit). Failure
    /// increments `retry_count`, leaves `resolved` false, and surfaces as
    /// [`ActivityError::ReplayFailed`].
    pub async fn replay(&self, lsn: Lsn) -> Result<DeadLetter> {
        self.store
            .get(lsn)
            .await?
            .ok_or(ActivityError::NotFound(lsn))?;
        let event = self
            .log
            .get(lsn)
            .await
            .map_err(anyhow::Error::new)?
            .ok_or(ActivityError::EventUnavailable(lsn))?;

        let activities = activities_for(&event);
        match self.bus.deliver_once(&activities).await {
            Ok(()) => {
                self.store.resolve(lsn).await?;
                tracing::info!(%lsn, "dead letter replayed and resolved");
                metrics::counter!("stratum_activity_replayed_total").increment(1);
                self.store
                    .get(lsn)
                    .await?
                    .ok_or(ActivityError::NotFound(lsn))
            }
            Err(err) => {
                // One more failed attempt on the same entry.
                let entry = self
                    .store
                    .record(lsn, &err.message, err.code.as_deref(), 1)
                    .await?;
                tracing::warn!(%lsn, error = %err, retry_count = entry.retry_count, "dead letter replay failed");
                Err(ActivityError::ReplayFailed {
                    lsn,
                    message: err.message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ActivitySubscriber, DispatchOutcome, RetryPolicy, SubscriberError};
    use crate::counter::ActivityCounters;
    use crate::dead_letter::memory::MemoryDeadLetterStore;
    use crate::Activity;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stratum_cdc::{ChangeOp, MemoryChangeLog};
    use stratum_core::ids::EntityId;

    struct FailFirst {
        failures: AtomicU32,
    }

    #[async_trait]
    impl ActivitySubscriber for FailFirst {
        fn name(&self) -> &'static str {
            "fail-first"
        }

        async fn deliver(&self, _activity: &Activity) -> std::result::Result<(), SubscriberError> {
            let remaining = self.failures.load(Ordering::Relaxed);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::Relaxed);
                return Err(SubscriberError::new("still down"));
            }
            Ok(())
        }
    }

    // Dead-letter an event, then replay it successfully. The counter applies
    // once regardless of how many times the replay is repeated.
    #[tokio::test]
    async fn successful_replay_resolves_and_is_idempotent() {
        let log = Arc::new(MemoryChangeLog::new());
        let entity = EntityId::new();
        let lsn = log
            .append(
                "tasks",
                ChangeOp::Update,
                None,
                Some(serde_json::json!({"id": entity.to_string(), "status": "done"})),
            )
            .await;

        let store = Arc::new(MemoryDeadLetterStore::new());
        let bus = Arc::new(ActivityBus::new(
            Arc::clone(&store) as _,
            RetryPolicy::immediate(3),
        ));
        let counters = Arc::new(ActivityCounters::new());
        let gate = Arc::new(FailFirst {
            // Fails the three dispatch attempts, then recovers.
            failures: AtomicU32::new(3),
        });
        bus.subscribe(Arc::clone(&gate) as _);
        bus.subscribe(Arc::clone(&counters) as _);

        let event = log.get(lsn).await.expect("read").expect("present");
        let outcome = bus.dispatch(&event).await.expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::DeadLettered(_)));
        assert_eq!(counters.count(entity), 0);

        let replayer = DeadLetterReplayer::new(Arc::clone(&log), Arc::clone(&bus), store.clone());
        let entry = replayer.replay(lsn).await.expect("replay");
        assert!(entry.resolved);
        assert_eq!(counters.count(entity), 1);

        // Replaying again is a no-op on counter state.
        replayer.replay(lsn).await.expect("replay");
        assert_eq!(counters.count(entity), 1);
    }

    #[tokio::test]
    async fn failed_replay_increments_retry_count_and_stays_unresolved() {
        let log = Arc::new(MemoryChangeLog::new());
        let lsn = log
            .append("tasks", ChangeOp::Update, None, Some(serde_json::json!({})))
            .await;

        let store = Arc::new(MemoryDeadLetterStore::new());
        let bus = Arc::new(ActivityBus::new(
            Arc::clone(&store) as _,
            RetryPolicy::immediate(3),
        ));
        bus.subscribe(Arc::new(FailFirst {
            failures: AtomicU32::new(u32::MAX),
        }) as _);

        let event = log.get(lsn).await.expect("read").expect("present");
        bus.dispatch(&event).await.expect("dispatch");

        let replayer = DeadLetterReplayer::new(Arc::clone(&log), Arc::clone(&bus), store.clone());
        let err = replayer.replay(lsn).await.expect_err("fails again");
        assert!(matches!(err, ActivityError::ReplayFailed { .. }));
        let entry = store.get(lsn).await.expect("get").expect("present");
        assert_eq!(entry.retry_count, 4);
        assert!(!entry.resolved);
    }

    #[tokio::test]
    async fn replay_of_unknown_lsn_is_not_found() {
        let log = Arc::new(MemoryChangeLog::new());
        let store = Arc::new(MemoryDeadLetterStore::new());
        let bus = Arc::new(ActivityBus::new(
            Arc::clone(&store) as _,
            RetryPolicy::default(),
        ));
        let replayer = DeadLetterReplayer::new(log, bus, store as _);
        let err = replayer.replay(Lsn(42)).await.expect_err("missing");
        assert!(matches!(err, ActivityError::NotFound(Lsn(42))));
    }
}
