//! The activity dispatcher.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stratum_cdc::{CdcError, ChangeEvent, EventHandler};

use crate::dead_letter::{DeadLetter, DeadLetterStore};
use crate::{activities_for, Activity, Result};

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No backoff between attempts; used by tests and replay.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        // attempt is 1-based; first retry waits base_delay.
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        (self.base_delay * factor).min(self.max_delay)
    }
}

/// A downstream delivery failure, carried into the dead letter on exhaustion.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SubscriberError {
    pub message: String,
    pub code: Option<String>,
}

impl SubscriberError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

/// A consumer of derived activities (stream gateway, counters).
///
/// Delivery is retried per event, so implementations must be idempotent with
/// respect to the activity's LSN.
#[async_trait]
pub trait ActivitySubscriber: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, activity: &Activity) -> std::result::Result<(), SubscriberError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Dispatched,
    DeadLettered(DeadLetter),
}

/// Maps change events to activities and fans them out to subscribers.
///
/// A failing event is retried per [`RetryPolicy`]; once exhausted it is
/// recorded in the dead-letter store and dispatch reports success to the
/// listener, so the stream position advances past the poison event.
pub struct ActivityBus {
    // Snapshot read on the dispatch path; registry mutated on subscribe.
    snapshot: ArcSwap<Vec<Arc<dyn ActivitySubscriber>>>,
    subscribers: Mutex<Vec<Arc<dyn ActivitySubscriber>>>,
    dead_letters: Arc<dyn DeadLetterStore>,
    retry: RetryPolicy,
}

impl ActivityBus {
    pub fn new(dead_letters: Arc<dyn DeadLetterStore>, retry: RetryPolicy) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            dead_letters,
            retry,
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ActivitySubscriber>) {
        let mut registry = self.subscribers.lock();
        registry.push(subscriber);
        self.snapshot.store(Arc::new(registry.clone()));
    }

    /// Deliver every derived activity to every subscriber, once.
    pub async fn deliver_once(
        &self,
        activities: &[Activity],
    ) -> std::result::Result<(), SubscriberError> {
        let subscribers = self.snapshot.load_full();
        for activity in activities {
            for subscriber in subscribers.iter() {
                subscriber.deliver(activity).await.map_err(|err| {
                    tracing::debug!(
                        subscriber = subscriber.name(),
                        lsn = %activity.lsn,
                        error = %err,
                        "activity delivery failed"
                    );
                    err
                })?;
            }
        }
        Ok(())
    }

    /// Dispatch one change event with retries; dead-letter on exhaustion.
    ///
    /// `Ok` means durably handled either way. The error arm is reserved for
    /// dead-letter persistence failures, which the listener treats as
    /// transient (the event stays unacknowledged).
    pub async fn dispatch(&self, event: &ChangeEvent) -> Result<DispatchOutcome> {
        let activities = activities_for(event);
        let mut last_error = None;
        for attempt in 1..=self.retry.max_attempts {
            match self.deliver_once(&activities).await {
                Ok(()) => {
                    metrics::counter!("stratum_activity_dispatched_total")
                        .increment(activities.len() as u64);
                    return Ok(DispatchOutcome::Dispatched);
                }
                Err(err) => {
                    last_error = Some(err);
                    metrics::counter!("stratum_activity_retry_total").increment(1);
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }
        // Exhausted. Persist the failure and let the stream move on.
        let error = last_error.unwrap_or_else(|| SubscriberError::new("no subscribers failed"));
        let entry = self
            .dead_letters
            .record(
                event.lsn,
                &error.message,
                error.code.as_deref(),
                self.retry.max_attempts,
            )
            .await?;
        tracing::warn!(
            lsn = %event.lsn,
            table = %event.table,
            retry_count = entry.retry_count,
            error = %error,
            "event dead-lettered after exhausting retries"
        );
        metrics::counter!("stratum_activity_dead_lettered_total").increment(1);
        Ok(DispatchOutcome::DeadLettered(entry))
    }
}

#[async_trait]
impl EventHandler for ActivityBus {
    async fn handle(&self, event: &ChangeEvent) -> stratum_cdc::Result<()> {
        // Dispatched and dead-lettered both count as durably handled; only a
        // dead-letter persistence failure keeps the event unacknowledged.
        self.dispatch(event)
            .await
            .map(|_| ())
            .map_err(|err| CdcError::Transient(err.to_string()))
    }
}
