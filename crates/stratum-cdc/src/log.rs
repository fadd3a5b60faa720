//! The resumable ordered change log.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

use crate::{CdcError, ChangeEvent, ChangeOp, Lsn, Result};

const DEFAULT_LOG_CAPACITY: usize = 4096;

/// A durable, ordered, replayable event log with resume-from-position reads.
///
/// One logical writer appends; readers consume independently by position.
/// `read_from` never blocks: an empty result means the reader caught up, and
/// `wait_for_events` parks until the tail moves past the given position.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Append a change, assigning the next LSN. Returns the assigned LSN.
    async fn append(
        &self,
        table: &str,
        op: ChangeOp,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Lsn;

    /// Events with `lsn >= from`, at most `max`, in LSN order.
    async fn read_from(&self, from: Lsn, max: usize) -> Result<Vec<ChangeEvent>>;

    /// Fetch one event by its exact LSN (used by dead-letter replay).
    async fn get(&self, lsn: Lsn) -> Result<Option<ChangeEvent>>;

    /// The next LSN that will be assigned.
    fn tail(&self) -> Lsn;

    /// Resolves once at least one event with `lsn >= from` exists.
    async fn wait_for_events(&self, from: Lsn);
}

#[derive(Debug)]
struct LogState {
    // Bounded log; oldest entries are trimmed as new ones arrive.
    log: VecDeque<ChangeEvent>,
    // Next LSN to assign. LSN 0 is never assigned, so resume-from-zero
    // always means "from the beginning of retained history".
    next_lsn: Lsn,
}

/// In-memory bounded change log.
#[derive(Debug)]
pub struct MemoryChangeLog {
    state: Mutex<LogState>,
    capacity: usize,
    appended: Notify,
}

impl Default for MemoryChangeLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LogState {
                log: VecDeque::new(),
                next_lsn: Lsn(1),
            }),
            capacity,
            appended: Notify::new(),
        }
    }

    fn oldest_retained(state: &LogState) -> Lsn {
        state
            .log
            .front()
            .map(|event| event.lsn)
            .unwrap_or(state.next_lsn)
    }
}

#[async_trait]
impl ChangeLog for MemoryChangeLog {
    async fn append(
        &self,
        table: &str,
        op: ChangeOp,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Lsn {
        let lsn = {
            let mut state = self.state.lock();
            let lsn = state.next_lsn;
            state.next_lsn = lsn.next();
            state.log.push_back(ChangeEvent {
                lsn,
                table: table.to_string(),
                op,
                before,
                after,
                commit_ts: Utc::now(),
            });
            // Trim once after append to keep the newest `capacity` entries.
            let overflow = state.log.len().saturating_sub(self.capacity);
            if overflow > 0 {
                state.log.drain(..overflow);
            }
            lsn
        };
        metrics::counter!("stratum_cdc_appended_total").increment(1);
        self.appended.notify_waiters();
        lsn
    }

    async fn read_from(&self, from: Lsn, max: usize) -> Result<Vec<ChangeEvent>> {
        let state = self.state.lock();
        let oldest = Self::oldest_retained(&state);
        // An error only when assigned events in [from, oldest) were trimmed;
        // LSN 0 is never assigned, so clamp before comparing.
        if from.0.max(1) < oldest.0 {
            return Err(CdcError::OffsetTooOld {
                oldest,
                requested: from,
            });
        }
        Ok(state
            .log
            .iter()
            .filter(|event| event.lsn >= from)
            .take(max)
            .cloned()
            .collect())
    }

    async fn get(&self, lsn: Lsn) -> Result<Option<ChangeEvent>> {
        let state = self.state.lock();
        Ok(state.log.iter().find(|event| event.lsn == lsn).cloned())
    }

    fn tail(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    async fn wait_for_events(&self, from: Lsn) {
        loop {
            // Register before checking, so an append between check and await
            // is not missed.
            let notified = self.appended.notified();
            if self.tail() > from {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lsns_are_assigned_monotonically_from_one() {
        let log = MemoryChangeLog::new();
        let first = log.append("tasks", ChangeOp::Insert, None, None).await;
        let second = log.append("tasks", ChangeOp::Update, None, None).await;
        assert_eq!(first, Lsn(1));
        assert_eq!(second, Lsn(2));
        assert_eq!(log.tail(), Lsn(3));
    }

    #[tokio::test]
    async fn read_from_returns_suffix_in_order() {
        let log = MemoryChangeLog::new();
        for _ in 0..5 {
            log.append("tasks", ChangeOp::Insert, None, None).await;
        }
        let events = log.read_from(Lsn(3), 16).await.expect("read");
        let lsns: Vec<Lsn> = events.iter().map(|e| e.lsn).collect();
        assert_eq!(lsns, vec![Lsn(3), Lsn(4), Lsn(5)]);
    }

    #[tokio::test]
    async fn trimmed_history_yields_offset_too_old() {
        let log = MemoryChangeLog::with_capacity(2);
        for _ in 0..5 {
            log.append("tasks", ChangeOp::Insert, None, None).await;
        }
        // Entries 1..=3 were trimmed.
        let err = log.read_from(Lsn(1), 16).await.expect_err("too old");
        assert!(matches!(
            err,
            CdcError::OffsetTooOld {
                oldest: Lsn(4),
                requested: Lsn(1)
            }
        ));
        // The retained suffix is still readable.
        let events = log.read_from(Lsn(4), 16).await.expect("read");
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn wait_for_events_wakes_on_append() {
        let log = std::sync::Arc::new(MemoryChangeLog::new());
        let waiter = {
            let log = std::sync::Arc::clone(&log);
            tokio::spawn(async move {
                log.wait_for_events(Lsn(1)).await;
                log.tail()
            })
        };
        tokio::task::yield_now().await;
        log.append("tasks", ChangeOp::Insert, None, None).await;
        let tail = waiter.await.expect("join");
        assert_eq!(tail, Lsn(2));
    }
}
