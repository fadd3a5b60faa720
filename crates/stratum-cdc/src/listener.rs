//! The replication listener: single reader of the change log, single writer
//! of the acknowledged position.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::log::ChangeLog;
use crate::{CdcError, ChangeEvent, Lsn, Result};

const RECONNECT_BASE: Duration = Duration::from_millis(100);
const RECONNECT_CAP: Duration = Duration::from_secs(5);

/// Downstream handler the listener feeds, one event at a time in LSN order.
///
/// `Ok(())` means the event was durably handled — dispatched to subscribers
/// or dead-lettered — and its position may be acknowledged. An error is
/// treated as transient: the listener backs off and re-delivers the same
/// event, so implementations must be idempotent per LSN.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ChangeEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
}

/// Consumes the change log in strictly increasing LSN order and advances the
/// acknowledged position only after the handler confirms durable handling.
///
/// The acknowledged position has single-writer discipline: nothing else in
/// the process mutates it.
pub struct ReplicationListener<L, H> {
    log: Arc<L>,
    handler: Arc<H>,
    // Next position to consume; last acknowledged is this minus one.
    position: AtomicU64,
    state: Mutex<ListenerState>,
    batch_size: usize,
    shutdown: Notify,
}

impl<L, H> ReplicationListener<L, H>
where
    L: ChangeLog,
    H: EventHandler,
{
    pub fn new(log: Arc<L>, handler: Arc<H>, batch_size: usize) -> Self {
        Self::resuming_from(log, handler, batch_size, Lsn::ZERO)
    }

    /// Resume from a previously acknowledged position (crash recovery).
    pub fn resuming_from(log: Arc<L>, handler: Arc<H>, batch_size: usize, acked: Lsn) -> Self {
        Self {
            log,
            handler,
            position: AtomicU64::new(acked.next().get()),
            state: Mutex::new(ListenerState::Disconnected),
            batch_size: batch_size.max(1),
            shutdown: Notify::new(),
        }
    }

    /// Last acknowledged LSN; `Lsn::ZERO` before anything was handled.
    pub fn acked_lsn(&self) -> Lsn {
        Lsn(self.position.load(Ordering::Acquire).saturating_sub(1))
    }

    /// Next position the listener will consume.
    pub fn position(&self) -> Lsn {
        Lsn(self.position.load(Ordering::Acquire))
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    /// Request termination of [`run`](Self::run).
    ///
    /// The signal is retained until observed (`notify_one` stores a permit),
    /// so calling this before `run` starts, or while it is mid-batch rather
    /// than parked, still terminates the loop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.lock() = state;
    }

    /// Drain currently available events once. Returns the number handled.
    ///
    /// On a handler error the position stays at the failed event, so the next
    /// call re-delivers it — never skips past unacknowledged events.
    pub async fn run_once(&self) -> Result<usize> {
        let from = self.position();
        let batch = self.log.read_from(from, self.batch_size).await?;
        let mut handled = 0;
        for event in &batch {
            self.handler.handle(event).await?;
            // Ack only after durable handling, one event at a time.
            self.position.store(event.lsn.next().get(), Ordering::Release);
            metrics::gauge!("stratum_cdc_acked_lsn").set(event.lsn.get() as f64);
            handled += 1;
        }
        if handled > 0 {
            metrics::counter!("stratum_cdc_handled_total").increment(handled as u64);
        }
        Ok(handled)
    }

    /// Stream until [`shutdown`](Self::shutdown) is called.
    ///
    /// Transient errors reconnect with capped exponential backoff and resume
    /// from the last acknowledged position. A trimmed resume position is
    /// unrecoverable for this slot and terminates the run.
    pub async fn run(&self) -> Result<()> {
        self.set_state(ListenerState::Connecting);
        let mut backoff = RECONNECT_BASE;
        loop {
            self.set_state(ListenerState::Streaming);
            match self.run_once().await {
                Ok(_) => {
                    backoff = RECONNECT_BASE;
                    tokio::select! {
                        _ = self.shutdown.notified() => {
                            self.set_state(ListenerState::Disconnected);
                            return Ok(());
                        }
                        _ = self.log.wait_for_events(self.position()) => {}
                    }
                }
                Err(CdcError::Transient(reason)) => {
                    tracing::warn!(
                        %reason,
                        acked = %self.acked_lsn(),
                        backoff_ms = backoff.as_millis() as u64,
                        "replication interrupted; reconnecting"
                    );
                    metrics::counter!("stratum_cdc_reconnects_total").increment(1);
                    self.set_state(ListenerState::Reconnecting);
                    tokio::select! {
                        _ = self.shutdown.notified() => {
                            self.set_state(ListenerState::Disconnected);
                            return Ok(());
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_CAP);
                }
                Err(err @ CdcError::OffsetTooOld { .. }) => {
                    tracing::error!(error = %err, "resume position trimmed from log");
                    self.set_state(ListenerState::Disconnected);
                    return Err(err);
                }
            }
        }
    }
}
