//! Durable record of events that exhausted their retries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratum_cdc::Lsn;

use crate::Result;

pub mod memory;
pub mod postgres;

/// A poison event, keyed by its LSN.
///
/// Entries are retained for audit after resolution; `resolved` flips to true
/// on successful replay but nothing is ever deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub lsn: Lsn,
    pub message: String,
    pub code: Option<String>,
    pub retry_count: u32,
    pub resolved: bool,
}

/// Persistence for dead letters.
///
/// `record` is an upsert: re-recording an LSN adds `attempts` to the stored
/// retry count and replaces the message, never creating a duplicate row.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(
        &self,
        lsn: Lsn,
        message: &str,
        code: Option<&str>,
        attempts: u32,
    ) -> Result<DeadLetter>;

    async fn get(&self, lsn: Lsn) -> Result<Option<DeadLetter>>;

    /// Unresolved entries in LSN order, for the operational inspection API.
    async fn list_unresolved(&self) -> Result<Vec<DeadLetter>>;

    /// Every entry, resolved included, in LSN order (audit view).
    async fn list_all(&self) -> Result<Vec<DeadLetter>>;

    async fn resolve(&self, lsn: Lsn) -> Result<()>;
}
