//! In-memory dead-letter store for tests and single-process deployments.

use ahash::RandomState;
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use stratum_cdc::Lsn;

use crate::dead_letter::{DeadLetter, DeadLetterStore};
use crate::{ActivityError, Result};

#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    entries: RwLock<HashMap<Lsn, DeadLetter, RandomState>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn record(
        &self,
        lsn: Lsn,
        message: &str,
        code: Option<&str>,
        attempts: u32,
    ) -> Result<DeadLetter> {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(lsn)
            .and_modify(|existing| {
                existing.message = message.to_string();
                existing.code = code.map(str::to_string);
                existing.retry_count += attempts;
            })
            .or_insert_with(|| DeadLetter {
                lsn,
                message: message.to_string(),
                code: code.map(str::to_string),
                retry_count: attempts,
                resolved: false,
            });
        Ok(entry.clone())
    }

    async fn get(&self, lsn: Lsn) -> Result<Option<DeadLetter>> {
        Ok(self.entries.read().get(&lsn).cloned())
    }

    async fn list_unresolved(&self) -> Result<Vec<DeadLetter>> {
        let mut entries: Vec<DeadLetter> = self
            .entries
            .read()
            .values()
            .filter(|entry| !entry.resolved)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.lsn);
        Ok(entries)
    }

    async fn list_all(&self) -> Result<Vec<DeadLetter>> {
        let mut entries: Vec<DeadLetter> = self.entries.read().values().cloned().collect();
        entries.sort_by_key(|entry| entry.lsn);
        Ok(entries)
    }

    async fn resolve(&self, lsn: Lsn) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&lsn).ok_or(ActivityError::NotFound(lsn))?;
        entry.resolved = true;
        Ok(())
    }
}
