//! Persistent outbound change queue (`syncQueue`).
//!
//! Every mutation is a read-modify-write of the whole queue record inside
//! one store transaction, so engines sharing a store never lose each
//! other's updates.

use crate::error::SyncResult;
use crate::hybrid_storage::HybridStorage;
use crate::types::SyncItem;
use tailor_storage::keys;

/// What happened to an item after a failed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FailureOutcome {
    pub attempts: u32,
    pub retired: bool,
}

pub(crate) struct SyncQueue {
    storage: HybridStorage,
}

impl SyncQueue {
    pub fn new(storage: HybridStorage) -> Self {
        Self { storage }
    }

    pub fn load(&self) -> SyncResult<Vec<SyncItem>> {
        Ok(self
            .storage
            .read_local::<Vec<SyncItem>>(keys::SYNC_QUEUE)?
            .unwrap_or_default())
    }

    fn modify<T>(&self, f: impl FnMut(&mut Vec<SyncItem>) -> T) -> SyncResult<T> {
        self.storage.update_local(keys::SYNC_QUEUE, f)
    }

    pub fn push(&self, item: SyncItem) -> SyncResult<()> {
        self.modify(|queue| queue.push(item.clone()))
    }

    pub fn get(&self, id: &str) -> SyncResult<Option<SyncItem>> {
        Ok(self.load()?.into_iter().find(|item| item.id == id))
    }

    /// Unsynced items, oldest first.
    pub fn pending(&self) -> SyncResult<Vec<SyncItem>> {
        let mut pending: Vec<SyncItem> =
            self.load()?.into_iter().filter(|item| !item.synced).collect();
        pending.sort_by_key(|item| item.created_at);
        Ok(pending)
    }

    /// Marks an uploaded item synced and removes it from the queue.
    pub fn complete(&self, id: &str) -> SyncResult<Option<SyncItem>> {
        self.modify(|queue| {
            let idx = queue.iter().position(|item| item.id == id)?;
            let mut item = queue.remove(idx);
            item.synced = true;
            Some(item)
        })
    }

    /// Counts a failed attempt, dropping the item once it reaches `max_attempts`.
    pub fn record_failure(
        &self,
        id: &str,
        error: &str,
        max_attempts: u32,
    ) -> SyncResult<Option<FailureOutcome>> {
        self.modify(|queue| {
            let idx = queue.iter().position(|item| item.id == id)?;
            let retired = queue[idx].record_failure(error, max_attempts);
            let attempts = queue[idx].attempts;
            if retired {
                queue.remove(idx);
            }
            Some(FailureOutcome { attempts, retired })
        })
    }
}
