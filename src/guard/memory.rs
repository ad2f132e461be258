//! In-Memory Guard Store
//!
//! Process-local [`GuardStore`] for tests and single-process deployments.
//! Each operation class and each ledger gets its own `tokio` mutex; a scope
//! owns that mutex guard for its whole lifetime, so scopes on the same key
//! run one at a time while different keys proceed independently.
//!
//! Only scopes create per-key slots. A slot left empty when its last scope
//! ends is dropped again, and reads never create one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard as SyncMutexGuard, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::outcome::StoreError;
use super::store::{BucketKey, GuardStore, LedgerEntry, LedgerScope, PruneReport, QuotaScope};

type Slot<T> = Arc<Mutex<Vec<T>>>;

/// Key to slot map. Held only for lookups, never across an await.
type SlotMap<T> = Arc<SyncMutex<HashMap<String, Slot<T>>>>;

/// In-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    /// Rate bucket counters
    buckets: Arc<RwLock<HashMap<BucketKey, u64>>>,

    /// Usage timestamps per operation class
    usage: SlotMap<DateTime<Utc>>,

    /// Entries per ledger, in commit order
    ledgers: SlotMap<LedgerEntry>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> (usize, usize) {
        (lock_map(&self.usage).len(), lock_map(&self.ledgers).len())
    }
}

fn lock_map<T>(map: &SlotMap<T>) -> SyncMutexGuard<'_, HashMap<String, Slot<T>>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

fn existing_slot<T>(map: &SlotMap<T>, key: &str) -> Option<Slot<T>> {
    lock_map(map).get(key).cloned()
}

/// Lock the slot for `key`, creating it if needed
async fn hold_slot<T>(map: &SlotMap<T>, key: &str) -> SlotGuard<T> {
    let slot = lock_map(map)
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
        .clone();
    SlotGuard {
        key: key.to_string(),
        map: map.clone(),
        entries: slot.lock_owned().await,
    }
}

/// Exclusive hold on one slot
struct SlotGuard<T> {
    key: String,
    map: SlotMap<T>,
    entries: OwnedMutexGuard<Vec<T>>,
}

impl<T> Deref for SlotGuard<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        &self.entries
    }
}

impl<T> DerefMut for SlotGuard<T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.entries
    }
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            return;
        }
        let mut map = lock_map(&self.map);
        // Two references: the map's and the one inside this guard
        let unshared = map
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 2);
        if unshared {
            map.remove(&self.key);
        }
    }
}

struct MemoryQuotaScope {
    committed: SlotGuard<DateTime<Utc>>,
    pending: Vec<DateTime<Utc>>,
}

#[async_trait]
impl QuotaScope for MemoryQuotaScope {
    async fn count_where(&mut self, newer_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let count = self
            .committed
            .iter()
            .chain(self.pending.iter())
            .filter(|ts| **ts > newer_than)
            .count();
        Ok(count as u64)
    }

    async fn insert(&mut self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.pending.push(at);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let pending = std::mem::take(&mut self.pending);
        self.committed.extend(pending);
        Ok(())
    }
}

struct MemoryLedgerScope {
    ledger_id: String,
    committed: SlotGuard<LedgerEntry>,
    pending: Vec<LedgerEntry>,
}

#[async_trait]
impl LedgerScope for MemoryLedgerScope {
    async fn max_nonce(&mut self) -> Result<Option<i64>, StoreError> {
        Ok(self
            .committed
            .iter()
            .chain(self.pending.iter())
            .map(|e| e.nonce)
            .max())
    }

    async fn insert_entry(
        &mut self,
        block_id: &str,
        nonce: i64,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, StoreError> {
        let duplicate = self
            .committed
            .iter()
            .chain(self.pending.iter())
            .any(|e| e.nonce == nonce);
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "ledger {} already holds nonce {}",
                self.ledger_id, nonce
            )));
        }

        let entry = LedgerEntry {
            entry_id: uuid::Uuid::new_v4().to_string(),
            ledger_id: self.ledger_id.clone(),
            block_id: block_id.to_string(),
            nonce,
            inserted_at: at,
        };
        self.pending.push(entry.clone());
        Ok(entry)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let pending = std::mem::take(&mut self.pending);
        self.committed.extend(pending);
        Ok(())
    }
}

#[async_trait]
impl GuardStore for MemoryStore {
    async fn upsert_and_increment(&self, bucket: BucketKey) -> Result<u64, StoreError> {
        let mut buckets = self.buckets.write().await;
        let count = buckets.entry(bucket).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn quota_scope(&self, class: &str) -> Result<Box<dyn QuotaScope>, StoreError> {
        Ok(Box::new(MemoryQuotaScope {
            committed: hold_slot(&self.usage, class).await,
            pending: Vec::new(),
        }))
    }

    async fn ledger_scope(&self, ledger_id: &str) -> Result<Box<dyn LedgerScope>, StoreError> {
        Ok(Box::new(MemoryLedgerScope {
            ledger_id: ledger_id.to_string(),
            committed: hold_slot(&self.ledgers, ledger_id).await,
            pending: Vec::new(),
        }))
    }

    async fn bucket_count(&self, bucket: BucketKey) -> Result<Option<u64>, StoreError> {
        Ok(self.buckets.read().await.get(&bucket).copied())
    }

    async fn usage_count(
        &self,
        class: &str,
        newer_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let Some(records) = existing_slot(&self.usage, class) else {
            return Ok(0);
        };
        let records = records.lock().await;
        Ok(records.iter().filter(|ts| **ts > newer_than).count() as u64)
    }

    async fn ledger_entries(&self, ledger_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        match existing_slot(&self.ledgers, ledger_id) {
            Some(entries) => Ok(entries.lock().await.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn ledger_head(&self, ledger_id: &str) -> Result<Option<i64>, StoreError> {
        match existing_slot(&self.ledgers, ledger_id) {
            Some(entries) => Ok(entries.lock().await.iter().map(|e| e.nonce).max()),
            None => Ok(None),
        }
    }

    async fn ledger_ids(&self) -> Result<Vec<String>, StoreError> {
        let slots: Vec<(String, Slot<LedgerEntry>)> = lock_map(&self.ledgers)
            .iter()
            .map(|(id, entries)| (id.clone(), entries.clone()))
            .collect();

        let mut ids = Vec::new();
        for (id, entries) in slots {
            if !entries.lock().await.is_empty() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn prune(
        &self,
        buckets_before: BucketKey,
        usage_before: DateTime<Utc>,
    ) -> Result<PruneReport, StoreError> {
        let mut report = PruneReport::default();

        {
            let mut buckets = self.buckets.write().await;
            let before = buckets.len();
            buckets.retain(|key, _| *key >= buckets_before);
            report.buckets_removed = (before - buckets.len()) as u64;
        }

        let slots: Vec<Slot<DateTime<Utc>>> = lock_map(&self.usage).values().cloned().collect();
        for records in slots {
            let mut records = records.lock().await;
            let before = records.len();
            records.retain(|ts| *ts > usage_before);
            report.usage_records_removed += (before - records.len()) as u64;
        }

        // Drop classes that are now empty and not held by anyone
        lock_map(&self.usage).retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot.try_lock().map(|records| !records.is_empty()).unwrap_or(true)
        });

        Ok(report)
    }
}
