//! Store double that fails at a chosen step

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::memory::MemoryStore;
use super::outcome::StoreError;
use super::store::{BucketKey, GuardStore, LedgerEntry, LedgerScope, PruneReport, QuotaScope};

/// Step at which [`FailingStore`] reports the store as unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Increment,
    OpenScope,
    Count,
    Insert,
    Commit,
}

/// [`MemoryStore`] that fails one kind of call with `Unavailable`
///
/// Reads made outside a scope always succeed, so tests can inspect what
/// the failed call left behind.
#[derive(Debug, Clone)]
pub struct FailingStore {
    pub inner: MemoryStore,
    fail_at: FailAt,
}

impl FailingStore {
    pub fn new(fail_at: FailAt) -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_at,
        }
    }
}

fn down(step: FailAt) -> StoreError {
    StoreError::Unavailable(format!("connection lost during {:?}", step))
}

fn fail_if(configured: FailAt, step: FailAt) -> Result<(), StoreError> {
    if configured == step {
        Err(down(step))
    } else {
        Ok(())
    }
}

struct FailingQuotaScope {
    inner: Box<dyn QuotaScope>,
    fail_at: FailAt,
}

#[async_trait]
impl QuotaScope for FailingQuotaScope {
    async fn count_where(&mut self, newer_than: DateTime<Utc>) -> Result<u64, StoreError> {
        fail_if(self.fail_at, FailAt::Count)?;
        self.inner.count_where(newer_than).await
    }

    async fn insert(&mut self, at: DateTime<Utc>) -> Result<(), StoreError> {
        fail_if(self.fail_at, FailAt::Insert)?;
        self.inner.insert(at).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        // On failure the inner scope is dropped uncommitted
        fail_if(self.fail_at, FailAt::Commit)?;
        self.inner.commit().await
    }
}

struct FailingLedgerScope {
    inner: Box<dyn LedgerScope>,
    fail_at: FailAt,
}

#[async_trait]
impl LedgerScope for FailingLedgerScope {
    async fn max_nonce(&mut self) -> Result<Option<i64>, StoreError> {
        fail_if(self.fail_at, FailAt::Count)?;
        self.inner.max_nonce().await
    }

    async fn insert_entry(
        &mut self,
        block_id: &str,
        nonce: i64,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, StoreError> {
        fail_if(self.fail_at, FailAt::Insert)?;
        self.inner.insert_entry(block_id, nonce, at).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        fail_if(self.fail_at, FailAt::Commit)?;
        self.inner.commit().await
    }
}

#[async_trait]
impl GuardStore for FailingStore {
    async fn upsert_and_increment(&self, bucket: BucketKey) -> Result<u64, StoreError> {
        fail_if(self.fail_at, FailAt::Increment)?;
        self.inner.upsert_and_increment(bucket).await
    }

    async fn quota_scope(&self, class: &str) -> Result<Box<dyn QuotaScope>, StoreError> {
        fail_if(self.fail_at, FailAt::OpenScope)?;
        Ok(Box::new(FailingQuotaScope {
            inner: self.inner.quota_scope(class).await?,
            fail_at: self.fail_at,
        }))
    }

    async fn ledger_scope(&self, ledger_id: &str) -> Result<Box<dyn LedgerScope>, StoreError> {
        fail_if(self.fail_at, FailAt::OpenScope)?;
        Ok(Box::new(FailingLedgerScope {
            inner: self.inner.ledger_scope(ledger_id).await?,
            fail_at: self.fail_at,
        }))
    }

    async fn bucket_count(&self, bucket: BucketKey) -> Result<Option<u64>, StoreError> {
        self.inner.bucket_count(bucket).await
    }

    async fn usage_count(
        &self,
        class: &str,
        newer_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.inner.usage_count(class, newer_than).await
    }

    async fn ledger_entries(&self, ledger_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        self.inner.ledger_entries(ledger_id).await
    }

    async fn ledger_head(&self, ledger_id: &str) -> Result<Option<i64>, StoreError> {
        self.inner.ledger_head(ledger_id).await
    }

    async fn ledger_ids(&self) -> Result<Vec<String>, StoreError> {
        self.inner.ledger_ids().await
    }

    async fn prune(
        &self,
        buckets_before: BucketKey,
        usage_before: DateTime<Utc>,
    ) -> Result<PruneReport, StoreError> {
        self.inner.prune(buckets_before, usage_before).await
    }
}
