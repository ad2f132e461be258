//! Guard Store Adapter
//!
//! The store exclusively owns durable guard state. Guards never cache counts
//! or nonce maxima between calls; every decision is made against the store
//! through one of its atomic primitives:
//!
//! - [`GuardStore::upsert_and_increment`] for rate buckets (single step)
//! - [`QuotaScope`] for the per-class count-then-insert
//! - [`LedgerScope`] for the per-ledger read-max-then-insert
//!
//! A scope holds the store's lock for its key from creation until
//! [`commit`](QuotaScope::commit). Dropping a scope without committing rolls
//! back anything it wrote.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use super::outcome::StoreError;

/// Discrete time-bucket key (epoch seconds divided by the bucket width)
pub type BucketKey = i64;

/// Durable ledger record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry identifier
    pub entry_id: String,

    /// Logical stream identifier
    pub ledger_id: String,

    /// Opaque payload reference
    pub block_id: String,

    /// Caller-supplied sequence marker
    pub nonce: i64,

    /// Time the entry was committed
    pub inserted_at: DateTime<Utc>,
}

/// Rows removed by a retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub buckets_removed: u64,
    pub usage_records_removed: u64,
}

/// Atomic count-then-insert scope for one operation class
#[async_trait]
pub trait QuotaScope: Send {
    /// Number of usage records for this class strictly newer than `newer_than`
    async fn count_where(&mut self, newer_than: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Record one usage at `at`
    async fn insert(&mut self, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Make the scope's writes durable and release the class
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Atomic read-max-then-insert scope for one ledger
#[async_trait]
pub trait LedgerScope: Send {
    /// Highest nonce stored for this ledger
    async fn max_nonce(&mut self) -> Result<Option<i64>, StoreError>;

    /// Insert an entry; returns [`StoreError::Conflict`] if `(ledger, nonce)`
    /// already exists
    async fn insert_entry(
        &mut self,
        block_id: &str,
        nonce: i64,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, StoreError>;

    /// Make the scope's writes durable and release the ledger
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Store capability set consumed by the guards
#[async_trait]
pub trait GuardStore: Send + Sync + Debug {
    /// Increment the bucket's counter (creating it at 1) and return the
    /// post-increment value, as one atomic step
    async fn upsert_and_increment(&self, bucket: BucketKey) -> Result<u64, StoreError>;

    /// Open the atomic scope for an operation class
    async fn quota_scope(&self, class: &str) -> Result<Box<dyn QuotaScope>, StoreError>;

    /// Open the atomic scope for a ledger
    async fn ledger_scope(&self, ledger_id: &str) -> Result<Box<dyn LedgerScope>, StoreError>;

    /// Current bucket count (observation only)
    async fn bucket_count(&self, bucket: BucketKey) -> Result<Option<u64>, StoreError>;

    /// Rolling usage for a class (observation only)
    async fn usage_count(&self, class: &str, newer_than: DateTime<Utc>)
        -> Result<u64, StoreError>;

    /// All entries of a ledger in commit order
    async fn ledger_entries(&self, ledger_id: &str) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Highest committed nonce of a ledger (observation only)
    async fn ledger_head(&self, ledger_id: &str) -> Result<Option<i64>, StoreError>;

    /// Every ledger identifier with at least one entry
    async fn ledger_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Delete buckets keyed before `buckets_before` and usage records at or
    /// before `usage_before`. Ledger entries are never pruned.
    async fn prune(
        &self,
        buckets_before: BucketKey,
        usage_before: DateTime<Utc>,
    ) -> Result<PruneReport, StoreError>;
}
