//! SQLite Guard Store
//!
//! Durable [`GuardStore`] on a single SQLite file. Several processes (or
//! several `SqliteStore` handles in one process) may share the file:
//!
//! - Rate buckets use one `INSERT .. ON CONFLICT DO UPDATE .. RETURNING`
//!   statement, so the increment and the read-back are the same step.
//! - Quota and ledger scopes run inside `BEGIN IMMEDIATE` transactions. The
//!   write lock is taken before the first read, so a competing scope blocks
//!   (up to the busy timeout) until this one commits or rolls back.
//! - `(ledger_id, nonce)` is a `UNIQUE` key; a duplicate insert surfaces as
//!   [`StoreError::Conflict`].
//!
//! Every statement runs on a `spawn_blocking` thread. A scope owns its
//! connection between statements and hands it to the blocking pool for each
//! one, so a writer waiting on the busy timeout never stalls the runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::outcome::StoreError;
use super::store::{BucketKey, GuardStore, LedgerEntry, LedgerScope, PruneReport, QuotaScope};

/// Default busy timeout
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rate_buckets (
    bucket INTEGER PRIMARY KEY,
    count  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS usage_records (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    class TEXT NOT NULL,
    ts_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_class_ts ON usage_records (class, ts_ms);
CREATE TABLE IF NOT EXISTS ledger_entries (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_id       TEXT NOT NULL UNIQUE,
    ledger_id      TEXT NOT NULL,
    block_id       TEXT NOT NULL,
    nonce          INTEGER NOT NULL,
    inserted_at_ms INTEGER NOT NULL,
    UNIQUE (ledger_id, nonce)
);
";

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (and create if needed) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        Self::init(&conn, busy_timeout)?;
        debug!(path = %path.display(), "Opened SQLite guard store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn, DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init(conn: &Connection, busy_timeout: Duration) -> Result<(), StoreError> {
        conn.busy_timeout(busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(journal_mode = %mode, "SQLite journal mode");
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    async fn hold(&self) -> HeldConn {
        HeldConn(self.conn.clone().lock_owned().await)
    }

    /// Run one autocommit unit of work off the runtime
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (_conn, result) = run_blocking(self.hold().await, f).await?;
        result
    }

    async fn begin(&self) -> Result<Transaction, StoreError> {
        let (conn, result) = run_blocking(self.hold().await, |conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(())
        })
        .await?;
        result?;
        Ok(Transaction { conn: Some(conn) })
    }
}

/// Exclusively held connection. Releasing it rolls back any transaction
/// still open on it, whatever path the release took.
struct HeldConn(OwnedMutexGuard<Connection>);

impl Deref for HeldConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.0
    }
}

impl Drop for HeldConn {
    fn drop(&mut self) {
        if !self.0.is_autocommit() {
            if let Err(e) = self.0.execute_batch("ROLLBACK") {
                warn!(error = %e, "ROLLBACK of abandoned transaction failed");
            }
        }
    }
}

/// Hand `conn` to the blocking pool for `f` and get it back with the result
async fn run_blocking<T, F>(
    conn: HeldConn,
    f: F,
) -> Result<(HeldConn, Result<T, StoreError>), StoreError>
where
    F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = f(&conn);
        (conn, result)
    })
    .await
    .map_err(|e| StoreError::Unavailable(format!("SQLite task failed: {}", e)))
}

fn millis_to_time(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn count_to_u64(count: i64) -> Result<u64, StoreError> {
    u64::try_from(count).map_err(|_| StoreError::Corrupt(format!("negative count: {}", count)))
}

/// Open `BEGIN IMMEDIATE` transaction
struct Transaction {
    /// `None` while a statement is out on the blocking pool
    conn: Option<HeldConn>,
}

impl Transaction {
    async fn run<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| StoreError::Unavailable("transaction was abandoned".to_string()))?;
        let (conn, result) = run_blocking(conn, f).await?;
        self.conn = Some(conn);
        result
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let result = self
            .run(|conn| {
                if let Err(commit_err) = conn.execute_batch("COMMIT") {
                    warn!(error = %commit_err, "COMMIT failed - attempting ROLLBACK");
                    if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                        warn!(error = %rollback_err, "ROLLBACK after failed COMMIT also failed");
                    }
                    return Err(commit_err.into());
                }
                Ok(())
            })
            .await;
        // Release the connection here rather than from the async drop path
        self.conn = None;
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Uncommitted: roll back on the blocking pool when a runtime is around
        if let Some(conn) = self.conn.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn_blocking(move || drop(conn));
            }
        }
    }
}

struct SqliteQuotaScope {
    tx: Transaction,
    class: String,
}

#[async_trait]
impl QuotaScope for SqliteQuotaScope {
    async fn count_where(&mut self, newer_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let class = self.class.clone();
        let count: i64 = self
            .tx
            .run(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM usage_records WHERE class = ?1 AND ts_ms > ?2",
                    params![class, newer_than.timestamp_millis()],
                    |row| row.get(0),
                )?)
            })
            .await?;
        count_to_u64(count)
    }

    async fn insert(&mut self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let class = self.class.clone();
        self.tx
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO usage_records (class, ts_ms) VALUES (?1, ?2)",
                    params![class, at.timestamp_millis()],
                )?;
                Ok(())
            })
            .await
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await
    }
}

struct SqliteLedgerScope {
    tx: Transaction,
    ledger_id: String,
}

#[async_trait]
impl LedgerScope for SqliteLedgerScope {
    async fn max_nonce(&mut self) -> Result<Option<i64>, StoreError> {
        let ledger_id = self.ledger_id.clone();
        self.tx
            .run(move |conn| select_max_nonce(conn, &ledger_id))
            .await
    }

    async fn insert_entry(
        &mut self,
        block_id: &str,
        nonce: i64,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, StoreError> {
        let entry = LedgerEntry {
            entry_id: uuid::Uuid::new_v4().to_string(),
            ledger_id: self.ledger_id.clone(),
            block_id: block_id.to_string(),
            nonce,
            inserted_at: at,
        };
        let row = entry.clone();
        self.tx
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO ledger_entries (entry_id, ledger_id, block_id, nonce, inserted_at_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        row.entry_id,
                        row.ledger_id,
                        row.block_id,
                        row.nonce,
                        row.inserted_at.timestamp_millis()
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(entry)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await
    }
}

fn select_max_nonce(conn: &Connection, ledger_id: &str) -> Result<Option<i64>, StoreError> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(nonce) FROM ledger_entries WHERE ledger_id = ?1",
        params![ledger_id],
        |row| row.get(0),
    )?;
    Ok(max)
}

#[async_trait]
impl GuardStore for SqliteStore {
    async fn upsert_and_increment(&self, bucket: BucketKey) -> Result<u64, StoreError> {
        let count: i64 = self
            .with_conn(move |conn| {
                Ok(conn.query_row(
                    "INSERT INTO rate_buckets (bucket, count) VALUES (?1, 1) \
                     ON CONFLICT(bucket) DO UPDATE SET count = count + 1 \
                     RETURNING count",
                    params![bucket],
                    |row| row.get(0),
                )?)
            })
            .await?;
        count_to_u64(count)
    }

    async fn quota_scope(&self, class: &str) -> Result<Box<dyn QuotaScope>, StoreError> {
        Ok(Box::new(SqliteQuotaScope {
            tx: self.begin().await?,
            class: class.to_string(),
        }))
    }

    async fn ledger_scope(&self, ledger_id: &str) -> Result<Box<dyn LedgerScope>, StoreError> {
        Ok(Box::new(SqliteLedgerScope {
            tx: self.begin().await?,
            ledger_id: ledger_id.to_string(),
        }))
    }

    async fn bucket_count(&self, bucket: BucketKey) -> Result<Option<u64>, StoreError> {
        let count: Option<i64> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT count FROM rate_buckets WHERE bucket = ?1",
                        params![bucket],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        count.map(count_to_u64).transpose()
    }

    async fn usage_count(
        &self,
        class: &str,
        newer_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let class = class.to_string();
        let count: i64 = self
            .with_conn(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM usage_records WHERE class = ?1 AND ts_ms > ?2",
                    params![class, newer_than.timestamp_millis()],
                    |row| row.get(0),
                )?)
            })
            .await?;
        count_to_u64(count)
    }

    async fn ledger_entries(&self, ledger_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        let ledger_id = ledger_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT entry_id, ledger_id, block_id, nonce, inserted_at_ms \
                 FROM ledger_entries WHERE ledger_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![ledger_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (entry_id, ledger_id, block_id, nonce, inserted_at_ms) = row?;
                entries.push(LedgerEntry {
                    entry_id,
                    ledger_id,
                    block_id,
                    nonce,
                    inserted_at: millis_to_time(inserted_at_ms)?,
                });
            }
            Ok(entries)
        })
        .await
    }

    async fn ledger_head(&self, ledger_id: &str) -> Result<Option<i64>, StoreError> {
        let ledger_id = ledger_id.to_string();
        self.with_conn(move |conn| select_max_nonce(conn, &ledger_id))
            .await
    }

    async fn ledger_ids(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT ledger_id FROM ledger_entries ORDER BY ledger_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn prune(
        &self,
        buckets_before: BucketKey,
        usage_before: DateTime<Utc>,
    ) -> Result<PruneReport, StoreError> {
        self.with_conn(move |conn| {
            let buckets_removed =
                conn.execute("DELETE FROM rate_buckets WHERE bucket < ?1", params![buckets_before])?;
            let usage_records_removed = conn.execute(
                "DELETE FROM usage_records WHERE ts_ms <= ?1",
                params![usage_before.timestamp_millis()],
            )?;
            Ok(PruneReport {
                buckets_removed: buckets_removed as u64,
                usage_records_removed: usage_records_removed as u64,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upsert_returns_post_increment_value() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.upsert_and_increment(42).await.unwrap(), 1);
        assert_eq!(store.upsert_and_increment(42).await.unwrap(), 2);
        assert_eq!(store.upsert_and_increment(43).await.unwrap(), 1);
        assert_eq!(store.bucket_count(42).await.unwrap(), Some(2));
        assert_eq!(store.bucket_count(44).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_quota_scope_rolls_back_when_dropped() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();

        let mut scope = store.quota_scope("ai").await.unwrap();
        scope.insert(now).await.unwrap();
        drop(scope);

        let cutoff = now - ChronoDuration::hours(1);
        assert_eq!(store.usage_count("ai", cutoff).await.unwrap(), 0);

        let mut scope = store.quota_scope("ai").await.unwrap();
        scope.insert(now).await.unwrap();
        scope.commit().await.unwrap();
        assert_eq!(store.usage_count("ai", cutoff).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ledger_unique_constraint() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();

        let mut scope = store.ledger_scope("A").await.unwrap();
        scope.insert_entry("b1", 100, now).await.unwrap();
        let err = scope.insert_entry("b2", 100, now).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        scope.commit().await.unwrap();

        let entries = store.ledger_entries("A").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].block_id, "b1");
        assert_eq!(entries[0].inserted_at.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.db");
        let now = Utc::now();

        {
            let store = SqliteStore::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
            let mut scope = store.ledger_scope("A").await.unwrap();
            scope.insert_entry("b1", 7, now).await.unwrap();
            scope.commit().await.unwrap();
            store.upsert_and_increment(1).await.unwrap();
        }

        let store = SqliteStore::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
        let mut scope = store.ledger_scope("A").await.unwrap();
        assert_eq!(scope.max_nonce().await.unwrap(), Some(7));
        drop(scope);
        assert_eq!(store.bucket_count(1).await.unwrap(), Some(1));
        assert_eq!(store.ledger_ids().await.unwrap(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_prune() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();

        store.upsert_and_increment(1).await.unwrap();
        store.upsert_and_increment(10).await.unwrap();

        let mut scope = store.quota_scope("ai").await.unwrap();
        scope.insert(now - ChronoDuration::hours(3)).await.unwrap();
        scope.insert(now).await.unwrap();
        scope.commit().await.unwrap();

        let report = store.prune(10, now - ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(
            report,
            PruneReport {
                buckets_removed: 1,
                usage_records_removed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_ledger_head_reads_max_nonce() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.ledger_head("A").await.unwrap(), None);

        let mut scope = store.ledger_scope("A").await.unwrap();
        scope.insert_entry("b1", 100, Utc::now()).await.unwrap();
        scope.insert_entry("b2", 250, Utc::now()).await.unwrap();
        scope.commit().await.unwrap();

        assert_eq!(store.ledger_head("A").await.unwrap(), Some(250));
        assert_eq!(store.ledger_head("B").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_listed_in_commit_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();

        // Scopes enforce nothing themselves, so a lower nonce can land later
        for (block, nonce) in [("b1", 500), ("b2", 300), ("b3", 400)] {
            let mut scope = store.ledger_scope("A").await.unwrap();
            scope.insert_entry(block, nonce, now).await.unwrap();
            scope.commit().await.unwrap();
        }

        let blocks: Vec<String> = store
            .ledger_entries("A")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.block_id)
            .collect();
        assert_eq!(blocks, vec!["b1", "b2", "b3"]);
    }

    #[tokio::test]
    async fn test_waiting_writer_does_not_stall_runtime() {
        // Current-thread runtime: the second handle's busy wait must not
        // block the task that holds the write lock.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.db");
        let first = SqliteStore::open(&path, Duration::from_secs(10)).unwrap();
        let second = SqliteStore::open(&path, Duration::from_secs(10)).unwrap();

        let mut held = first.ledger_scope("A").await.unwrap();
        held.insert_entry("b1", 100, Utc::now()).await.unwrap();

        let waiter = tokio::spawn(async move {
            let mut scope = second.ledger_scope("A").await.unwrap();
            let seen = scope.max_nonce().await.unwrap();
            scope.commit().await.unwrap();
            seen
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        held.commit().await.unwrap();

        assert_eq!(waiter.await.unwrap(), Some(100));
    }
}
