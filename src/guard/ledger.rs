//! Append-Only Ledger
//!
//! Each ledger identifier carries a strictly increasing nonce sequence. An
//! append reads the ledger's maximum nonce, compares, and inserts, all inside
//! one store scope for that ledger; concurrent appends on the same ledger
//! resolve as if run one after another. A ledger with no entries has an
//! effective maximum of 0, so the first accepted nonce must be positive.
//!
//! ```text
//! state: last committed nonce v (initially none ~ 0)
//! append(n): n > v  => commit, v := n
//!            n <= v => NonceReplay, no write
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use super::clock::{Clock, SystemClock};
use super::outcome::{GuardError, Outcome, Rejection, StoreError, Verdict};
use super::store::{GuardStore, LedgerEntry};
use crate::metrics;

/// Effective maximum nonce of an empty ledger
pub const EMPTY_LEDGER_FLOOR: i64 = 0;

/// Stateless ledger appender over a shared store
#[derive(Debug, Clone)]
pub struct LedgerAppender {
    store: Arc<dyn GuardStore>,
    clock: Arc<dyn Clock>,
}

impl LedgerAppender {
    /// Create an appender on the system clock
    pub fn new(store: Arc<dyn GuardStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock::new()))
    }

    /// Create an appender on the given clock
    pub fn with_clock(store: Arc<dyn GuardStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append `block_id` at `nonce` if `nonce` exceeds the ledger's maximum
    pub async fn append(
        &self,
        ledger_id: &str,
        block_id: &str,
        nonce: i64,
    ) -> Result<Verdict, GuardError> {
        let result = self.evaluate(ledger_id, block_id, nonce).await;
        metrics::record_outcome("ledger", Outcome::from_result(&result));
        result
    }

    async fn evaluate(
        &self,
        ledger_id: &str,
        block_id: &str,
        nonce: i64,
    ) -> Result<Verdict, GuardError> {
        let started = Instant::now();
        let mut scope = self
            .store
            .ledger_scope(ledger_id)
            .await
            .inspect_err(|e| error!(ledger_id, error = %e, "Failed to open ledger scope"))?;

        let max_nonce = scope.max_nonce().await?;
        if nonce <= max_nonce.unwrap_or(EMPTY_LEDGER_FLOOR) {
            drop(scope);
            metrics::observe_store("ledger_append", started);
            info!(ledger_id, nonce, ?max_nonce, "Nonce replay rejected");
            return Ok(replay(ledger_id, nonce, max_nonce));
        }

        let entry = match scope.insert_entry(block_id, nonce, self.clock.now()).await {
            Ok(entry) => entry,
            Err(StoreError::Conflict(reason)) => {
                info!(ledger_id, nonce, %reason, "Nonce replay caught by uniqueness constraint");
                return Ok(replay(ledger_id, nonce, None));
            }
            Err(e) => {
                error!(ledger_id, nonce, error = %e, "Ledger insert failed");
                return Err(e.into());
            }
        };

        scope
            .commit()
            .await
            .inspect_err(|e| error!(ledger_id, nonce, error = %e, "Ledger commit failed"))?;
        metrics::observe_store("ledger_append", started);
        metrics::LEDGER_ENTRIES_APPENDED_TOTAL.inc();

        debug!(
            ledger_id,
            nonce,
            entry_id = %entry.entry_id,
            block_id = %entry.block_id,
            "Ledger entry appended"
        );
        Ok(Verdict::Accepted)
    }

    /// Highest committed nonce for a ledger
    pub async fn head(&self, ledger_id: &str) -> Result<Option<i64>, GuardError> {
        Ok(self.store.ledger_head(ledger_id).await?)
    }

    /// All committed entries for a ledger, in commit order
    pub async fn entries(&self, ledger_id: &str) -> Result<Vec<LedgerEntry>, GuardError> {
        Ok(self.store.ledger_entries(ledger_id).await?)
    }
}

fn replay(ledger_id: &str, nonce: i64, max_nonce: Option<i64>) -> Verdict {
    Verdict::Rejected(Rejection::NonceReplay {
        ledger_id: ledger_id.to_string(),
        nonce,
        max_nonce,
    })
}
