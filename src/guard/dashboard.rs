//! Admin Dashboard Support
//!
//! Read-only snapshot of guard state for monitoring. Nothing here feeds an
//! admission decision.

use serde::{Deserialize, Serialize};

use super::gatekeeper::Gatekeeper;
use super::outcome::GuardError;

/// Dashboard data for admin interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardData {
    /// Timestamp of data generation
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Current rate bucket
    pub rate: RateSnapshot,

    /// Rolling usage per configured class
    pub quotas: Vec<QuotaSnapshot>,

    /// Head of every ledger
    pub ledgers: Vec<LedgerSnapshot>,
}

/// Current rate bucket state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub enabled: bool,
    pub bucket: i64,
    pub count: u64,
    pub limit: i64,
}

/// Rolling usage for one class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub class: String,
    pub used: u64,
    pub limit: i64,
    pub window_secs: u64,
    pub utilization_percent: f64,
}

/// Head of one ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub ledger_id: String,
    pub entries: usize,
    pub max_nonce: Option<i64>,
    pub last_block_id: Option<String>,
    pub last_inserted_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Dashboard builder for constructing dashboard data
pub struct DashboardBuilder<'a> {
    gate: &'a Gatekeeper,
}

impl<'a> DashboardBuilder<'a> {
    /// Create a new dashboard builder
    pub fn new(gate: &'a Gatekeeper) -> Self {
        Self { gate }
    }

    /// Build dashboard data
    pub async fn build(&self) -> Result<DashboardData, GuardError> {
        let config = self.gate.config();
        let store = self.gate.store();

        let bucket = self.gate.rate_limiter().current_bucket();
        let rate = RateSnapshot {
            enabled: config.rate_limit.enabled,
            bucket,
            count: store.bucket_count(bucket).await?.unwrap_or(0),
            limit: config.rate_limit.requests_per_second,
        };

        let mut classes: Vec<(&String, &i64)> = config.quota.limits.iter().collect();
        classes.sort();

        let mut quotas = Vec::with_capacity(classes.len());
        for (class, limit) in classes {
            let used = self
                .gate
                .quota_enforcer()
                .usage(class, config.quota.window())
                .await?;
            let utilization_percent = if *limit > 0 {
                (used as f64 / *limit as f64) * 100.0
            } else {
                0.0
            };
            quotas.push(QuotaSnapshot {
                class: class.clone(),
                used,
                limit: *limit,
                window_secs: config.quota.window_secs,
                utilization_percent,
            });
        }

        let mut ledgers = Vec::new();
        for ledger_id in store.ledger_ids().await? {
            let entries = store.ledger_entries(&ledger_id).await?;
            let last = entries.last();
            ledgers.push(LedgerSnapshot {
                ledger_id,
                entries: entries.len(),
                max_nonce: entries.iter().map(|e| e.nonce).max(),
                last_block_id: last.map(|e| e.block_id.clone()),
                last_inserted_at: last.map(|e| e.inserted_at),
            });
        }

        Ok(DashboardData {
            timestamp: self.gate.clock().now(),
            rate,
            quotas,
            ledgers,
        })
    }
}
