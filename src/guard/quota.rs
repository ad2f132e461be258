//! Rolling-Window Quota Enforcer
//!
//! Counts usage records per operation class over a window ending now. The
//! count and the insert of the new record happen inside one store scope for
//! the class, so two callers that both see "one below the limit" cannot both
//! be admitted. A rejected call records nothing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::clock::{Clock, SystemClock};
use super::outcome::{positive_limit, GuardError, Outcome, Rejection, Verdict};
use super::store::GuardStore;
use crate::metrics;

/// Operation class for AI calls
pub const AI_CALLS: &str = "ai";

/// Default AI-call quota per window
pub const DEFAULT_AI_QUOTA: i64 = 50;

/// Default rolling window
pub const DEFAULT_QUOTA_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Stateless quota enforcer over a shared store
#[derive(Debug, Clone)]
pub struct QuotaEnforcer {
    store: Arc<dyn GuardStore>,
    clock: Arc<dyn Clock>,
}

fn window_delta(window: Duration) -> Result<chrono::Duration, GuardError> {
    if window.is_zero() {
        return Err(GuardError::Misconfigured(
            "quota window must be longer than zero".to_string(),
        ));
    }
    chrono::Duration::from_std(window)
        .map_err(|_| GuardError::Misconfigured(format!("quota window too large: {:?}", window)))
}

fn window_start(
    now: DateTime<Utc>,
    delta: chrono::Duration,
) -> Result<DateTime<Utc>, GuardError> {
    now.checked_sub_signed(delta).ok_or_else(|| {
        GuardError::Misconfigured(format!("quota window of {} reaches before the earliest date", delta))
    })
}

impl QuotaEnforcer {
    /// Create a quota enforcer on the system clock
    pub fn new(store: Arc<dyn GuardStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock::new()))
    }

    /// Create a quota enforcer on the given clock
    pub fn with_clock(store: Arc<dyn GuardStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Admit one operation of `class` if fewer than `limit` were admitted
    /// within `window`
    pub async fn check(
        &self,
        class: &str,
        limit: i64,
        window: Duration,
    ) -> Result<Verdict, GuardError> {
        let result = self.evaluate(class, limit, window).await;
        metrics::record_outcome("quota", Outcome::from_result(&result));
        result
    }

    async fn evaluate(
        &self,
        class: &str,
        limit: i64,
        window: Duration,
    ) -> Result<Verdict, GuardError> {
        let limit = positive_limit("quota limit", limit)
            .and_then(|limit| window_delta(window).map(|delta| (limit, delta)))
            .inspect_err(|e| warn!(class, error = %e, "Quota enforcer misconfigured"));
        let (limit, delta) = limit?;

        let now = self.clock.now();
        let cutoff = window_start(now, delta)
            .inspect_err(|e| warn!(class, error = %e, "Quota enforcer misconfigured"))?;
        let started = Instant::now();

        let mut scope = self
            .store
            .quota_scope(class)
            .await
            .inspect_err(|e| error!(class, error = %e, "Failed to open quota scope"))?;

        let used = scope.count_where(cutoff).await?;
        if used >= limit {
            // Dropping the scope releases the class without writing
            drop(scope);
            metrics::observe_store("quota_check", started);
            info!(class, used, limit, "Quota exceeded");
            return Ok(Verdict::Rejected(Rejection::QuotaExceeded {
                class: class.to_string(),
                used,
                limit,
            }));
        }

        scope.insert(now).await?;
        scope
            .commit()
            .await
            .inspect_err(|e| error!(class, error = %e, "Failed to commit quota usage"))?;
        metrics::observe_store("quota_check", started);

        debug!(class, used = used + 1, limit, "Quota check accepted");
        Ok(Verdict::Accepted)
    }

    /// Usage recorded for `class` within `window` (observation only)
    pub async fn usage(&self, class: &str, window: Duration) -> Result<u64, GuardError> {
        let cutoff = window_start(self.clock.now(), window_delta(window)?)?;
        Ok(self.store.usage_count(class, cutoff).await?)
    }
}
