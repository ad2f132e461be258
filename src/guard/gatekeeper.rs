//! Gatekeeper
//!
//! Chains the guards for one inbound operation in a fixed order and stops at
//! the first rejection or error:
//!
//! 1. nonce window (if the operation carries a nonce)
//! 2. rate limiter (unless disabled or not applicable)
//! 3. quota for the operation class (if any)
//! 4. ledger append (if any)

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::config::GuardConfig;
use super::ledger::LedgerAppender;
use super::nonce::NonceWindowValidator;
use super::outcome::{GuardError, Outcome, Verdict};
use super::quota::QuotaEnforcer;
use super::rate::RateLimiter;
use super::store::GuardStore;

/// Ledger append carried by a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAppend {
    pub ledger_id: String,
    pub block_id: String,
    pub nonce: i64,
}

/// Guard requirements of one inbound operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardRequest {
    /// Caller nonce (epoch milliseconds) to check against server time
    pub nonce: Option<i64>,

    /// Whether the operation counts against the rate limit
    pub rate_limited: bool,

    /// Operation class subject to a quota
    pub quota_class: Option<String>,

    /// Ledger entry to append once every other guard has passed
    pub ledger: Option<LedgerAppend>,
}

impl Default for GuardRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardRequest {
    /// Rate-limited operation with no other guards
    pub fn new() -> Self {
        Self {
            nonce: None,
            rate_limited: true,
            quota_class: None,
            ledger: None,
        }
    }

    /// Check `nonce` against the skew window
    pub fn with_nonce(mut self, nonce: i64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Exempt from the rate limiter
    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limited = false;
        self
    }

    /// Charge one use of `class`
    pub fn with_quota(mut self, class: impl Into<String>) -> Self {
        self.quota_class = Some(class.into());
        self
    }

    /// Append to a ledger; the ledger nonce also goes through the skew window
    pub fn with_ledger_append(
        mut self,
        ledger_id: impl Into<String>,
        block_id: impl Into<String>,
        nonce: i64,
    ) -> Self {
        self.nonce = Some(nonce);
        self.ledger = Some(LedgerAppend {
            ledger_id: ledger_id.into(),
            block_id: block_id.into(),
            nonce,
        });
        self
    }
}

/// Composed guards sharing one store and one clock
#[derive(Debug, Clone)]
pub struct Gatekeeper {
    config: GuardConfig,
    store: Arc<dyn GuardStore>,
    clock: Arc<dyn Clock>,
    rate: RateLimiter,
    quota: QuotaEnforcer,
    nonce: NonceWindowValidator,
    ledger: LedgerAppender,
}

impl Gatekeeper {
    /// Create a gatekeeper on the system clock
    pub fn new(store: Arc<dyn GuardStore>, config: GuardConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock::new()))
    }

    /// Create a gatekeeper on the given clock
    pub fn with_clock(
        store: Arc<dyn GuardStore>,
        config: GuardConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rate = RateLimiter::with_clock(store.clone(), clock.clone())
            .with_bucket_secs(config.rate_limit.bucket_secs);
        let quota = QuotaEnforcer::with_clock(store.clone(), clock.clone());
        let nonce = NonceWindowValidator::with_clock(clock.clone()).with_window(config.nonce.window());
        let ledger = LedgerAppender::with_clock(store.clone(), clock.clone());

        Self {
            config,
            store,
            clock,
            rate,
            quota,
            nonce,
            ledger,
        }
    }

    /// Run every applicable guard for `request`
    pub async fn admit(&self, request: &GuardRequest) -> Result<Verdict, GuardError> {
        let result = self.evaluate(request).await;
        match &result {
            Ok(Verdict::Accepted) => debug!(?request, "Operation admitted"),
            Ok(Verdict::Rejected(rejection)) => {
                let outcome = Outcome::from(rejection);
                info!(%outcome, ?request, "Operation rejected");
            }
            Err(e) => warn!(error = %e, ?request, "Operation could not be evaluated"),
        }
        result
    }

    async fn evaluate(&self, request: &GuardRequest) -> Result<Verdict, GuardError> {
        if let Some(nonce) = request.nonce {
            let verdict = self.nonce.validate(nonce);
            if !verdict.is_accepted() {
                return Ok(verdict);
            }
        }

        if request.rate_limited && self.config.rate_limit.enabled {
            let verdict = self.rate.check(self.config.rate_limit.requests_per_second).await?;
            if !verdict.is_accepted() {
                return Ok(verdict);
            }
        }

        if let Some(class) = &request.quota_class {
            let limit = self.config.quota.limit_for(class).ok_or_else(|| {
                GuardError::Misconfigured(format!("no quota limit configured for class '{}'", class))
            })?;
            let verdict = self.quota.check(class, limit, self.config.quota.window()).await?;
            if !verdict.is_accepted() {
                return Ok(verdict);
            }
        }

        if let Some(append) = &request.ledger {
            return self
                .ledger
                .append(&append.ledger_id, &append.block_id, append.nonce)
                .await;
        }

        Ok(Verdict::Accepted)
    }

    /// Guard configuration
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Shared store
    pub fn store(&self) -> &Arc<dyn GuardStore> {
        &self.store
    }

    /// Shared clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Rate limiter
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate
    }

    /// Quota enforcer
    pub fn quota_enforcer(&self) -> &QuotaEnforcer {
        &self.quota
    }

    /// Nonce window validator
    pub fn nonce_validator(&self) -> &NonceWindowValidator {
        &self.nonce
    }

    /// Ledger appender
    pub fn ledger(&self) -> &LedgerAppender {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::clock::MockClock;
    use crate::guard::memory::MemoryStore;
    use crate::guard::outcome::Rejection;
    use crate::guard::quota::AI_CALLS;
    use crate::guard::testing::{FailAt, FailingStore};

    const NOW_MS: i64 = 1_700_000_000_000;

    fn gatekeeper(config: GuardConfig) -> (Gatekeeper, MemoryStore) {
        let store = MemoryStore::new();
        let gate = Gatekeeper::with_clock(
            Arc::new(store.clone()),
            config,
            Arc::new(MockClock::at_millis(NOW_MS)),
        );
        (gate, store)
    }

    #[tokio::test]
    async fn test_plain_request_is_rate_limited() {
        let mut config = GuardConfig::default();
        config.rate_limit.requests_per_second = 2;
        let (gate, _) = gatekeeper(config);

        let request = GuardRequest::new();
        assert!(gate.admit(&request).await.unwrap().is_accepted());
        assert!(gate.admit(&request).await.unwrap().is_accepted());
        assert!(matches!(
            gate.admit(&request).await.unwrap(),
            Verdict::Rejected(Rejection::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_nonce_short_circuits_before_rate_limiter() {
        let (gate, store) = gatekeeper(GuardConfig::default());
        let bucket = gate.rate_limiter().current_bucket();

        let request = GuardRequest::new().with_nonce(NOW_MS - 6 * 60 * 1000);
        assert!(matches!(
            gate.admit(&request).await.unwrap(),
            Verdict::Rejected(Rejection::NonceOutOfWindow { .. })
        ));
        assert_eq!(store.bucket_count(bucket).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ledger_append_through_gate() {
        let (gate, _) = gatekeeper(GuardConfig::without_rate_limit());

        let first = GuardRequest::new().with_ledger_append("A", "b1", NOW_MS);
        let replay = GuardRequest::new().with_ledger_append("A", "b2", NOW_MS - 1000);

        assert!(gate.admit(&first).await.unwrap().is_accepted());
        assert!(matches!(
            gate.admit(&replay).await.unwrap(),
            Verdict::Rejected(Rejection::NonceReplay { .. })
        ));
        assert_eq!(gate.ledger().head("A").await.unwrap(), Some(NOW_MS));
    }

    #[tokio::test]
    async fn test_quota_rejection_skips_ledger() {
        let mut config = GuardConfig::without_rate_limit();
        config.quota.limits.insert(AI_CALLS.to_string(), 1);
        let (gate, _) = gatekeeper(config);

        let first = GuardRequest::new()
            .with_quota(AI_CALLS)
            .with_ledger_append("A", "b1", NOW_MS);
        let second = GuardRequest::new()
            .with_quota(AI_CALLS)
            .with_ledger_append("A", "b2", NOW_MS + 1);

        assert!(gate.admit(&first).await.unwrap().is_accepted());
        assert!(matches!(
            gate.admit(&second).await.unwrap(),
            Verdict::Rejected(Rejection::QuotaExceeded { .. })
        ));
        assert_eq!(gate.ledger().entries("A").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_quota_class_is_misconfigured() {
        let (gate, _) = gatekeeper(GuardConfig::without_rate_limit());
        let request = GuardRequest::new().with_quota("video");
        assert!(matches!(
            gate.admit(&request).await,
            Err(GuardError::Misconfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_misconfigured_rate_limit_surfaces_as_error() {
        let mut config = GuardConfig::default();
        config.rate_limit.requests_per_second = 0;
        let (gate, _) = gatekeeper(config);

        let result = gate.admit(&GuardRequest::new()).await;
        assert_eq!(Outcome::from_result(&result), Outcome::Misconfigured);
    }

    #[tokio::test]
    async fn test_rate_exempt_request() {
        let mut config = GuardConfig::default();
        config.rate_limit.requests_per_second = 1;
        let (gate, _) = gatekeeper(config);

        let request = GuardRequest::new().without_rate_limit();
        for _ in 0..5 {
            assert!(gate.admit(&request).await.unwrap().is_accepted());
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error_not_a_verdict() {
        let mut config = GuardConfig::default();
        config.quota.limits.insert(AI_CALLS.to_string(), 5);
        let store = FailingStore::new(FailAt::Commit);
        let gate = Gatekeeper::with_clock(
            Arc::new(store.clone()),
            config,
            Arc::new(MockClock::at_millis(NOW_MS)),
        );

        let request = GuardRequest::new()
            .with_quota(AI_CALLS)
            .with_ledger_append("A", "b1", NOW_MS);
        let result = gate.admit(&request).await;
        assert!(matches!(result, Err(GuardError::StoreUnavailable(_))));
        assert_eq!(Outcome::from_result(&result), Outcome::StoreUnavailable);
        assert!(store.inner.ledger_entries("A").await.unwrap().is_empty());
    }
}
