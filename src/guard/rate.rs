//! Request Rate Limiter
//!
//! Fixed one-second buckets keyed by epoch seconds. Every check increments
//! the current bucket, including checks that end up rejected, so a caller
//! that is refused still consumes a slot. The increment and the read-back are
//! one store step; the count a caller sees already includes every increment
//! that was ordered before it.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::clock::{Clock, SystemClock};
use super::outcome::{positive_limit, GuardError, Outcome, Rejection, Verdict};
use super::store::{BucketKey, GuardStore};
use crate::metrics;

/// Default bucket width in seconds
pub const DEFAULT_BUCKET_SECS: i64 = 1;

/// Stateless rate limiter over a shared store
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn GuardStore>,
    clock: Arc<dyn Clock>,
    bucket_secs: i64,
}

impl RateLimiter {
    /// Create a rate limiter on the system clock
    pub fn new(store: Arc<dyn GuardStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter on the given clock
    pub fn with_clock(store: Arc<dyn GuardStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            bucket_secs: DEFAULT_BUCKET_SECS,
        }
    }

    /// Use coarser buckets of `secs` seconds (values below 1 are clamped to 1)
    pub fn with_bucket_secs(mut self, secs: i64) -> Self {
        self.bucket_secs = secs.max(1);
        self
    }

    /// Bucket key for a point in time
    pub fn bucket_key(&self, at: DateTime<Utc>) -> BucketKey {
        at.timestamp().div_euclid(self.bucket_secs)
    }

    /// Bucket key for the current time
    pub fn current_bucket(&self) -> BucketKey {
        self.bucket_key(self.clock.now())
    }

    /// Record one operation in the current bucket and decide whether it is
    /// within `limit`
    ///
    /// A non-positive `limit` is `Misconfigured` and touches nothing.
    pub async fn check(&self, limit: i64) -> Result<Verdict, GuardError> {
        let result = self.evaluate(limit).await;
        metrics::record_outcome("rate", Outcome::from_result(&result));
        result
    }

    async fn evaluate(&self, limit: i64) -> Result<Verdict, GuardError> {
        let limit = positive_limit("rate limit", limit).inspect_err(|e| {
            warn!(error = %e, "Rate limiter misconfigured");
        })?;

        let bucket = self.current_bucket();
        let started = Instant::now();
        let count = self
            .store
            .upsert_and_increment(bucket)
            .await
            .inspect_err(|e| error!(bucket, error = %e, "Rate bucket increment failed"))?;
        metrics::observe_store("rate_increment", started);

        if count > limit {
            info!(bucket, count, limit, "Rate limit exceeded");
            return Ok(Verdict::Rejected(Rejection::RateLimited { count, limit }));
        }

        debug!(bucket, count, limit, "Rate check accepted");
        Ok(Verdict::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::clock::MockClock;
    use crate::guard::memory::MemoryStore;
    use crate::guard::testing::{FailAt, FailingStore};
    use std::time::Duration;

    fn limiter() -> (RateLimiter, MemoryStore, MockClock) {
        let store = MemoryStore::new();
        let clock = MockClock::at_millis(1_700_000_000_250);
        let limiter = RateLimiter::with_clock(Arc::new(store.clone()), Arc::new(clock.clone()));
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_accepts_up_to_limit() {
        let (limiter, _, _) = limiter();

        for _ in 0..3 {
            assert_eq!(limiter.check(3).await.unwrap(), Verdict::Accepted);
        }

        let verdict = limiter.check(3).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Rejected(Rejection::RateLimited { count: 4, limit: 3 })
        );
    }

    #[tokio::test]
    async fn test_rejected_calls_still_consume_slots() {
        let (limiter, store, _) = limiter();
        let bucket = limiter.current_bucket();

        for _ in 0..5 {
            limiter.check(2).await.unwrap();
        }

        assert_eq!(store.bucket_count(bucket).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_new_bucket_each_second() {
        let (limiter, _, clock) = limiter();

        assert!(limiter.check(1).await.unwrap().is_accepted());
        assert!(!limiter.check(1).await.unwrap().is_accepted());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.check(1).await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_same_second_shares_bucket() {
        let (limiter, _, clock) = limiter();

        assert!(limiter.check(1).await.unwrap().is_accepted());
        clock.advance(Duration::from_millis(700));
        assert!(!limiter.check(1).await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_misconfigured_limit_skips_store() {
        let (limiter, store, _) = limiter();
        let bucket = limiter.current_bucket();

        for limit in [0, -1, i64::MIN] {
            let result = limiter.check(limit).await;
            assert!(matches!(result, Err(GuardError::Misconfigured(_))));
        }

        assert_eq!(store.bucket_count(bucket).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_coarse_buckets() {
        let (limiter, _, clock) = limiter();
        let limiter = limiter.with_bucket_secs(60);

        assert!(limiter.check(1).await.unwrap().is_accepted());
        clock.advance(Duration::from_secs(5));
        assert!(!limiter.check(1).await.unwrap().is_accepted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_overrun() {
        let (limiter, _, _) = limiter();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check(5).await })
            })
            .collect();

        let mut accepted = 0;
        let mut limited = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Verdict::Accepted => accepted += 1,
                Verdict::Rejected(Rejection::RateLimited { .. }) => limited += 1,
                other => panic!("unexpected verdict: {:?}", other),
            }
        }

        assert_eq!(accepted, 5);
        assert_eq!(limited, 5);
    }

    #[tokio::test]
    async fn test_store_failure_is_unavailable() {
        let store = FailingStore::new(FailAt::Increment);
        let limiter = RateLimiter::new(Arc::new(store));

        let result = limiter.check(5).await;
        assert!(matches!(result, Err(GuardError::StoreUnavailable(_))));
        assert_eq!(Outcome::from_result(&result), Outcome::StoreUnavailable);
        assert_eq!(Outcome::from_result(&result).http_status(), 503);
    }
}
