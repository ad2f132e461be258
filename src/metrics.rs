// Prometheus metrics for guard decisions
//
// Exposes metrics on /metrics HTTP endpoint:
// - Guard decisions by guard and outcome (counter)
// - Store round-trip latency by operation (histogram)
// - Ledger entries appended (counter)
// - Store state at scrape time: current rate bucket, quota usage and
//   limits per class, ledger count (gauges)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

use crate::guard::{DashboardData, Outcome};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref GUARD_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("guard_decisions_total", "Guard evaluations by guard and outcome"),
        &["guard", "outcome"]
    ).expect("Failed to create guard decisions metric");

    pub static ref STORE_OPERATION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "store_operation_duration_seconds",
            "Duration of guard store round-trips in seconds"
        ),
        &["operation"]
    ).expect("Failed to create store operation duration metric");

    pub static ref LEDGER_ENTRIES_APPENDED_TOTAL: IntCounter = IntCounter::new(
        "ledger_entries_appended_total",
        "Total number of ledger entries committed"
    ).expect("Failed to create ledger entries metric");

    pub static ref RATE_BUCKET_COUNT: IntGauge = IntGauge::new(
        "guard_rate_bucket_count",
        "Operations counted in the current rate bucket"
    ).expect("Failed to create rate bucket metric");

    pub static ref QUOTA_USED: IntGaugeVec = IntGaugeVec::new(
        prometheus::Opts::new("guard_quota_used", "Usage within the rolling window by class"),
        &["class"]
    ).expect("Failed to create quota usage metric");

    pub static ref QUOTA_LIMIT: IntGaugeVec = IntGaugeVec::new(
        prometheus::Opts::new("guard_quota_limit", "Configured quota limit by class"),
        &["class"]
    ).expect("Failed to create quota limit metric");

    pub static ref LEDGERS: IntGauge = IntGauge::new(
        "guard_ledgers",
        "Ledgers holding at least one entry"
    ).expect("Failed to create ledger count metric");
}

/// Initialize metrics registry - must be called once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(GUARD_DECISIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_OPERATION_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(LEDGER_ENTRIES_APPENDED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RATE_BUCKET_COUNT.clone()))?;
    REGISTRY.register(Box::new(QUOTA_USED.clone()))?;
    REGISTRY.register(Box::new(QUOTA_LIMIT.clone()))?;
    REGISTRY.register(Box::new(LEDGERS.clone()))?;
    Ok(())
}

/// Count one guard decision
pub fn record_outcome(guard: &str, outcome: Outcome) {
    GUARD_DECISIONS_TOTAL
        .with_label_values(&[guard, outcome.as_str()])
        .inc();
}

/// Observe the duration of a store round-trip that began at `started`
pub fn observe_store(operation: &str, started: Instant) {
    STORE_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(started.elapsed().as_secs_f64());
}

/// Set the store-state gauges from a dashboard snapshot
pub fn record_dashboard(data: &DashboardData) {
    RATE_BUCKET_COUNT.set(i64::try_from(data.rate.count).unwrap_or(i64::MAX));
    for quota in &data.quotas {
        QUOTA_USED
            .with_label_values(&[quota.class.as_str()])
            .set(i64::try_from(quota.used).unwrap_or(i64::MAX));
        QUOTA_LIMIT
            .with_label_values(&[quota.class.as_str()])
            .set(quota.limit);
    }
    LEDGERS.set(i64::try_from(data.ledgers.len()).unwrap_or(i64::MAX));
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcome() {
        let before = GUARD_DECISIONS_TOTAL
            .with_label_values(&["test_guard", "nonce_replay"])
            .get();
        record_outcome("test_guard", Outcome::NonceReplay);
        let after = GUARD_DECISIONS_TOTAL
            .with_label_values(&["test_guard", "nonce_replay"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_gather_after_init() {
        // Already registered when another test got here first
        let _ = init();

        record_outcome("rate", Outcome::Accepted);
        observe_store("rate_increment", Instant::now());

        let text = gather_metrics().unwrap();
        assert!(text.contains("guard_decisions_total"));
    }
}
