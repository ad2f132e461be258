//! Guard Configuration
//!
//! Limits and windows consumed by the guards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::quota::{AI_CALLS, DEFAULT_AI_QUOTA};

/// Default rate limit (operations per bucket)
pub const DEFAULT_RATE_LIMIT: i64 = 10;

/// Default quota window in seconds
pub const DEFAULT_QUOTA_WINDOW_SECS: u64 = 60 * 60;

/// Default nonce window in seconds
pub const DEFAULT_NONCE_WINDOW_SECS: u64 = 5 * 60;

/// Longest accepted quota or nonce window (ten years)
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Operations accepted per bucket
    pub requests_per_second: i64,

    /// Bucket width in seconds
    pub bucket_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: DEFAULT_RATE_LIMIT,
            bucket_secs: 1,
        }
    }
}

/// Quota configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// Rolling window in seconds
    pub window_secs: u64,

    /// Per-class limits within the window
    pub limits: HashMap<String, i64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let mut limits = HashMap::new();
        limits.insert(AI_CALLS.to_string(), DEFAULT_AI_QUOTA);
        Self {
            window_secs: DEFAULT_QUOTA_WINDOW_SECS,
            limits,
        }
    }
}

impl QuotaConfig {
    /// Get window duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Limit for a class, if configured
    pub fn limit_for(&self, class: &str) -> Option<i64> {
        self.limits.get(class).copied()
    }
}

/// Nonce window configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NonceConfig {
    /// Accepted clock skew in seconds, either direction
    pub window_secs: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_NONCE_WINDOW_SECS,
        }
    }
}

impl NonceConfig {
    /// Get window duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Everything the guards need
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    pub rate_limit: RateLimitConfig,
    pub quota: QuotaConfig,
    pub nonce: NonceConfig,
}

impl GuardConfig {
    /// Create a guard configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Rate limiting off (for testing)
    pub fn without_rate_limit() -> Self {
        Self {
            rate_limit: RateLimitConfig {
                enabled: false,
                ..RateLimitConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate limits and windows
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rate_limit.requests_per_second <= 0 {
            anyhow::bail!(
                "Rate limit must be a positive integer, got {}",
                self.rate_limit.requests_per_second
            );
        }
        if self.rate_limit.bucket_secs <= 0 {
            anyhow::bail!("Rate bucket width must be > 0 seconds");
        }
        if self.quota.window_secs == 0 {
            anyhow::bail!("Quota window must be > 0 seconds");
        }
        if self.quota.window_secs > MAX_WINDOW_SECS {
            anyhow::bail!(
                "Quota window must be at most {} seconds, got {}",
                MAX_WINDOW_SECS,
                self.quota.window_secs
            );
        }
        for (class, limit) in &self.quota.limits {
            if class.is_empty() {
                anyhow::bail!("Quota class names must not be empty");
            }
            if *limit <= 0 {
                anyhow::bail!("Quota limit for '{}' must be a positive integer, got {}", class, limit);
            }
        }
        if self.nonce.window_secs == 0 {
            anyhow::bail!("Nonce window must be > 0 seconds");
        }
        if self.nonce.window_secs > MAX_WINDOW_SECS {
            anyhow::bail!(
                "Nonce window must be at most {} seconds, got {}",
                MAX_WINDOW_SECS,
                self.nonce.window_secs
            );
        }
        Ok(())
    }
}
