// Configuration File Support
//
// This module provides configuration file parsing for the guard service.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from XDG config directory: ~/.config/deathstar-guard/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::guard::config::{NonceConfig, QuotaConfig, RateLimitConfig};
use crate::guard::quota::AI_CALLS;
use crate::guard::{parse_limit, GuardConfig, GuardError, GuardStore, MemoryStore, SqliteStore};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Rate limiter configuration
    pub rate_limit: RateLimitConfig,

    /// Quota configuration
    pub quota: QuotaConfig,

    /// Nonce window configuration
    pub nonce: NonceConfig,

    /// Store configuration
    pub store: StoreConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend (sqlite, memory)
    pub backend: String,

    /// SQLite database path
    pub path: String,

    /// How long a writer waits for a competing scope, in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: "./deathstar-guard.db".to_string(),
            busy_timeout_ms: 5000,
        }
    }
}

impl StoreConfig {
    /// Open the configured store
    pub fn open(&self) -> Result<Arc<dyn GuardStore>> {
        match self.backend.to_lowercase().as_str() {
            "sqlite" => {
                let store = SqliteStore::open(&self.path, Duration::from_millis(self.busy_timeout_ms))
                    .with_context(|| format!("Failed to open SQLite store at {}", self.path))?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(MemoryStore::new())),
            other => anyhow::bail!("Unknown store backend: {}", other),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to enable metrics collection
    pub enabled: bool,

    /// Port for metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Guard limit from the environment; anything but a positive integer is
/// `Misconfigured`
fn env_limit(name: &str) -> Result<Option<i64>, GuardError> {
    match std::env::var(name) {
        Ok(raw) => parse_limit(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

/// Guard window (seconds) from the environment; anything but a positive
/// integer is `Misconfigured`
fn env_window_secs(name: &str) -> Result<Option<u64>, GuardError> {
    match std::env::var(name) {
        Ok(raw) => parse_limit(name, &raw).map(|secs| Some(secs as u64)),
        Err(_) => Ok(None),
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation after environment overrides are applied.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/deathstar-guard/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "deathstar", "deathstar-guard")
        {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("deathstar-guard")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - DEATHSTAR_LOG_LEVEL / DEATHSTAR_LOG_FORMAT
    /// - DEATHSTAR_RPS_LIMIT
    /// - DEATHSTAR_AI_QUOTA / DEATHSTAR_QUOTA_WINDOW_SECS
    /// - DEATHSTAR_NONCE_WINDOW_SECS
    /// - DEATHSTAR_STORE_PATH
    /// - DEATHSTAR_METRICS_ENABLED / DEATHSTAR_METRICS_PORT
    ///
    /// Limits and windows that are not positive integers fail with
    /// [`GuardError::Misconfigured`]; other unparseable values are ignored
    /// with a warning.
    fn apply_env_overrides(mut self) -> Result<Self, GuardError> {
        if let Ok(level) = std::env::var("DEATHSTAR_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("DEATHSTAR_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Some(limit) = env_limit("DEATHSTAR_RPS_LIMIT")? {
            self.rate_limit.requests_per_second = limit;
        }
        if let Some(limit) = env_limit("DEATHSTAR_AI_QUOTA")? {
            self.quota.limits.insert(AI_CALLS.to_string(), limit);
        }
        if let Some(secs) = env_window_secs("DEATHSTAR_QUOTA_WINDOW_SECS")? {
            self.quota.window_secs = secs;
        }
        if let Some(secs) = env_window_secs("DEATHSTAR_NONCE_WINDOW_SECS")? {
            self.nonce.window_secs = secs;
        }

        if let Ok(path) = std::env::var("DEATHSTAR_STORE_PATH") {
            self.store.path = path;
        }

        if let Some(enabled) = env_parsed::<bool>("DEATHSTAR_METRICS_ENABLED") {
            self.metrics.enabled = enabled;
        }
        if let Some(port) = env_parsed::<u16>("DEATHSTAR_METRICS_PORT") {
            self.metrics.port = port;
        }

        Ok(self)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        self.guard().validate()?;

        match self.store.backend.to_lowercase().as_str() {
            "sqlite" => {
                if self.store.path.is_empty() {
                    anyhow::bail!("SQLite store path must not be empty");
                }
            }
            "memory" => {}
            _ => anyhow::bail!(
                "Invalid store backend: {}. Must be 'sqlite' or 'memory'",
                self.store.backend
            ),
        }

        if self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        Ok(())
    }

    /// Guard limits and windows
    pub fn guard(&self) -> GuardConfig {
        GuardConfig {
            rate_limit: self.rate_limit.clone(),
            quota: self.quota.clone(),
            nonce: self.nonce.clone(),
        }
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
