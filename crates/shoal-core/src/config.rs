//! Configuration for the sync core.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SHOAL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/shoal/config.toml
//!   3. ~/.config/shoal/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sync-core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum hashes per offered batch.
    pub batch_size: usize,
    /// Client batch watchdog, seconds.
    pub batch_timeout_secs: u64,
    /// Server idle poll interval on an exhausted iterator, milliseconds.
    pub iter_poll_ms: u64,
    /// Outbox priority levels.
    pub priority_bands: u8,
    /// Outbox depth per band. This is the backpressure threshold.
    pub per_band_queue: usize,
    /// Whether the SYNC stream kind is registered at startup.
    pub sync_enabled: bool,
    /// If true, the client accepts deliveries without waiting for local
    /// store confirmation. Used in tests.
    pub skip_check: bool,
    /// Accepted by the sync client constructor; the behaviour remains
    /// "reuse the pending request".
    pub ignore_existing_request: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            batch_timeout_secs: 120,
            iter_poll_ms: 1000,
            priority_bands: 2,
            per_band_queue: 32,
            sync_enabled: true,
            skip_check: false,
            ignore_existing_request: false,
        }
    }
}

impl SyncConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn iter_poll(&self) -> Duration {
        Duration::from_millis(self.iter_poll_ms)
    }

    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SyncConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SHOAL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply SHOAL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SHOAL_SYNC__BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("SHOAL_SYNC__BATCH_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.batch_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SHOAL_SYNC__ITER_POLL_MS") {
            if let Ok(n) = v.parse() {
                self.iter_poll_ms = n;
            }
        }
        if let Ok(v) = std::env::var("SHOAL_SYNC__ENABLED") {
            self.sync_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("SHOAL_SYNC__SKIP_CHECK") {
            self.skip_check = v == "true" || v == "1";
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("shoal")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}
