//! Application configuration management.
//!
//! Holds the service endpoint, the last identifier used to sign in, and every
//! policy parameter of the session, cache and queue layers (backoff curves,
//! attempt limits, stale-after per query domain, retention).
//!
//! Configuration is stored at `~/.config/skysync/config.json`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

/// Application name used for config/data directory paths
const APP_NAME: &str = "skysync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default protocol service endpoint
pub const DEFAULT_SERVICE_URL: &str = "https://bsky.social";

/// Bounded timeout for a single network call.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Fallback stale-after for domains without an explicit entry.
const DEFAULT_STALE_AFTER_SECS: u64 = 60;

/// Hard retention ceiling; entries older than this are evicted by the sweeper.
const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// How often the cache sweeper runs.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Attempts before a queued mutation is marked failed.
const DEFAULT_MUTATION_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service_url: String,
    pub last_identifier: Option<String>,
    pub offline_mode: bool,
    pub policy: SyncPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            last_identifier: None,
            offline_mode: false,
            policy: SyncPolicy::default(),
        }
    }
}

/// Tunables for retries, timeouts, caching and queue replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Transient-failure retries inside the request pipeline.
    pub request_retry: BackoffPolicy,
    /// Retries of a refresh exchange while the network is flaky.
    pub refresh_backoff: BackoffPolicy,
    /// Delay between attempts of a queued mutation.
    pub queue_backoff: BackoffPolicy,
    pub request_timeout_ms: u64,
    pub cache: CachePolicy,
    pub queue: QueuePolicy,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            request_retry: BackoffPolicy::default(),
            refresh_backoff: BackoffPolicy {
                max_attempts: 4,
                ..BackoffPolicy::default()
            },
            queue_backoff: BackoffPolicy {
                max_ms: 60_000,
                ..BackoffPolicy::default()
            },
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            cache: CachePolicy::default(),
            queue: QueuePolicy::default(),
        }
    }
}

impl SyncPolicy {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub default_stale_after_secs: u64,
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Per-domain stale-after overrides, keyed by the first key segment
    /// (`feed` for `feed:home`).
    pub domain_stale_after_secs: HashMap<String, u64>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            default_stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            retention_secs: DEFAULT_RETENTION_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            domain_stale_after_secs: HashMap::new(),
        }
    }
}

impl CachePolicy {
    pub fn stale_after_for(&self, domain: &str) -> Duration {
        let secs = self
            .domain_stale_after_secs
            .get(domain)
            .copied()
            .unwrap_or(self.default_stale_after_secs);
        Duration::from_secs(secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs.min(i64::MAX as u64) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicy {
    pub max_attempts: u32,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MUTATION_MAX_ATTEMPTS,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the storage backend (credentials, cache, queue).
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Directory for log files.
    pub fn log_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_takes_defaults() {
        let json = r#"{"service_url": "https://pds.example.com", "policy": {"queue": {"max_attempts": 9}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.service_url, "https://pds.example.com");
        assert_eq!(config.policy.queue.max_attempts, 9);
        assert_eq!(config.policy.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert_eq!(config.policy.request_retry.max_attempts, 3);
        assert!(!config.offline_mode);
    }

    #[test]
    fn test_domain_stale_after_override() {
        let mut policy = CachePolicy::default();
        policy.domain_stale_after_secs.insert("profile".into(), 600);
        assert_eq!(policy.stale_after_for("profile"), Duration::from_secs(600));
        assert_eq!(
            policy.stale_after_for("feed"),
            Duration::from_secs(DEFAULT_STALE_AFTER_SECS)
        );
    }
}
