//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tailor_storage::StorageConfig;

/// Environment variable overriding [`SyncConfig::api_base_url`].
pub const API_URL_ENV: &str = "TAILOR_API_URL";

/// Configuration for the device sync engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the remote sync service (e.g., "http://localhost:3001").
    pub api_base_url: String,

    /// Period of the auto-sync loop (seconds).
    pub auto_sync_interval_secs: u64,

    /// Timeout applied to every HTTP request (seconds).
    pub request_timeout_secs: u64,

    /// Upload attempts before a queued item is dropped.
    pub max_attempts: u32,

    /// How long the cross-tab signal record lives before removal (milliseconds).
    pub cross_tab_signal_ttl_ms: u64,

    /// Period of the storage quota check (seconds).
    pub monitor_interval_secs: u64,

    /// Local store limits.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3001".to_string(),
            auto_sync_interval_secs: 30,
            request_timeout_secs: 30,
            max_attempts: 3,
            cross_tab_signal_ttl_ms: 100,
            monitor_interval_secs: 300, // 5 minutes
            storage: StorageConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults with overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults with overrides from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup(API_URL_ENV).filter(|url| !url.trim().is_empty()) {
            config.api_base_url = url.trim().trim_end_matches('/').to_string();
        }
        config
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cross_tab_signal_ttl(&self) -> Duration {
        Duration::from_millis(self.cross_tab_signal_ttl_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}
