//! Local storage configuration.

use serde::{Deserialize, Serialize};

/// Limits and policy knobs for the local store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Total bytes (keys plus values) the store may hold.
    pub capacity_bytes: u64,

    /// Lifetime of a secure record, in seconds.
    pub secure_ttl_secs: i64,

    /// Repeating key used to obfuscate secure records.
    pub obfuscation_key: String,

    /// Pattern catalog size above which emergency cleanup truncates it.
    pub pattern_eviction_threshold: usize,

    /// Number of most recently added patterns kept by emergency cleanup.
    pub pattern_retain_count: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 5 * 1024 * 1024, // 5 MiB
            secure_ttl_secs: 24 * 60 * 60,
            obfuscation_key: "TAILOR_LOCAL_OBFUSCATION_2025".to_string(),
            pattern_eviction_threshold: 50,
            pattern_retain_count: 30,
        }
    }
}
