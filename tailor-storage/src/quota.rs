//! Local storage usage accounting and emergency eviction.
//!
//! Usage is classified as:
//! - **Normal**: below 80% of capacity
//! - **Warning**: 80% to 95%
//! - **Critical**: above 95%, which triggers [`QuotaMonitor::emergency_cleanup`]
//!
//! Cleanup is lossy on purpose: under pressure old patterns, session and
//! temporary records are discarded rather than failing writes.

use crate::config::StorageConfig;
use crate::error::StorageResult;
use crate::keys;
use crate::record_store::{LocalStore, StorageRecord};
use crate::secure::SecureStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const WARNING_PERCENT: f64 = 80.0;
const CRITICAL_PERCENT: f64 = 95.0;
/// Usage above which the monitoring loop raises a user-facing warning.
const ALERT_PERCENT: f64 = 90.0;
const LARGEST_ITEMS: usize = 5;

/// Point-in-time view of store usage.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub per_key_size: BTreeMap<String, u64>,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
    pub usage_percent: f64,
    pub item_count: usize,
}

impl QuotaSnapshot {
    pub fn available_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.total_bytes)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaLevel {
    Normal,
    Warning,
    Critical,
}

impl QuotaLevel {
    pub fn classify(usage_percent: f64) -> Self {
        if usage_percent > CRITICAL_PERCENT {
            QuotaLevel::Critical
        } else if usage_percent >= WARNING_PERCENT {
            QuotaLevel::Warning
        } else {
            QuotaLevel::Normal
        }
    }
}

/// What an emergency cleanup removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub patterns_evicted: usize,
    pub transient_removed: Vec<String>,
    pub expired_removed: Vec<String>,
}

/// Result of [`QuotaMonitor::check_limits`].
#[derive(Clone, Debug)]
pub struct QuotaCheck {
    pub level: QuotaLevel,
    pub snapshot: QuotaSnapshot,
    pub recommendations: Vec<String>,
    /// Present when the check ran an emergency cleanup.
    pub cleanup: Option<CleanupReport>,
}

/// Raised by the monitoring loop when usage crosses the alert threshold.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaWarning {
    pub level: QuotaLevel,
    pub usage_percent: f64,
    pub message: String,
}

/// Largest records and duplicate pattern names.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageAnalysis {
    pub largest_items: Vec<(String, u64)>,
    pub duplicate_pattern_names: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Watches local store usage and evicts low-value records under pressure.
pub struct QuotaMonitor {
    store: Arc<LocalStore>,
    secure: SecureStore,
    pattern_eviction_threshold: usize,
    pattern_retain_count: usize,
}

impl QuotaMonitor {
    pub fn new(store: Arc<LocalStore>, secure: SecureStore, config: &StorageConfig) -> Self {
        Self {
            store,
            secure,
            pattern_eviction_threshold: config.pattern_eviction_threshold,
            pattern_retain_count: config.pattern_retain_count,
        }
    }

    pub fn stats(&self) -> StorageResult<QuotaSnapshot> {
        let per_key_size = self.store.record_sizes()?;
        let total_bytes: u64 = per_key_size.values().sum();
        let capacity_bytes = self.store.capacity_bytes();
        let usage_percent = if capacity_bytes == 0 {
            100.0
        } else {
            total_bytes as f64 / capacity_bytes as f64 * 100.0
        };

        Ok(QuotaSnapshot {
            item_count: per_key_size.len(),
            per_key_size,
            total_bytes,
            capacity_bytes,
            usage_percent,
        })
    }

    /// Classifies current usage, running an emergency cleanup when critical.
    pub fn check_limits(&self) -> StorageResult<QuotaCheck> {
        let snapshot = self.stats()?;
        let level = QuotaLevel::classify(snapshot.usage_percent);
        let mut recommendations = Vec::new();

        if level != QuotaLevel::Normal {
            recommendations.push(format!(
                "local storage {:.1}% full, cleanup recommended",
                snapshot.usage_percent
            ));
        }

        let cleanup = if level == QuotaLevel::Critical {
            recommendations.push("local storage critical, running emergency cleanup".to_string());
            Some(self.emergency_cleanup()?)
        } else {
            None
        };

        Ok(QuotaCheck {
            level,
            snapshot,
            recommendations,
            cleanup,
        })
    }

    /// Truncates the pattern catalog and drops transient and expired records.
    pub fn emergency_cleanup(&self) -> StorageResult<CleanupReport> {
        warn!("emergency local storage cleanup initiated");
        let mut report = CleanupReport {
            patterns_evicted: self.truncate_patterns()?,
            ..CleanupReport::default()
        };

        for key in self.store.keys()? {
            if keys::is_transient(&key) && self.store.remove(&key)? {
                report.transient_removed.push(key);
            }
        }

        report.expired_removed = self.secure.cleanup_expired()?;
        for key in self.store.purge_expired()? {
            if !report.expired_removed.contains(&key) {
                report.expired_removed.push(key);
            }
        }

        info!(
            "emergency cleanup evicted {} patterns, {} transient and {} expired records",
            report.patterns_evicted,
            report.transient_removed.len(),
            report.expired_removed.len()
        );
        Ok(report)
    }

    /// Keeps only the most recently added patterns once the catalog is too big.
    fn truncate_patterns(&self) -> StorageResult<usize> {
        let Some(record) = self.store.get(keys::PATTERNS)? else {
            return Ok(0);
        };
        let patterns: Vec<Value> = match serde_json::from_str(&record.value) {
            Ok(patterns) => patterns,
            Err(e) => {
                warn!("pattern catalog is not a JSON array, skipping eviction: {e}");
                return Ok(0);
            }
        };

        if patterns.len() <= self.pattern_eviction_threshold {
            return Ok(0);
        }

        let evicted = patterns.len().saturating_sub(self.pattern_retain_count);
        let recent = &patterns[evicted..];
        self.store
            .put(&StorageRecord::json(keys::PATTERNS, recent, record.device_id)?)?;
        debug!("evicted {evicted} old patterns");
        Ok(evicted)
    }

    /// Reports the largest records and duplicated pattern names.
    pub fn analyze(&self) -> StorageResult<StorageAnalysis> {
        let snapshot = self.stats()?;
        let mut largest_items: Vec<(String, u64)> = snapshot.per_key_size.into_iter().collect();
        largest_items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        largest_items.truncate(LARGEST_ITEMS);

        let mut recommendations = Vec::new();
        if let Some((key, size)) = largest_items.first() {
            if *size > 1024 * 1024 {
                recommendations.push(format!("{key} is very large ({size} bytes)"));
            }
        }

        let patterns: Vec<Value> = self
            .store
            .get_json(keys::PATTERNS)
            .unwrap_or_default()
            .unwrap_or_default();
        let mut seen = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        for name in patterns.iter().filter_map(|p| p.get("name").and_then(Value::as_str)) {
            if !seen.insert(name) {
                duplicates.insert(name.to_string());
            }
        }
        if !duplicates.is_empty() {
            recommendations.push(format!("{} duplicate pattern names", duplicates.len()));
        }

        Ok(StorageAnalysis {
            largest_items,
            duplicate_pattern_names: duplicates.into_iter().collect(),
            recommendations,
        })
    }

    /// Spawns a periodic limit check.
    ///
    /// Warnings are sent on the returned channel whenever usage is above 90%;
    /// the loop ends when the receiver is dropped or the handle is aborted.
    pub fn start_monitoring(
        self: &Arc<Self>,
        interval: Duration,
    ) -> (JoinHandle<()>, mpsc::UnboundedReceiver<QuotaWarning>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip first immediate tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let check = match monitor.check_limits() {
                    Ok(check) => check,
                    Err(e) => {
                        warn!("storage limit check failed: {e}");
                        continue;
                    }
                };

                if !check.recommendations.is_empty() {
                    warn!("storage warning: {:?}", check.recommendations);
                }

                if check.snapshot.usage_percent > ALERT_PERCENT {
                    let warning = QuotaWarning {
                        level: check.level,
                        usage_percent: check.snapshot.usage_percent,
                        message: format!(
                            "storage is {:.1}% full, the app may slow down",
                            check.snapshot.usage_percent
                        ),
                    };
                    if tx.send(warning).is_err() {
                        debug!("quota warning receiver dropped, stopping monitor");
                        break;
                    }
                }
            }
        });

        (handle, rx)
    }
}
