//! Per-key write strategies over the local store and the remote service.
//!
//! | Strategy | Chosen when (in order) | Write path |
//! |---|---|---|
//! | api-first | key contains `auth` or `session` | remote, cache locally; on failure local + queue |
//! | local-first | key contains `ui` or `temp` | local, then queued background upload |
//! | api-only | `sensitive` option or key contains `password` | remote only |
//! | local-only | `cache` option or key contains `cache` | local only |
//! | hybrid | otherwise | remote and local concurrently |
//!
//! Local writes that hit the capacity limit run one emergency cleanup and
//! retry once.

use crate::api_client::{SyncApiClient, endpoint_for_key};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use crate::types::{PendingReport, PendingWrite};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tailor_storage::{
    LocalStore, QuotaMonitor, SecureStore, StorageRecord, StorageResult, keys, now_millis,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageStrategy {
    ApiFirst,
    LocalFirst,
    ApiOnly,
    LocalOnly,
    Hybrid,
}

impl StorageStrategy {
    pub fn for_key(key: &str, options: &WriteOptions) -> Self {
        if key.contains("auth") || key.contains("session") {
            StorageStrategy::ApiFirst
        } else if key.contains("ui") || key.contains("temp") {
            StorageStrategy::LocalFirst
        } else if options.sensitive || key.contains("password") {
            StorageStrategy::ApiOnly
        } else if options.cache || key.contains("cache") {
            StorageStrategy::LocalOnly
        } else {
            StorageStrategy::Hybrid
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub secure: bool,
}

impl WriteOptions {
    pub fn cache() -> Self {
        Self {
            cache: true,
            ..Self::default()
        }
    }

    pub fn secure() -> Self {
        Self {
            secure: true,
            ..Self::default()
        }
    }

    pub fn sensitive() -> Self {
        Self {
            sensitive: true,
            ..Self::default()
        }
    }

    fn goes_to_secure_store(&self) -> bool {
        self.secure || self.sensitive
    }
}

/// Where a [`HybridStorage::set_item`] write landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub strategy: StorageStrategy,
    pub remote: bool,
    pub local: bool,
    /// A pending write was queued for background upload.
    pub queued: bool,
}

impl WriteOutcome {
    fn new(strategy: StorageStrategy) -> Self {
        Self {
            strategy,
            remote: false,
            local: false,
            queued: false,
        }
    }
}

/// Storage policy layer. Clones share the same state.
#[derive(Clone)]
pub struct HybridStorage {
    store: Arc<LocalStore>,
    secure: SecureStore,
    quota: Arc<QuotaMonitor>,
    api: Arc<SyncApiClient>,
    network: NetworkMonitor,
    max_attempts: u32,
    draining: Arc<AtomicBool>,
}

impl HybridStorage {
    pub fn new(
        store: Arc<LocalStore>,
        secure: SecureStore,
        quota: Arc<QuotaMonitor>,
        api: Arc<SyncApiClient>,
        network: NetworkMonitor,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            secure,
            quota,
            api,
            network,
            max_attempts: config.max_attempts,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn device_id(&self) -> &str {
        self.api.device_id()
    }

    /// Writes `value` under `key` using the strategy the key and options select.
    pub async fn set_item(
        &self,
        key: &str,
        value: Value,
        options: WriteOptions,
    ) -> SyncResult<WriteOutcome> {
        let strategy = StorageStrategy::for_key(key, &options);
        debug!("writing {key} with {strategy:?} strategy");
        let mut outcome = WriteOutcome::new(strategy);

        match strategy {
            StorageStrategy::ApiFirst => match self.save_remote(key, &value, options).await {
                Ok(_) => {
                    outcome.remote = true;
                    match self.write_local(key, &value, options) {
                        Ok(()) => outcome.local = true,
                        Err(e) => warn!("saved {key} remotely but local cache failed: {e}"),
                    }
                }
                Err(e) => {
                    warn!("remote write of {key} failed, falling back to local: {e}");
                    self.write_local(key, &value, options)?;
                    outcome.local = true;
                    self.enqueue_pending(PendingWrite::new(key, value, options))?;
                    outcome.queued = true;
                }
            },
            StorageStrategy::LocalFirst => {
                self.write_local(key, &value, options)?;
                outcome.local = true;
                self.enqueue_pending(PendingWrite::new(key, value, options))?;
                outcome.queued = true;

                let storage = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = storage.process_pending_writes().await {
                        warn!("background storage sync failed: {e}");
                    }
                });
            }
            StorageStrategy::ApiOnly => {
                self.save_remote(key, &value, options).await?;
                outcome.remote = true;
            }
            StorageStrategy::LocalOnly => {
                self.write_local(key, &value, options)?;
                outcome.local = true;
            }
            StorageStrategy::Hybrid => {
                let (remote, local) = tokio::join!(self.save_remote(key, &value, options), async {
                    self.write_local(key, &value, options)
                });
                outcome.remote = remote.is_ok();
                outcome.local = local.is_ok();

                match (remote, local) {
                    (Err(remote_err), Err(local_err)) => {
                        error!("hybrid write of {key} failed everywhere: remote {remote_err}, local {local_err}");
                        return Err(local_err);
                    }
                    (Err(e), Ok(())) => warn!("hybrid write of {key}: remote failed: {e}"),
                    (Ok(_), Err(e)) => warn!("hybrid write of {key}: local failed: {e}"),
                    (Ok(_), Ok(())) => {}
                }
            }
        }

        Ok(outcome)
    }

    /// Reads a local value, plain records first, then the secure store.
    pub fn get_item(&self, key: &str) -> SyncResult<Option<Value>> {
        if let Some(value) = self.read_local::<Value>(key)? {
            return Ok(Some(value));
        }
        Ok(self.secure.get_secure_item(key)?)
    }

    /// Reads and deserializes a plain local record.
    pub fn read_local<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
        Ok(self.store.get_json(key)?)
    }

    /// Writes a local value, evicting once and retrying if the store is full.
    pub fn write_local<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: WriteOptions,
    ) -> SyncResult<()> {
        self.with_quota_retry(key, || {
            if options.goes_to_secure_store() {
                Ok(self.secure.set_secure_item(key, value)?)
            } else {
                Ok(self
                    .store
                    .put(&StorageRecord::json(key, value, self.device_id())?)?)
            }
        })
    }

    /// Writes several plain records atomically, with the same eviction retry.
    pub fn write_local_batch(&self, entries: &[(&str, Value)]) -> SyncResult<()> {
        let records = entries
            .iter()
            .map(|(key, value)| StorageRecord::json(*key, value, self.device_id()))
            .collect::<StorageResult<Vec<_>>>()?;
        self.with_quota_retry("batch", || Ok(self.store.put_many(&records)?))
    }

    /// Rewrites the plain record under `key` from its current value in one
    /// store transaction. A missing record starts from `V::default()`.
    ///
    /// `f` runs again if the first write hits the capacity limit.
    pub fn update_local<V, T>(&self, key: &str, mut f: impl FnMut(&mut V) -> T) -> SyncResult<T>
    where
        V: Serialize + DeserializeOwned + Default,
    {
        self.update_local_values(&[key], |current| {
            let mut value: V = match current.into_iter().next().flatten() {
                Some(raw) => serde_json::from_value(raw)?,
                None => V::default(),
            };
            let out = f(&mut value);
            Ok((vec![(key.to_string(), serde_json::to_value(&value)?)], out))
        })
    }

    /// Reads the plain records under `keys` and writes back the entries `f`
    /// returns, atomically against every other writer of the store.
    pub fn update_local_values<T>(
        &self,
        keys: &[&str],
        mut f: impl FnMut(Vec<Option<Value>>) -> SyncResult<(Vec<(String, Value)>, T)>,
    ) -> SyncResult<T> {
        let label = keys.join(",");
        self.with_quota_retry(&label, || {
            self.store.update(keys, |current| {
                let values = current
                    .into_iter()
                    .map(|raw| raw.map(|raw| serde_json::from_str(&raw)).transpose())
                    .collect::<Result<Vec<Option<Value>>, _>>()?;
                let (entries, out) = f(values)?;
                let records = entries
                    .iter()
                    .map(|(key, value)| StorageRecord::json(key.as_str(), value, self.device_id()))
                    .collect::<StorageResult<Vec<_>>>()?;
                Ok((records, out))
            })
        })
    }

    pub fn remove_local(&self, key: &str) -> SyncResult<bool> {
        Ok(self.store.remove(key)?)
    }

    fn with_quota_retry<T>(
        &self,
        key: &str,
        mut op: impl FnMut() -> SyncResult<T>,
    ) -> SyncResult<T> {
        match op() {
            Err(e) if e.is_capacity_exceeded() => {
                warn!("local storage full writing {key}, running emergency cleanup");
                self.quota.emergency_cleanup()?;
                op().inspect_err(|e| error!("local write of {key} failed after cleanup: {e}"))
            }
            other => other,
        }
    }

    async fn save_remote(
        &self,
        key: &str,
        value: &Value,
        options: WriteOptions,
    ) -> SyncResult<Value> {
        if !self.network.is_online() {
            return Err(SyncError::Offline);
        }
        let payload = json!({
            "key": key,
            "value": value,
            "timestamp": now_millis(),
            "deviceId": self.device_id(),
            "sensitive": options.sensitive,
            "cache": options.cache,
            "secure": options.secure,
        });
        self.api.save_value(endpoint_for_key(key), &payload).await
    }

    // ── Pending writes ──

    pub fn pending_writes(&self) -> SyncResult<Vec<PendingWrite>> {
        Ok(self
            .read_local::<Vec<PendingWrite>>(keys::STORAGE_SYNC_QUEUE)?
            .unwrap_or_default())
    }

    fn enqueue_pending(&self, write: PendingWrite) -> SyncResult<()> {
        self.update_local(keys::STORAGE_SYNC_QUEUE, |queue: &mut Vec<PendingWrite>| {
            queue.push(write.clone())
        })
    }

    /// Uploads queued pending writes, oldest first.
    ///
    /// Failed writes stay queued until they have failed `max_attempts`
    /// times. Does nothing while offline or if another drain is running.
    pub async fn process_pending_writes(&self) -> SyncResult<PendingReport> {
        if !self.network.is_online() {
            return Ok(PendingReport {
                remaining: self.pending_writes()?.len(),
                ..PendingReport::default()
            });
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("pending write drain already running");
            return Ok(PendingReport::default());
        }

        let result = self.drain_pending().await;
        self.draining.store(false, Ordering::Release);
        result
    }

    async fn drain_pending(&self) -> SyncResult<PendingReport> {
        let snapshot = self.pending_writes()?;
        let mut results: HashMap<String, bool> = HashMap::new();
        for write in &snapshot {
            let ok = match self.save_remote(&write.key, &write.value, write.options).await {
                Ok(_) => true,
                Err(e) => {
                    debug!("pending write {} failed: {e}", write.key);
                    false
                }
            };
            results.insert(write.id.clone(), ok);
        }

        let max_attempts = self.max_attempts;
        let report = self.update_local(
            keys::STORAGE_SYNC_QUEUE,
            |queue: &mut Vec<PendingWrite>| {
                let mut report = PendingReport::default();
                queue.retain_mut(|write| match results.get(&write.id) {
                    Some(true) => {
                        report.synced += 1;
                        false
                    }
                    Some(false) => {
                        write.attempts += 1;
                        if write.attempts >= max_attempts {
                            error!(
                                "dropping pending write {} after {} attempts",
                                write.key, write.attempts
                            );
                            report.retired += 1;
                            false
                        } else {
                            true
                        }
                    }
                    None => true,
                });
                report.remaining = queue.len();
                report
            },
        )?;

        if report.synced > 0 {
            info!("synced {} pending storage writes", report.synced);
        }
        Ok(report)
    }
}
