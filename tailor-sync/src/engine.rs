//! Device sync engine.
//!
//! Owns the outbound change queue and keeps the local replica in step with
//! the remote service:
//! - `sync_data` queues a mutation and uploads it immediately when online
//! - `process_sync_queue` drains the queue oldest first, then pulls
//! - `pull_from_server` fetches changes since the cursor, skipping echoes
//!   of this device's own changes
//! - background tasks (`start`, `start_auto_sync`) follow network
//!   transitions, other tabs' queue signals and quota warnings
//!
//! Background tasks hold only weak references to the engine; call
//! [`DeviceSyncEngine::stop`] to cancel them deterministically.

use crate::api_client::SyncApiClient;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEventBus, SyncEventKind};
use crate::hybrid_storage::HybridStorage;
use crate::merge::{ApplyOutcome, ReplicaState};
use crate::network::NetworkMonitor;
use crate::queue::SyncQueue;
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tailor_storage::{
    DeviceIdentity, LocalStore, QuotaMonitor, QuotaWarning, SecureStore, StorageRecord,
    StoreChange, keys, now_millis,
};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Payload of the `crossDeviceUpdate` sentinel record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossTabSignal {
    pub action: String,
    pub data: Value,
    pub timestamp: i64,
    pub device_id: String,
    pub tab_id: String,
}

/// Result of one upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    /// Upload failed; the item stays queued.
    Failed { attempts: u32 },
    /// Upload failed for the last allowed time; the item was dropped.
    Retired,
    /// Already in flight elsewhere, or no longer queued.
    Skipped,
}

struct EngineInner {
    config: SyncConfig,
    device_id: String,
    /// Distinguishes engines sharing one store (and so one device id).
    tab_id: String,
    store: Arc<LocalStore>,
    secure: SecureStore,
    quota: Arc<QuotaMonitor>,
    api: Arc<SyncApiClient>,
    storage: HybridStorage,
    network: NetworkMonitor,
    bus: SyncEventBus,
    queue: SyncQueue,
    /// Last network state this engine reacted to.
    observed_online: AtomicBool,
    in_flight: Mutex<HashSet<String>>,
    uploads: Mutex<JoinSet<()>>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Sync engine handle. Clones share one engine.
#[derive(Clone)]
pub struct DeviceSyncEngine {
    inner: Arc<EngineInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawns on the current runtime, if there is one.
fn spawn_detached<F>(future: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
            true
        }
        Err(_) => {
            debug!("no async runtime, background task not started");
            false
        }
    }
}

/// Removes the in-flight marker when an upload finishes.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.id);
    }
}

impl DeviceSyncEngine {
    /// Builds an engine over `store`, creating the device identity on first use.
    pub fn new(
        config: SyncConfig,
        store: Arc<LocalStore>,
        network: NetworkMonitor,
        bus: SyncEventBus,
    ) -> SyncResult<Self> {
        let identity = DeviceIdentity::load_or_create(&store)?;
        let device_id = identity.device_id().to_string();

        let secure = SecureStore::new(Arc::clone(&store), &device_id, &config.storage);
        let quota = Arc::new(QuotaMonitor::new(
            Arc::clone(&store),
            secure.clone(),
            &config.storage,
        ));
        let api = Arc::new(SyncApiClient::new(&config, &device_id)?);
        let storage = HybridStorage::new(
            Arc::clone(&store),
            secure.clone(),
            Arc::clone(&quota),
            Arc::clone(&api),
            network.clone(),
            &config,
        );

        let token = storage
            .read_local::<String>(keys::AUTH_TOKEN)
            .unwrap_or_else(|e| {
                warn!("ignoring unreadable auth token: {e}");
                None
            });
        if token.is_some() {
            api.set_access_token(token);
        }

        info!("device sync engine ready for {device_id}");
        Ok(Self {
            inner: Arc::new(EngineInner {
                observed_online: AtomicBool::new(network.is_online()),
                queue: SyncQueue::new(storage.clone()),
                tab_id: Uuid::new_v4().simple().to_string(),
                config,
                device_id,
                store,
                secure,
                quota,
                api,
                storage,
                network,
                bus,
                in_flight: Mutex::new(HashSet::new()),
                uploads: Mutex::new(JoinSet::new()),
                auto_sync: Mutex::new(None),
                background: Mutex::new(Vec::new()),
            }),
        })
    }

    fn upgrade(weak: &Weak<EngineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    pub fn events(&self) -> &SyncEventBus {
        &self.inner.bus
    }

    pub fn storage(&self) -> &HybridStorage {
        &self.inner.storage
    }

    pub fn api(&self) -> &SyncApiClient {
        &self.inner.api
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub fn quota(&self) -> &QuotaMonitor {
        &self.inner.quota
    }

    pub fn is_online(&self) -> bool {
        self.inner.network.is_online()
    }

    // ── Outbound ──

    /// Queues a local mutation and returns its id.
    ///
    /// When online the upload starts in the background; otherwise the item
    /// waits for the next drain. Only local storage failures are reported.
    pub fn sync_data(
        &self,
        data_type: DataType,
        payload: Value,
        operation: SyncOperation,
    ) -> SyncResult<String> {
        let item = SyncItem::new(&self.inner.device_id, data_type, operation, payload);
        let id = item.id.clone();
        let signal_data = serde_json::to_value(&item)?;
        self.inner.queue.push(item)?;
        debug!("queued {data_type} {operation:?} as {id}");

        self.notify_other_tabs("queueUpdated", signal_data);

        if self.is_online() {
            self.spawn_upload(id.clone());
        } else {
            debug!("offline, {id} stays queued");
        }
        Ok(id)
    }

    fn spawn_upload(&self, id: String) {
        let Ok(handle) = Handle::try_current() else {
            debug!("no async runtime, {id} left for the next drain");
            return;
        };
        let engine = self.clone();
        let mut uploads = lock(&self.inner.uploads);
        while uploads.try_join_next().is_some() {}
        uploads.spawn_on(
            async move {
                if let Err(e) = engine.upload_item(&id).await {
                    warn!("upload of {id} failed locally: {e}");
                }
            },
            &handle,
        );
    }

    fn claim(&self, id: &str) -> Option<InFlight<'_>> {
        if !lock(&self.inner.in_flight).insert(id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.inner.in_flight,
            id: id.to_string(),
        })
    }

    /// Uploads one queued item, retiring it after the last allowed failure.
    pub async fn upload_item(&self, id: &str) -> SyncResult<UploadOutcome> {
        let Some(_in_flight) = self.claim(id) else {
            debug!("{id} already uploading");
            return Ok(UploadOutcome::Skipped);
        };
        let Some(item) = self.inner.queue.get(id)? else {
            return Ok(UploadOutcome::Skipped);
        };

        match self.inner.api.upload_item(&item).await {
            Ok(()) => {
                self.inner.queue.complete(id)?;
                info!("synced {} {id}", item.data_type);
                self.notify_other_tabs("itemSynced", json!({ "id": id }));
                Ok(UploadOutcome::Uploaded)
            }
            Err(e) => {
                let max = self.inner.config.max_attempts;
                let Some(failure) = self.inner.queue.record_failure(id, &e.to_string(), max)?
                else {
                    return Ok(UploadOutcome::Skipped);
                };
                if failure.retired {
                    error!("dropping {id} after {} failed attempts: {e}", failure.attempts);
                    self.notify_other_tabs("itemRetired", json!({ "id": id }));
                    Ok(UploadOutcome::Retired)
                } else {
                    warn!("upload of {id} failed (attempt {}/{max}): {e}", failure.attempts);
                    Ok(UploadOutcome::Failed {
                        attempts: failure.attempts,
                    })
                }
            }
        }
    }

    /// Uploads every pending item oldest first, retries pending storage
    /// writes, then pulls once.
    pub async fn process_sync_queue(&self) -> SyncReport {
        let mut report = SyncReport::default();
        if !self.is_online() {
            debug!("offline, skipping sync queue");
            report.skipped_offline = true;
            return report;
        }

        let pending = match self.inner.queue.pending() {
            Ok(pending) => pending,
            Err(e) => {
                error!("could not read sync queue: {e}");
                Vec::new()
            }
        };
        if !pending.is_empty() {
            info!("processing {} pending sync items", pending.len());
        }

        for item in pending {
            match self.upload_item(&item.id).await {
                Ok(UploadOutcome::Uploaded) => report.uploaded += 1,
                Ok(UploadOutcome::Failed { .. }) => report.failed += 1,
                Ok(UploadOutcome::Retired) => report.retired += 1,
                Ok(UploadOutcome::Skipped) => {}
                Err(e) => {
                    error!("sync queue update for {} failed: {e}", item.id);
                    report.failed += 1;
                }
            }
        }

        match self.inner.storage.process_pending_writes().await {
            Ok(pending) => report.pending_writes = pending,
            Err(e) => error!("pending storage writes not processed: {e}"),
        }

        match self.pull_from_server().await {
            Ok(applied) => report.pulled = Some(applied),
            Err(e) => warn!("pull from server failed: {e}"),
        }
        report
    }

    /// Emergency bulk delivery of the whole queue, for teardown.
    ///
    /// Returns whether a send was started. The send runs detached, is not
    /// retried and is not cancelled by [`Self::stop`].
    pub fn emergency_sync(&self) -> bool {
        if !self.is_online() {
            return false;
        }
        let queue = match self.inner.queue.load() {
            Ok(queue) if !queue.is_empty() => queue,
            Ok(_) => return false,
            Err(e) => {
                warn!("emergency sync skipped, queue unreadable: {e}");
                return false;
            }
        };

        warn!("emergency sync of {} queued items", queue.len());
        let api = Arc::clone(&self.inner.api);
        spawn_detached(async move {
            if let Err(e) = api.send_emergency(&queue).await {
                debug!("emergency sync not delivered: {e}");
            }
        })
    }

    // ── Inbound ──

    /// Cursor of the last successful pull, 0 before the first one.
    pub fn last_sync_time(&self) -> i64 {
        match self.inner.storage.read_local::<i64>(keys::LAST_SYNC_TIME) {
            Ok(cursor) => cursor.unwrap_or(0),
            Err(e) => {
                warn!("unreadable sync cursor, pulling from the start: {e}");
                0
            }
        }
    }

    fn advance_cursor(&self, to: i64) -> SyncResult<()> {
        self.inner
            .storage
            .update_local(keys::LAST_SYNC_TIME, |cursor: &mut i64| {
                *cursor = (*cursor).max(to);
            })
    }

    /// Fetches and applies changes made on other devices since the cursor.
    ///
    /// Returns the number of changes applied. The cursor moves to the time
    /// the request was issued, and only if every change was committed.
    pub async fn pull_from_server(&self) -> SyncResult<usize> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        let since = self.last_sync_time();
        let requested_at = now_millis();
        let raw = self.inner.api.fetch_changes(since).await?;
        debug!("pulled {} changes since {since}", raw.len());

        let mut changes = Vec::new();
        for value in raw {
            match serde_json::from_value::<RemoteChange>(value) {
                Ok(change) if change.device_id == self.inner.device_id => {}
                Ok(change) => changes.push(change),
                Err(e) => warn!("skipping malformed change: {e}"),
            }
        }

        let (applied, favorites) = ReplicaState::update(&self.inner.storage, |replica| {
            let mut applied = Vec::new();
            let mut favorites = Vec::new();
            for change in &changes {
                match replica.apply(change) {
                    ApplyOutcome::Skipped => continue,
                    ApplyOutcome::FavoritesReplaced(list) => favorites.push(list),
                    ApplyOutcome::Changed | ApplyOutcome::NoOp => {}
                }
                applied.push(change.clone());
            }
            (applied, favorites)
        })?;

        self.advance_cursor(requested_at)?;

        for list in favorites {
            self.inner.bus.publish(SyncEventKind::FavoritesUpdated, list);
        }
        if !applied.is_empty() {
            info!("applied {} remote changes", applied.len());
            let changes = serde_json::to_value(&applied)?;
            self.inner
                .bus
                .publish(SyncEventKind::DataUpdated, json!({ "changes": changes }));
        }
        Ok(applied.len())
    }

    /// Applies a single remote change to local state and commits it.
    pub fn apply_change(&self, change: &RemoteChange) -> SyncResult<ApplyOutcome> {
        let outcome = ReplicaState::update(&self.inner.storage, |replica| replica.apply(change))?;
        if let ApplyOutcome::FavoritesReplaced(list) = &outcome {
            self.inner
                .bus
                .publish(SyncEventKind::FavoritesUpdated, list.clone());
        }
        Ok(outcome)
    }

    /// Pulls if online; used when the app regains focus.
    pub async fn check_for_updates(&self) -> SyncResult<usize> {
        if !self.is_online() {
            return Ok(0);
        }
        self.pull_from_server().await
    }

    /// Drains the queue and pulls. True if the pull succeeded.
    pub async fn full_sync(&self) -> bool {
        if !self.is_online() {
            warn!("full sync requested while offline");
            return false;
        }
        self.process_sync_queue().await.pulled.is_some()
    }

    // ── Network ──

    /// Records a network transition. Going online drains the queue.
    pub async fn set_online(&self, online: bool) {
        self.inner.network.set_online(online);
        self.handle_network_change(online).await;
    }

    async fn handle_network_change(&self, online: bool) {
        if self.inner.observed_online.swap(online, Ordering::AcqRel) == online {
            return;
        }
        if online {
            info!("connection restored, processing sync queue");
            let report = self.process_sync_queue().await;
            debug!(?report, "reconnect drain finished");
        } else {
            info!("connection lost, changes will queue locally");
        }
    }

    // ── Cross-tab ──

    fn notify_other_tabs(&self, action: &str, data: Value) {
        let signal = CrossTabSignal {
            action: action.to_string(),
            data,
            timestamp: now_millis(),
            device_id: self.inner.device_id.clone(),
            tab_id: self.inner.tab_id.clone(),
        };
        let record = match StorageRecord::json(keys::CROSS_TAB_SIGNAL, &signal, &self.inner.device_id)
        {
            Ok(record) => record,
            Err(e) => {
                debug!("cross-tab signal not encoded: {e}");
                return;
            }
        };
        if let Err(e) = self.inner.store.put(&record) {
            debug!("cross-tab signal not written: {e}");
            return;
        }

        let store = Arc::clone(&self.inner.store);
        let ttl = self.inner.config.cross_tab_signal_ttl();
        spawn_detached(async move {
            tokio::time::sleep(ttl).await;
            // Leave a newer signal from another tab in place.
            match store.get_value(keys::CROSS_TAB_SIGNAL) {
                Ok(Some(current)) if current == record.value => {
                    if let Err(e) = store.remove(keys::CROSS_TAB_SIGNAL) {
                        debug!("cross-tab signal not removed: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("cross-tab signal not checked: {e}"),
            }
        });
    }

    fn handle_store_change(&self, change: &StoreChange) {
        if change.key != keys::CROSS_TAB_SIGNAL {
            return;
        }
        let Some(raw) = &change.new_value else {
            return;
        };
        let signal: CrossTabSignal = match serde_json::from_str(raw) {
            Ok(signal) => signal,
            Err(e) => {
                debug!("ignoring unreadable cross-tab signal: {e}");
                return;
            }
        };
        if signal.tab_id == self.inner.tab_id {
            return;
        }
        match serde_json::to_value(&signal) {
            Ok(data) => {
                self.inner.bus.publish(SyncEventKind::CrossTabUpdate, data);
            }
            Err(e) => debug!("cross-tab signal not republished: {e}"),
        }
    }

    // ── Lifecycle ──

    /// Starts following network transitions, other tabs and quota warnings,
    /// and arms auto-sync at the configured interval.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while
    /// started does nothing.
    pub fn start(&self) {
        let mut background = lock(&self.inner.background);
        if !background.is_empty() {
            debug!("device sync engine already started");
            return;
        }

        let interval = self.inner.config.monitor_interval();
        let warnings = if interval.is_zero() {
            warn!("quota monitor disabled, interval is zero");
            mpsc::unbounded_channel().1
        } else {
            let (monitor, warnings) = self.inner.quota.start_monitoring(interval);
            background.push(monitor);
            warnings
        };
        background.push(tokio::spawn(listen(
            Arc::downgrade(&self.inner),
            self.inner.network.subscribe(),
            self.inner.store.subscribe(),
            warnings,
        )));
        drop(background);
        self.start_auto_sync(self.inner.config.auto_sync_interval());
        info!("device sync engine started (tab {})", self.inner.tab_id);
    }

    /// Cancels listeners, timers and in-flight uploads. The queue persists.
    pub fn stop(&self) {
        self.stop_auto_sync();
        for task in lock(&self.inner.background).drain(..) {
            task.abort();
        }
        lock(&self.inner.uploads).abort_all();
        info!("device sync engine stopped");
    }

    /// Runs [`Self::process_sync_queue`] every `interval`, replacing any
    /// previous timer.
    pub fn start_auto_sync(&self, interval: Duration) {
        if interval.is_zero() {
            warn!("auto-sync interval must be positive");
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip first immediate tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(engine) = DeviceSyncEngine::upgrade(&weak) else {
                    break;
                };
                let report = engine.process_sync_queue().await;
                debug!(?report, "auto-sync tick");
            }
        });

        if let Some(previous) = lock(&self.inner.auto_sync).replace(timer) {
            previous.abort();
        }
        info!("auto-sync started ({interval:?} interval)");
    }

    pub fn stop_auto_sync(&self) {
        if let Some(timer) = lock(&self.inner.auto_sync).take() {
            timer.abort();
            info!("auto-sync stopped");
        }
    }

    pub fn is_auto_sync_active(&self) -> bool {
        lock(&self.inner.auto_sync)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    // ── Diagnostics ──

    pub fn sync_stats(&self) -> SyncResult<SyncStats> {
        let queue = self.inner.queue.load()?;
        Ok(SyncStats {
            device_id: self.inner.device_id.clone(),
            online: self.is_online(),
            last_sync_time: self.last_sync_time(),
            queue_length: queue.len(),
            pending_items: queue.iter().filter(|item| !item.synced).count(),
            failed_items: queue.iter().filter(|item| item.attempts > 0).count(),
            auto_sync_active: self.is_auto_sync_active(),
        })
    }

    /// Forgets the signed-in user on this device.
    pub fn logout_device(&self) -> SyncResult<()> {
        self.inner.store.remove(keys::CURRENT_USER)?;
        self.inner.store.remove(keys::AUTH_TOKEN)?;
        let cleared = self.inner.secure.clear_secure_storage()?;
        self.inner.api.set_access_token(None);

        info!("device {} logged out ({cleared} secure records cleared)", self.inner.device_id);
        self.inner.bus.publish(
            SyncEventKind::DeviceLoggedOut,
            json!({ "deviceId": self.inner.device_id }),
        );
        Ok(())
    }
}

async fn listen(
    inner: Weak<EngineInner>,
    mut network: watch::Receiver<bool>,
    mut changes: broadcast::Receiver<StoreChange>,
    mut warnings: mpsc::UnboundedReceiver<QuotaWarning>,
) {
    let mut network_open = true;
    let mut warnings_open = true;

    loop {
        tokio::select! {
            changed = network.changed(), if network_open => {
                if changed.is_err() {
                    network_open = false;
                    continue;
                }
                let online = *network.borrow_and_update();
                let Some(engine) = DeviceSyncEngine::upgrade(&inner) else {
                    break;
                };
                tokio::spawn(async move { engine.handle_network_change(online).await });
            }
            change = changes.recv() => match change {
                Ok(change) => {
                    let Some(engine) = DeviceSyncEngine::upgrade(&inner) else {
                        break;
                    };
                    engine.handle_store_change(&change);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("missed {missed} store notifications");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            warning = warnings.recv(), if warnings_open => match warning {
                Some(warning) => {
                    let Some(engine) = DeviceSyncEngine::upgrade(&inner) else {
                        break;
                    };
                    warn!("{}", warning.message);
                    match serde_json::to_value(&warning) {
                        Ok(data) => {
                            engine.inner.bus.publish(SyncEventKind::StorageWarning, data);
                        }
                        Err(e) => debug!("storage warning not republished: {e}"),
                    }
                }
                None => warnings_open = false,
            },
        }
    }
    debug!("sync engine listener finished");
}
