//! Shared helpers for engine and storage policy tests.

#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tailor_storage::{LocalStore, QuotaMonitor, SecureStore, StorageConfig};
use tailor_sync::{
    DeviceSyncEngine, HybridStorage, NetworkMonitor, SyncApiClient, SyncConfig, SyncEvent,
    SyncEventBus,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config_for(server: &MockServer) -> SyncConfig {
    SyncConfig {
        api_base_url: server.uri(),
        request_timeout_secs: 5,
        ..SyncConfig::default()
    }
}

pub fn memory_store() -> Arc<LocalStore> {
    store_with_capacity(StorageConfig::default().capacity_bytes)
}

pub fn store_with_capacity(capacity: u64) -> Arc<LocalStore> {
    Arc::new(LocalStore::open_in_memory(capacity).unwrap())
}

pub fn engine(server: &MockServer, store: Arc<LocalStore>, online: bool) -> DeviceSyncEngine {
    engine_with_config(config_for(server), store, online)
}

pub fn engine_with_config(
    config: SyncConfig,
    store: Arc<LocalStore>,
    online: bool,
) -> DeviceSyncEngine {
    init_tracing();
    DeviceSyncEngine::new(config, store, NetworkMonitor::new(online), SyncEventBus::new()).unwrap()
}

/// Policy layer over `store` talking to `server`.
pub fn hybrid(server: &MockServer, store: Arc<LocalStore>, online: bool) -> (HybridStorage, NetworkMonitor) {
    init_tracing();
    let mut config = config_for(server);
    config.storage.capacity_bytes = store.capacity_bytes();
    let secure = SecureStore::new(Arc::clone(&store), "device_test", &config.storage);
    let quota = Arc::new(QuotaMonitor::new(Arc::clone(&store), secure.clone(), &config.storage));
    let api = Arc::new(SyncApiClient::new(&config, "device_test").unwrap());
    let network = NetworkMonitor::new(online);
    let storage = HybridStorage::new(store, secure, quota, api, network.clone(), &config);
    (storage, network)
}

pub async fn mount_empty_changes(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/sync/changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
}

/// Polls `condition` until it holds or three seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 3s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
