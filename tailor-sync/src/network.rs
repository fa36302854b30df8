//! Online/offline signal.

use crate::api_client::SyncApiClient;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared reachability flag. Clones observe the same state.
#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Sets the flag, returning whether it changed. Watchers are only woken
    /// on an actual transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!("network is now {}", if online { "online" } else { "offline" });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Probes `GET /health` and records the result.
    pub async fn probe(&self, api: &SyncApiClient) -> bool {
        let reachable = api.health().await;
        self.set_online(reachable);
        reachable
    }
}
