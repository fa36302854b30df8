//! In-process notifications for the UI layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncEventKind {
    /// Remote changes were applied to local state.
    DataUpdated,
    /// The active user's favorites were replaced by a remote change.
    FavoritesUpdated,
    DeviceLoggedOut,
    /// Another engine sharing the local store changed its queue.
    CrossTabUpdate,
    /// Local storage crossed the alert threshold.
    StorageWarning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub kind: SyncEventKind,
    pub data: Value,
}

type Subscribers = HashMap<SyncEventKind, Vec<mpsc::UnboundedSender<SyncEvent>>>;

/// Typed publish/subscribe keyed by event kind.
///
/// A subscriber receives every event of its kind published after it
/// subscribed. Dropping the receiver unsubscribes.
#[derive(Clone, Default)]
pub struct SyncEventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl SyncEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: SyncEventKind) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().entry(kind).or_default().push(tx);
        rx
    }

    /// Delivers an event to every live subscriber of `kind`, returning how
    /// many received it.
    pub fn publish(&self, kind: SyncEventKind, data: Value) -> usize {
        let event = SyncEvent { kind, data };
        let mut subscribers = self.lock();
        let Some(senders) = subscribers.get_mut(&kind) else {
            debug!("no subscribers for {kind:?}");
            return 0;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }

    pub fn subscriber_count(&self, kind: SyncEventKind) -> usize {
        self.lock()
            .get(&kind)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
