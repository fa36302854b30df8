//! Cross-device sync engine for Tailor.
//!
//! Keeps favorites, the pattern catalog and user records consistent across
//! the devices and tabs of one account:
//! - Outbound change queue with bounded retries ([`DeviceSyncEngine::sync_data`])
//! - Incremental pull by last-sync cursor with echo filtering
//! - Per-key storage strategies fanning writes out locally and remotely
//! - Advisory cross-tab signalling over the shared local store
//! - Typed notifications for the UI layer ([`SyncEventBus`])

pub mod api_client;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hybrid_storage;
pub mod merge;
pub mod network;
mod queue;
pub mod types;

pub use api_client::SyncApiClient;
pub use config::SyncConfig;
pub use engine::{CrossTabSignal, DeviceSyncEngine, UploadOutcome};
pub use error::{SyncError, SyncResult};
pub use events::{SyncEvent, SyncEventBus, SyncEventKind};
pub use hybrid_storage::{HybridStorage, StorageStrategy, WriteOptions, WriteOutcome};
pub use merge::{ApplyOutcome, ReplicaState};
pub use network::NetworkMonitor;
pub use types::*;
