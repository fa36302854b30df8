//! Local persistence layer for Tailor.
//!
//! Everything a device keeps on disk lives in a single SQLite table of
//! [`StorageRecord`]s, shared by every engine instance of one installation:
//!
//! - [`LocalStore`]: capacity-bounded key/value records with change notifications
//! - [`DeviceIdentity`]: the stable per-installation device id
//! - [`SecureStore`]: obfuscated records with a time-to-live
//! - [`QuotaMonitor`]: usage accounting and emergency eviction
//!
//! Store operations are synchronous and short; callers may use them from
//! async code without holding the store across an await.

pub mod config;
mod error;
pub mod identity;
pub mod keys;
pub mod quota;
pub mod record_store;
pub mod secure;

pub use config::StorageConfig;
pub use error::{StorageError, StorageResult};
pub use identity::DeviceIdentity;
pub use quota::{
    CleanupReport, QuotaCheck, QuotaLevel, QuotaMonitor, QuotaSnapshot, QuotaWarning,
    StorageAnalysis,
};
pub use record_store::{LocalStore, StorageRecord, StoreChange, now_millis};
pub use secure::SecureStore;
