//! Wire and queue types shared by the engine and the storage policy layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tailor_storage::now_millis;
use uuid::Uuid;

use crate::hybrid_storage::WriteOptions;

/// Kind of application data a change carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Patterns,
    Favorites,
    Users,
    Session,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Patterns => "patterns",
            DataType::Favorites => "favorites",
            DataType::Users => "users",
            DataType::Session => "session",
        }
    }

    /// Parses a wire name; `None` for types this engine does not know.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "patterns" => Some(DataType::Patterns),
            "favorites" => Some(DataType::Favorites),
            "users" => Some(DataType::Users),
            "session" => Some(DataType::Session),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// One local mutation awaiting upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    pub id: String,
    pub device_id: String,
    pub data_type: DataType,
    pub operation: SyncOperation,
    #[serde(rename = "data")]
    pub payload: Value,
    /// Creation time, milliseconds since the epoch.
    #[serde(rename = "timestamp")]
    pub created_at: i64,
    pub synced: bool,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
}

impl SyncItem {
    pub fn new(
        device_id: impl Into<String>,
        data_type: DataType,
        operation: SyncOperation,
        payload: Value,
    ) -> Self {
        Self {
            id: format!("sync_{}", Uuid::now_v7().simple()),
            device_id: device_id.into(),
            data_type,
            operation,
            payload,
            created_at: now_millis(),
            synced: false,
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    /// Records a failed upload. Returns true once the item has used up
    /// `max_attempts` and must be retired.
    pub fn record_failure(&mut self, error: impl Into<String>, max_attempts: u32) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
        self.last_attempt_at = Some(now_millis());
        self.attempts >= max_attempts
    }
}

/// One element of a `GET /sync/changes` response.
///
/// `data_type` stays a string so unknown types can be logged and skipped
/// instead of failing the whole pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub device_id: String,
    pub data_type: String,
    pub operation: SyncOperation,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    /// Server-side time of the change; its format is not relied on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

impl RemoteChange {
    pub fn kind(&self) -> Option<DataType> {
        DataType::parse(&self.data_type)
    }

    /// Owner of a favorites change: the top-level `userId`, else `data.userId`.
    pub fn owner(&self) -> Option<&Value> {
        self.user_id
            .as_ref()
            .filter(|v| !v.is_null())
            .or_else(|| self.data.get("userId").filter(|v| !v.is_null()))
    }
}

impl From<&SyncItem> for RemoteChange {
    fn from(item: &SyncItem) -> Self {
        Self {
            device_id: item.device_id.clone(),
            data_type: item.data_type.as_str().to_string(),
            operation: item.operation,
            data: item.payload.clone(),
            user_id: None,
            timestamp: Some(Value::from(item.created_at)),
        }
    }
}

/// Entry of the storage policy layer's background queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
    pub id: String,
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub options: WriteOptions,
    pub timestamp: i64,
    pub attempts: u32,
}

impl PendingWrite {
    pub fn new(key: impl Into<String>, value: Value, options: WriteOptions) -> Self {
        Self {
            id: Uuid::now_v7().simple().to_string(),
            key: key.into(),
            value,
            options,
            timestamp: now_millis(),
            attempts: 0,
        }
    }
}

/// Outcome of one queue drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub uploaded: usize,
    pub failed: usize,
    pub retired: usize,
    /// Changes applied by the trailing pull; `None` if the pull failed or
    /// the drain was skipped.
    pub pulled: Option<usize>,
    pub skipped_offline: bool,
    /// Pending storage writes retried during the drain.
    pub pending_writes: PendingReport,
}

/// Result of [`crate::HybridStorage::process_pending_writes`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReport {
    pub synced: usize,
    pub retired: usize,
    pub remaining: usize,
}

/// Diagnostic view of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub device_id: String,
    pub online: bool,
    pub last_sync_time: i64,
    pub queue_length: usize,
    pub pending_items: usize,
    /// Items still queued after at least one failed upload.
    pub failed_items: usize,
    pub auto_sync_active: bool,
}
