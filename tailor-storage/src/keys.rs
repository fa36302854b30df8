//! Well-known record keys.

/// Stable device identifier.
pub const DEVICE_ID: &str = "deviceId";
/// Sync cursor, milliseconds since the epoch.
pub const LAST_SYNC_TIME: &str = "lastSyncTime";
/// Outbound sync queue (JSON array of sync items).
pub const SYNC_QUEUE: &str = "syncQueue";
/// Background writes owed to the remote service by the storage policy layer.
pub const STORAGE_SYNC_QUEUE: &str = "storageSyncQueue";
/// Pattern catalog (JSON array).
pub const PATTERNS: &str = "patterns";
/// Known users (JSON array).
pub const USERS: &str = "users";
/// Active local user (JSON object).
pub const CURRENT_USER: &str = "currentUser";
/// Bearer token for the remote service.
pub const AUTH_TOKEN: &str = "authToken";
/// Short-lived cross-tab signal.
pub const CROSS_TAB_SIGNAL: &str = "crossDeviceUpdate";

pub const SECURE_PREFIX: &str = "secure_";
pub const EXPIRES_SUFFIX: &str = "_expires";

/// Key holding the obfuscated value of a secure record.
pub fn secure_key(key: &str) -> String {
    format!("{SECURE_PREFIX}{key}")
}

/// Key holding the expiry deadline of a secure record.
pub fn expiry_key(key: &str) -> String {
    format!("{key}{EXPIRES_SUFFIX}")
}

/// Session and temporary records are the first to go under storage pressure.
pub fn is_transient(key: &str) -> bool {
    key.starts_with("session_") || key.contains("temp_")
}
