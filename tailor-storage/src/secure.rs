//! Obfuscated records with a time-to-live.
//!
//! Values are serialized to JSON, XORed against a repeating fixed key and
//! base64-encoded. **This is obfuscation, not encryption**: the key ships
//! with every client, so anyone who can read the store can recover the
//! value. It keeps casual eyes off tokens in the store, nothing more.
//!
//! Layout per logical key `k`:
//! - `secure_k`: the encoded value
//! - `k_expires`: the deadline in milliseconds since the epoch

use crate::config::StorageConfig;
use crate::error::StorageResult;
use crate::keys::{self, EXPIRES_SUFFIX, SECURE_PREFIX};
use crate::record_store::{LocalStore, StorageRecord, now_millis};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

/// XORs `plain` against the repeating `key` and base64-encodes the result.
pub fn obfuscate(plain: &[u8], key: &[u8]) -> String {
    STANDARD.encode(xor_with_key(plain, key))
}

/// Reverses [`obfuscate`]. Returns `None` if `encoded` is not valid base64.
pub fn deobfuscate(encoded: &str, key: &[u8]) -> Option<Vec<u8>> {
    let bytes = STANDARD.decode(encoded).ok()?;
    Some(xor_with_key(&bytes, key))
}

fn xor_with_key(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .zip(key.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}

/// Expiring, obfuscated view over the local store.
#[derive(Clone)]
pub struct SecureStore {
    store: Arc<LocalStore>,
    device_id: String,
    key: Vec<u8>,
    ttl_millis: i64,
}

impl SecureStore {
    pub fn new(store: Arc<LocalStore>, device_id: impl Into<String>, config: &StorageConfig) -> Self {
        Self {
            store,
            device_id: device_id.into(),
            key: config.obfuscation_key.as_bytes().to_vec(),
            ttl_millis: config.secure_ttl_secs.saturating_mul(1000),
        }
    }

    /// Overrides the record lifetime.
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self
    }

    pub fn set_secure_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let encoded = obfuscate(&serde_json::to_vec(value)?, &self.key);
        let expires_at = now_millis().saturating_add(self.ttl_millis);

        self.store.put_many(&[
            StorageRecord::new(keys::secure_key(key), encoded, self.device_id.as_str())
                .with_expiry(expires_at),
            StorageRecord::new(
                keys::expiry_key(key),
                expires_at.to_string(),
                self.device_id.as_str(),
            ),
        ])?;
        debug!("stored secure item {key}, expires at {expires_at}");
        Ok(())
    }

    /// Reads a secure item. Expired or undecodable items are absent.
    pub fn get_secure_item<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        if let Some(deadline) = self.store.get_value(&keys::expiry_key(key))? {
            let expired = deadline
                .parse::<i64>()
                .map(|deadline| now_millis() >= deadline)
                .unwrap_or(true);
            if expired {
                debug!("secure item {key} expired");
                self.remove_secure_item(key)?;
                return Ok(None);
            }
        }

        let Some(encoded) = self.store.get_value(&keys::secure_key(key))? else {
            return Ok(None);
        };

        let Some(plain) = deobfuscate(&encoded, &self.key) else {
            warn!("secure item {key} is not valid base64");
            return Ok(None);
        };

        match serde_json::from_slice(&plain) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("failed to decode secure item {key}: {e}");
                Ok(None)
            }
        }
    }

    pub fn remove_secure_item(&self, key: &str) -> StorageResult<()> {
        self.store.remove(&keys::secure_key(key))?;
        self.store.remove(&keys::expiry_key(key))?;
        Ok(())
    }

    /// Removes every secure record and expiry marker. Returns the count removed.
    pub fn clear_secure_storage(&self) -> StorageResult<usize> {
        let mut removed = 0;
        for key in self.store.keys()? {
            if (key.starts_with(SECURE_PREFIX) || key.ends_with(EXPIRES_SUFFIX))
                && self.store.remove(&key)?
            {
                removed += 1;
            }
        }
        debug!("cleared {removed} secure records");
        Ok(removed)
    }

    /// Purges every secure item whose deadline has passed.
    ///
    /// Returns the logical keys that were removed.
    pub fn cleanup_expired(&self) -> StorageResult<Vec<String>> {
        let now = now_millis();
        let mut removed = Vec::new();

        for marker in self.store.keys()? {
            let Some(base) = marker.strip_suffix(EXPIRES_SUFFIX) else {
                continue;
            };
            let Some(deadline) = self.store.get_value(&marker)? else {
                continue;
            };
            let expired = deadline.parse::<i64>().map(|d| now >= d).unwrap_or(true);
            if expired {
                self.remove_secure_item(base)?;
                debug!("expired secure item removed: {base}");
                removed.push(base.to_string());
            }
        }

        Ok(removed)
    }
}
