//! Per-installation device identity.

use crate::error::StorageResult;
use crate::keys;
use crate::record_store::{LocalStore, StorageRecord, now_millis};
use tracing::info;
use uuid::Uuid;

/// Identifier distinguishing one installation from every other.
///
/// Generated once and persisted under [`keys::DEVICE_ID`]; it only changes
/// if the store is wiped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    device_id: String,
}

impl DeviceIdentity {
    /// Loads the persisted identity, creating it on first use.
    pub fn load_or_create(store: &LocalStore) -> StorageResult<Self> {
        if let Some(existing) = store.get_value(keys::DEVICE_ID)? {
            if !existing.is_empty() {
                return Ok(Self {
                    device_id: existing,
                });
            }
        }

        let device_id = generate_device_id();
        store.put(&StorageRecord::new(
            keys::DEVICE_ID,
            device_id.clone(),
            device_id.clone(),
        ))?;
        info!("created device identity {device_id}");
        Ok(Self { device_id })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// Builds a fresh `device_<millis>_<random>` identifier.
pub fn generate_device_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("device_{}_{}", now_millis(), &random[..9])
}
