//! Capacity-bounded record store backed by SQLite.
//!
//! Every write and remove is broadcast as a [`StoreChange`] to all
//! subscribers, which is how engine instances sharing one store notice
//! each other's activity.

use crate::error::{StorageError, StorageResult};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    written_at INTEGER NOT NULL,
    device_id TEXT NOT NULL,
    expires_at INTEGER
);";

const RECORD_COLUMNS: &str = "key, value, written_at, device_id, expires_at";
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// The unit of local persistence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRecord {
    pub key: String,
    pub value: String,
    pub written_at: i64,
    pub device_id: String,
    pub expires_at: Option<i64>,
}

impl StorageRecord {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            written_at: now_millis(),
            device_id: device_id.into(),
            expires_at: None,
        }
    }

    /// Serializes `value` as JSON into a new record.
    pub fn json<T: Serialize + ?Sized>(
        key: impl Into<String>,
        value: &T,
        device_id: impl Into<String>,
    ) -> StorageResult<Self> {
        Ok(Self::new(key, serde_json::to_string(value)?, device_id))
    }

    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// A record is expired from its deadline onwards.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Bytes this record counts against the store capacity.
    pub fn size_bytes(&self) -> u64 {
        (self.key.len() + self.value.len()) as u64
    }
}

/// Notification emitted after a record is written or removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    /// `None` when the record was removed.
    pub new_value: Option<String>,
}

/// Key/value store shared by every engine instance of one installation.
pub struct LocalStore {
    conn: Mutex<Connection>,
    capacity_bytes: u64,
    changes: broadcast::Sender<StoreChange>,
}

impl LocalStore {
    /// Opens (or creates) a store file.
    pub fn open(path: &Path, capacity_bytes: u64) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, capacity_bytes)
    }

    /// Opens a throwaway store that lives only as long as this value.
    pub fn open_in_memory(capacity_bytes: u64) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, capacity_bytes)
    }

    fn with_connection(conn: Connection, capacity_bytes: u64) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            capacity_bytes,
            changes,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Subscribes to write/remove notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Reads a record. Expired records are removed and reported as absent.
    pub fn get(&self, key: &str) -> StorageResult<Option<StorageRecord>> {
        let record = read_record(&self.conn(), key)?;
        match record {
            Some(record) if record.is_expired_at(now_millis()) => {
                debug!("record {key} expired, removing on access");
                self.remove_if_expired(key)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub fn get_value(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.get(key)?.map(|r| r.value))
    }

    /// Reads and deserializes a JSON record.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get_value(key)? {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                StorageError::InvalidRecord {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            }),
            None => Ok(None),
        }
    }

    pub fn put(&self, record: &StorageRecord) -> StorageResult<()> {
        self.put_many(std::slice::from_ref(record))
    }

    /// Writes all records in one transaction, or none of them.
    ///
    /// Fails with [`StorageError::CapacityExceeded`] when the store would
    /// exceed its capacity after the write.
    pub fn put_many(&self, records: &[StorageRecord]) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            write_records(&tx, records, self.capacity_bytes)?;
            tx.commit()?;
        }

        for record in records {
            self.notify(&record.key, Some(record.value.clone()));
        }
        Ok(())
    }

    /// Reads `keys`, hands their values to `f` and writes the records it
    /// returns, all in one immediate transaction.
    ///
    /// Updaters sharing this store, or another connection to the same file,
    /// are serialized, so none of them writes back a stale read. Expired
    /// records reach `f` as `None`. `f` must not call back into this store.
    pub fn update<T, E>(
        &self,
        keys: &[&str],
        f: impl FnOnce(Vec<Option<String>>) -> Result<(Vec<StorageRecord>, T), E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let (records, out) = {
            let mut conn = self.conn();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StorageError::from)?;

            let now = now_millis();
            let mut current = Vec::with_capacity(keys.len());
            for key in keys {
                let record = read_record(&tx, key)?;
                current.push(
                    record
                        .filter(|record| !record.is_expired_at(now))
                        .map(|record| record.value),
                );
            }

            let (records, out) = f(current)?;
            write_records(&tx, &records, self.capacity_bytes)?;
            tx.commit().map_err(StorageError::from)?;
            (records, out)
        };

        for record in records {
            self.notify(&record.key, Some(record.value));
        }
        Ok(out)
    }

    /// Removes a record, returning whether it existed.
    pub fn remove(&self, key: &str) -> StorageResult<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM records WHERE key = ?1", params![key])?;
        if removed > 0 {
            self.notify(key, None);
        }
        Ok(removed > 0)
    }

    /// Removes a record only if its deadline has passed, so a fresh write
    /// that raced the expiry check survives.
    pub fn remove_if_expired(&self, key: &str) -> StorageResult<bool> {
        let removed = self.conn().execute(
            "DELETE FROM records WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, now_millis()],
        )?;
        if removed > 0 {
            self.notify(key, None);
        }
        Ok(removed > 0)
    }

    /// All keys currently held, including expired records not yet purged.
    pub fn keys(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key FROM records ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Byte size of every record, keyed by record key.
    pub fn record_sizes(&self) -> StorageResult<BTreeMap<String, u64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key, LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB)) FROM records",
        )?;
        let sizes = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(sizes)
    }

    /// Total bytes used by all records.
    pub fn usage_bytes(&self) -> StorageResult<u64> {
        let conn = self.conn();
        usage_bytes(&conn)
    }

    /// Physically removes every record whose deadline has passed.
    pub fn purge_expired(&self) -> StorageResult<Vec<String>> {
        let now = now_millis();
        let expired = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT key FROM records WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            )?;
            let keys = stmt
                .query_map(params![now], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            conn.execute(
                "DELETE FROM records WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            keys
        };
        for key in &expired {
            self.notify(key, None);
        }
        Ok(expired)
    }

    /// Wipes the store, including device identity and sync cursor.
    pub fn clear(&self) -> StorageResult<()> {
        let keys = self.keys()?;
        self.conn().execute("DELETE FROM records", [])?;
        for key in &keys {
            self.notify(key, None);
        }
        debug!("cleared {} local records", keys.len());
        Ok(())
    }

    fn notify(&self, key: &str, new_value: Option<String>) {
        // No subscribers is fine.
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            new_value,
        });
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<StorageRecord> {
    Ok(StorageRecord {
        key: row.get(0)?,
        value: row.get(1)?,
        written_at: row.get(2)?,
        device_id: row.get(3)?,
        expires_at: row.get(4)?,
    })
}

fn read_record(conn: &Connection, key: &str) -> StorageResult<Option<StorageRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM records WHERE key = ?1"),
            params![key],
            row_to_record,
        )
        .optional()?)
}

/// Inserts or replaces `records`, failing if the store would go over
/// `capacity_bytes`. The caller owns the transaction.
fn write_records(
    conn: &Connection,
    records: &[StorageRecord],
    capacity_bytes: u64,
) -> StorageResult<()> {
    if records.is_empty() {
        return Ok(());
    }

    let used = usage_bytes(conn)?;
    let mut replaced = 0u64;
    let mut incoming = 0u64;
    for record in records {
        replaced += record_size(conn, &record.key)?;
        incoming += record.size_bytes();
    }

    let retained = used.saturating_sub(replaced);
    if retained + incoming > capacity_bytes {
        return Err(StorageError::CapacityExceeded {
            needed: incoming,
            available: capacity_bytes.saturating_sub(retained),
        });
    }

    for record in records {
        conn.execute(
            &format!("INSERT OR REPLACE INTO records ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
            params![
                record.key,
                record.value,
                record.written_at,
                record.device_id,
                record.expires_at
            ],
        )?;
    }
    Ok(())
}

fn usage_bytes(conn: &Connection) -> StorageResult<u64> {
    let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0) FROM records",
        [],
        |row| row.get(0),
    )?;
    Ok(used.max(0) as u64)
}

fn record_size(conn: &Connection, key: &str) -> StorageResult<u64> {
    let size: Option<i64> = conn
        .query_row(
            "SELECT LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB)) FROM records WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(size.unwrap_or(0).max(0) as u64)
}
