use pretty_assertions::assert_eq;
use tailor_storage::{LocalStore, StorageError, StorageRecord, now_millis};

fn store() -> LocalStore {
    LocalStore::open_in_memory(1024).unwrap()
}

#[test]
fn get_missing_returns_none() {
    let store = store();
    assert!(store.get("nope").unwrap().is_none());
}

#[test]
fn put_then_get_returns_record() {
    let store = store();
    let record = StorageRecord::new("theme", "dark", "device_1");
    store.put(&record).unwrap();

    let loaded = store.get("theme").unwrap().unwrap();
    assert_eq!(loaded, record);
}

#[test]
fn put_overwrites_existing_key() {
    let store = store();
    store.put(&StorageRecord::new("k", "one", "d")).unwrap();
    store.put(&StorageRecord::new("k", "two", "d")).unwrap();
    assert_eq!(store.get_value("k").unwrap().as_deref(), Some("two"));
    assert_eq!(store.keys().unwrap(), vec!["k".to_string()]);
}

#[test]
fn json_records_roundtrip() {
    let store = store();
    let value = serde_json::json!([{ "id": 1 }, { "id": 2 }]);
    store
        .put(&StorageRecord::json("patterns", &value, "d").unwrap())
        .unwrap();
    let loaded: serde_json::Value = store.get_json("patterns").unwrap().unwrap();
    assert_eq!(loaded, value);
}

#[test]
fn get_json_on_malformed_value_is_invalid_record() {
    let store = store();
    store.put(&StorageRecord::new("patterns", "{not json", "d")).unwrap();
    let err = store.get_json::<Vec<serde_json::Value>>("patterns").unwrap_err();
    assert!(matches!(err, StorageError::InvalidRecord { .. }));
}

#[test]
fn expired_record_is_absent_and_removed_on_access() {
    let store = store();
    store
        .put(&StorageRecord::new("temp", "x", "d").with_expiry(now_millis() - 1))
        .unwrap();
    assert!(store.get("temp").unwrap().is_none());
    assert!(store.keys().unwrap().is_empty());
}

#[test]
fn record_expiring_later_is_present() {
    let store = store();
    store
        .put(&StorageRecord::new("temp", "x", "d").with_expiry(now_millis() + 60_000))
        .unwrap();
    assert!(store.get("temp").unwrap().is_some());
}

#[test]
fn usage_counts_key_and_value_bytes() {
    let store = store();
    store.put(&StorageRecord::new("ab", "cdef", "d")).unwrap();
    assert_eq!(store.usage_bytes().unwrap(), 6);
    assert_eq!(store.record_sizes().unwrap().get("ab"), Some(&6));
}

#[test]
fn write_beyond_capacity_fails() {
    let store = LocalStore::open_in_memory(10).unwrap();
    let err = store
        .put(&StorageRecord::new("key", "0123456789", "d"))
        .unwrap_err();
    assert!(err.is_capacity_exceeded());
    assert!(store.keys().unwrap().is_empty());
}

#[test]
fn overwrite_only_counts_the_difference() {
    let store = LocalStore::open_in_memory(10).unwrap();
    store.put(&StorageRecord::new("k", "12345678", "d")).unwrap();
    // Same size again fits because the old value is replaced.
    store.put(&StorageRecord::new("k", "87654321", "d")).unwrap();
    assert_eq!(store.usage_bytes().unwrap(), 9);
}

#[test]
fn put_many_is_all_or_nothing() {
    let store = LocalStore::open_in_memory(11).unwrap();
    let err = store
        .put_many(&[
            StorageRecord::new("a", "12345", "d"),
            StorageRecord::new("b", "12345", "d"),
        ])
        .unwrap_err();
    assert!(err.is_capacity_exceeded());
    assert!(store.keys().unwrap().is_empty());
}

#[test]
fn remove_reports_existence() {
    let store = store();
    store.put(&StorageRecord::new("k", "v", "d")).unwrap();
    assert!(store.remove("k").unwrap());
    assert!(!store.remove("k").unwrap());
}

#[test]
fn purge_expired_removes_only_expired() {
    let store = store();
    store
        .put(&StorageRecord::new("old", "v", "d").with_expiry(now_millis() - 10))
        .unwrap();
    store.put(&StorageRecord::new("fresh", "v", "d")).unwrap();
    assert_eq!(store.purge_expired().unwrap(), vec!["old".to_string()]);
    assert_eq!(store.keys().unwrap(), vec!["fresh".to_string()]);
}

#[test]
fn clear_wipes_everything() {
    let store = store();
    store.put(&StorageRecord::new("a", "1", "d")).unwrap();
    store.put(&StorageRecord::new("b", "2", "d")).unwrap();
    store.clear().unwrap();
    assert!(store.keys().unwrap().is_empty());
    assert_eq!(store.usage_bytes().unwrap(), 0);
}

#[test]
fn subscribers_see_writes_and_removes() {
    let store = store();
    let mut rx = store.subscribe();
    store.put(&StorageRecord::new("k", "v", "d")).unwrap();
    store.remove("k").unwrap();

    let write = rx.try_recv().unwrap();
    assert_eq!(write.key, "k");
    assert_eq!(write.new_value.as_deref(), Some("v"));
    let remove = rx.try_recv().unwrap();
    assert_eq!(remove.new_value, None);
}

#[test]
fn file_backed_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.db");
    {
        let store = LocalStore::open(&path, 1024).unwrap();
        store.put(&StorageRecord::new("syncQueue", "[]", "d")).unwrap();
    }
    let store = LocalStore::open(&path, 1024).unwrap();
    assert_eq!(store.get_value("syncQueue").unwrap().as_deref(), Some("[]"));
}

#[test]
fn remove_if_expired_keeps_live_records() {
    let store = store();
    store.put(&StorageRecord::new("plain", "v", "d")).unwrap();
    store
        .put(&StorageRecord::new("later", "v", "d").with_expiry(now_millis() + 60_000))
        .unwrap();
    store
        .put(&StorageRecord::new("stale", "v", "d").with_expiry(now_millis() - 1))
        .unwrap();
    let mut rx = store.subscribe();

    assert!(!store.remove_if_expired("plain").unwrap());
    assert!(!store.remove_if_expired("later").unwrap());
    assert!(store.remove_if_expired("stale").unwrap());

    assert_eq!(store.keys().unwrap(), vec!["later".to_string(), "plain".to_string()]);
    assert_eq!(rx.try_recv().unwrap().key, "stale");
    assert!(rx.try_recv().is_err());
}

// --- Transactional update ---

fn increment(store: &LocalStore) -> Result<u64, StorageError> {
    store.update(&["counter"], |current| {
        let next = current[0].as_deref().map_or(0, |v| v.parse::<u64>().unwrap()) + 1;
        Ok((vec![StorageRecord::new("counter", next.to_string(), "d")], next))
    })
}

#[test]
fn update_reads_current_values_and_writes_result() {
    let store = store();
    store.put(&StorageRecord::new("a", "1", "d")).unwrap();
    store
        .put(&StorageRecord::new("gone", "x", "d").with_expiry(now_millis() - 1))
        .unwrap();
    let mut rx = store.subscribe();

    let seen = store
        .update(&["a", "missing", "gone"], |current| {
            Ok::<_, StorageError>((vec![StorageRecord::new("a", "2", "d")], current))
        })
        .unwrap();

    assert_eq!(seen, vec![Some("1".to_string()), None, None]);
    assert_eq!(store.get_value("a").unwrap().as_deref(), Some("2"));
    assert_eq!(rx.try_recv().unwrap().new_value.as_deref(), Some("2"));
}

#[test]
fn failed_update_writes_nothing() {
    let store = store();
    store.put(&StorageRecord::new("a", "1", "d")).unwrap();

    let err = store
        .update(&["a"], |_| -> Result<(Vec<StorageRecord>, ()), StorageError> {
            Err(StorageError::InvalidRecord {
                key: "a".into(),
                reason: "rejected".into(),
            })
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRecord { .. }));

    let over = store.update(&["big"], |_| {
        Ok::<_, StorageError>((vec![StorageRecord::new("big", "x".repeat(2048), "d")], ()))
    });
    assert!(over.unwrap_err().is_capacity_exceeded());
    assert_eq!(store.keys().unwrap(), vec!["a".to_string()]);
}

#[test]
fn concurrent_updates_through_two_connections_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.db");
    let first = std::sync::Arc::new(LocalStore::open(&path, 1024).unwrap());
    let second = std::sync::Arc::new(LocalStore::open(&path, 1024).unwrap());

    let workers: Vec<_> = [first, second]
        .into_iter()
        .flat_map(|store| {
            (0..2).map(move |_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        increment(&store).unwrap();
                    }
                })
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let store = LocalStore::open(&path, 1024).unwrap();
    assert_eq!(store.get_value("counter").unwrap().as_deref(), Some("200"));
}
