//! Applying remote changes to the local replica.
//!
//! Merges are last-pulled-wins per field: an update shallow-merges the
//! incoming object onto the stored one, so whichever change is applied
//! last decides each field.

use crate::error::SyncResult;
use crate::hybrid_storage::HybridStorage;
use crate::types::{DataType, RemoteChange, SyncOperation};
use serde_json::Value;
use tailor_storage::keys;
use tracing::{debug, warn};

/// What applying one change did.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Changed,
    /// Valid change that left local state as it was.
    NoOp,
    /// The active user's favorites were replaced with the contained list.
    FavoritesReplaced(Value),
    /// Unknown type or malformed payload.
    Skipped,
}

fn id_of(record: &Value) -> Option<&Value> {
    record.get("id").filter(|id| !id.is_null())
}

/// Id equality that tolerates `1` vs `"1"`.
pub fn ids_match(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            *s == n.to_string()
        }
        _ => false,
    }
}

fn position(records: &[Value], id: &Value) -> Option<usize> {
    records
        .iter()
        .position(|r| id_of(r).is_some_and(|rid| ids_match(rid, id)))
}

/// Appends `data` unless a record with the same id exists.
pub fn insert_if_absent(records: &mut Vec<Value>, data: &Value) -> bool {
    let Some(id) = id_of(data) else {
        return false;
    };
    if position(records, id).is_some() {
        return false;
    }
    records.push(data.clone());
    true
}

/// Shallow-merges the fields of `data` onto the record with the same id.
pub fn shallow_merge(records: &mut [Value], data: &Value) -> bool {
    let (Some(id), Some(incoming)) = (id_of(data), data.as_object()) else {
        return false;
    };
    let Some(idx) = position(records, id) else {
        return false;
    };
    let Some(existing) = records[idx].as_object_mut() else {
        return false;
    };
    let mut changed = false;
    for (field, value) in incoming {
        if existing.get(field) != Some(value) {
            existing.insert(field.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// Removes the record with the same id. Absent ids are a no-op.
pub fn remove_by_id(records: &mut Vec<Value>, data: &Value) -> bool {
    let Some(id) = id_of(data) else {
        return false;
    };
    let before = records.len();
    records.retain(|r| !id_of(r).is_some_and(|rid| ids_match(rid, id)));
    records.len() != before
}

/// Working copy of the synced collections, committed in one transaction.
#[derive(Debug, Clone, Default)]
pub struct ReplicaState {
    pub patterns: Vec<Value>,
    pub users: Vec<Value>,
    pub current_user: Option<Value>,
    patterns_dirty: bool,
    users_dirty: bool,
    current_user_dirty: bool,
}

impl ReplicaState {
    /// Loads the synced collections, runs `f` on them and commits whatever
    /// it dirtied, all in one store transaction.
    ///
    /// `f` runs again if the first commit hits the capacity limit.
    pub fn update<T>(
        storage: &HybridStorage,
        mut f: impl FnMut(&mut ReplicaState) -> T,
    ) -> SyncResult<T> {
        storage.update_local_values(
            &[keys::PATTERNS, keys::USERS, keys::CURRENT_USER],
            |current| {
                let mut replica = ReplicaState::from_values(current)?;
                let out = f(&mut replica);
                Ok((replica.take_dirty(), out))
            },
        )
    }

    fn from_values(values: Vec<Option<Value>>) -> SyncResult<Self> {
        let mut values = values.into_iter();
        let mut next = || values.next().flatten();
        Ok(Self {
            patterns: collection(next())?,
            users: collection(next())?,
            current_user: next().filter(|user| !user.is_null()),
            ..Self::default()
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.patterns_dirty || self.users_dirty || self.current_user_dirty
    }

    pub fn apply(&mut self, change: &RemoteChange) -> ApplyOutcome {
        let Some(kind) = change.kind() else {
            warn!("ignoring change with unknown data type {:?}", change.data_type);
            return ApplyOutcome::Skipped;
        };

        if kind != DataType::Favorites && id_of(&change.data).is_none() {
            warn!("ignoring {kind} change without an id");
            return ApplyOutcome::Skipped;
        }

        match kind {
            DataType::Patterns => {
                let changed = match change.operation {
                    SyncOperation::Create => insert_if_absent(&mut self.patterns, &change.data),
                    SyncOperation::Update => shallow_merge(&mut self.patterns, &change.data),
                    SyncOperation::Delete => remove_by_id(&mut self.patterns, &change.data),
                };
                self.patterns_dirty |= changed;
                outcome(changed)
            }
            DataType::Users => {
                let changed = match change.operation {
                    SyncOperation::Create => insert_if_absent(&mut self.users, &change.data),
                    SyncOperation::Update => shallow_merge(&mut self.users, &change.data),
                    SyncOperation::Delete => {
                        debug!("user deletes are not replicated");
                        return ApplyOutcome::Skipped;
                    }
                };
                self.users_dirty |= changed;
                outcome(changed)
            }
            DataType::Favorites => self.apply_favorites(change),
            DataType::Session => {
                debug!("session changes are not replicated");
                ApplyOutcome::Skipped
            }
        }
    }

    fn apply_favorites(&mut self, change: &RemoteChange) -> ApplyOutcome {
        let Some(favorites) = change.data.get("favorites") else {
            warn!("ignoring favorites change without a favorites list");
            return ApplyOutcome::Skipped;
        };
        let Some(owner) = change.owner() else {
            warn!("ignoring favorites change without a user id");
            return ApplyOutcome::Skipped;
        };
        let Some(user) = self.current_user.as_mut().and_then(Value::as_object_mut) else {
            return ApplyOutcome::NoOp;
        };
        if !user.get("id").is_some_and(|id| ids_match(id, owner)) {
            return ApplyOutcome::NoOp;
        }

        user.insert("favorites".to_string(), favorites.clone());
        self.current_user_dirty = true;
        ApplyOutcome::FavoritesReplaced(favorites.clone())
    }

    /// Drains the dirty collections into store entries.
    fn take_dirty(&mut self) -> Vec<(String, Value)> {
        let mut entries = Vec::new();
        if std::mem::take(&mut self.patterns_dirty) {
            entries.push((keys::PATTERNS.to_string(), Value::Array(self.patterns.clone())));
        }
        if std::mem::take(&mut self.users_dirty) {
            entries.push((keys::USERS.to_string(), Value::Array(self.users.clone())));
        }
        if std::mem::take(&mut self.current_user_dirty) {
            if let Some(user) = &self.current_user {
                entries.push((keys::CURRENT_USER.to_string(), user.clone()));
            }
        }
        entries
    }
}

fn collection(value: Option<Value>) -> SyncResult<Vec<Value>> {
    Ok(value
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default())
}

fn outcome(changed: bool) -> ApplyOutcome {
    if changed {
        ApplyOutcome::Changed
    } else {
        ApplyOutcome::NoOp
    }
}
