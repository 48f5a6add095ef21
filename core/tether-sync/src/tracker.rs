//! Change tracking (delta sync).
//!
//! Every tracked mutation produces an immutable [`ChangeRecord`] appended to a
//! bounded, durable log. Records leave the log only once the remote has
//! confirmed the change, or when compaction folds an entity's history into a
//! single record.

use crate::config::change_log_key;
use crate::delta::{checksum, diff_fields};
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tether_storage::{KeyValueStore, StorageError, load_json, save_json};
use tether_types::{ChangeId, ChangeType, EntityKey, Timestamp};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One tracked mutation. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub entity_type: String,
    pub entity_id: String,
    pub change_type: ChangeType,
    pub timestamp: Timestamp,
    /// Top-level keys that differ between `old_value` and `new_value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    /// Fingerprint of the canonicalized `new_value` (`null` for deletes).
    pub checksum: String,
}

impl ChangeRecord {
    pub fn entity(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }
}

/// Why a mutation could not be tracked. The mutation itself stands.
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("value could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("change log could not be persisted: {0}")]
    Persistence(#[from] StorageError),
}

impl From<TrackingError> for SyncError {
    fn from(err: TrackingError) -> Self {
        match err {
            TrackingError::Serialization(e) => SyncError::Serialization(e),
            TrackingError::Persistence(e) => SyncError::Persistence(e),
        }
    }
}

/// Observes entity mutations and keeps the change log.
pub struct ChangeTracker {
    log: Mutex<Vec<ChangeRecord>>,
    store: Arc<dyn KeyValueStore>,
    key: String,
    max_entries: usize,
}

impl ChangeTracker {
    /// Opens the change log stored under `namespace`, rehydrating any records.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        namespace: &str,
        max_entries: usize,
    ) -> SyncResult<Self> {
        let key = change_log_key(namespace);
        let log: Vec<ChangeRecord> = load_json(store.as_ref(), &key)?.unwrap_or_default();
        debug!("Loaded {} change records from {}", log.len(), key);
        Ok(Self {
            log: Mutex::new(log),
            store,
            key,
            max_entries: max_entries.max(1),
        })
    }

    /// Records an entity creation.
    pub async fn track_create<T: Serialize + ?Sized>(
        &self,
        entity: &EntityKey,
        value: &T,
    ) -> Result<ChangeRecord, TrackingError> {
        let value = to_json(entity, value)?;
        let record = ChangeRecord {
            id: ChangeId::new(),
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            change_type: ChangeType::Create,
            timestamp: Timestamp::now(),
            fields: None,
            old_value: None,
            checksum: checksum(&value),
            new_value: Some(value),
        };
        self.append(record).await
    }

    /// Records an update. `fields` lists the top-level keys that changed;
    /// `new_value` keeps the full snapshot regardless.
    pub async fn track_update<T: Serialize + ?Sized>(
        &self,
        entity: &EntityKey,
        old_value: &T,
        new_value: &T,
    ) -> Result<ChangeRecord, TrackingError> {
        let old_value = to_json(entity, old_value)?;
        let new_value = to_json(entity, new_value)?;
        let record = ChangeRecord {
            id: ChangeId::new(),
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            change_type: ChangeType::Update,
            timestamp: Timestamp::now(),
            fields: Some(diff_fields(&old_value, &new_value)),
            checksum: checksum(&new_value),
            old_value: Some(old_value),
            new_value: Some(new_value),
        };
        self.append(record).await
    }

    /// Records a deletion.
    pub async fn track_delete(&self, entity: &EntityKey) -> Result<ChangeRecord, TrackingError> {
        let record = ChangeRecord {
            id: ChangeId::new(),
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            change_type: ChangeType::Delete,
            timestamp: Timestamp::now(),
            fields: None,
            old_value: None,
            new_value: None,
            checksum: checksum(&Value::Null),
        };
        self.append(record).await
    }

    async fn append(&self, record: ChangeRecord) -> Result<ChangeRecord, TrackingError> {
        let mut log = self.log.lock().await;
        let before = log.clone();
        log.push(record.clone());
        if log.len() > self.max_entries {
            compact(&mut log, self.max_entries);
        }

        if let Err(e) = save_json(self.store.as_ref(), &self.key, &*log) {
            warn!("Dropping change record for {}: {}", record.entity(), e);
            *log = before;
            return Err(e.into());
        }

        debug!(
            "Tracked {:?} on {} ({} records)",
            record.change_type,
            record.entity(),
            log.len()
        );
        Ok(record)
    }

    /// Unsynced records for one entity, oldest first.
    pub async fn changes_for(&self, entity: &EntityKey) -> Vec<ChangeRecord> {
        self.log
            .lock()
            .await
            .iter()
            .filter(|r| r.entity_type == entity.entity_type && r.entity_id == entity.entity_id)
            .cloned()
            .collect()
    }

    /// Every record in the log, oldest first.
    pub async fn all_changes(&self) -> Vec<ChangeRecord> {
        self.log.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.lock().await.is_empty()
    }

    /// Drops the records for `entity` up to and including `through`, now that
    /// the remote has confirmed them. Records made after `through` stay. When
    /// `through` is no longer in the log (compaction folded it into a later
    /// record) nothing is dropped. Returns how many were removed.
    pub async fn prune_synced(&self, entity: &EntityKey, through: ChangeId) -> SyncResult<usize> {
        let mut log = self.log.lock().await;
        let Some(cut) = log.iter().position(|r| r.id == through && r.entity() == *entity) else {
            return Ok(0);
        };
        let before = log.len();
        let mut idx = 0;
        log.retain(|r| {
            let keep = idx > cut || r.entity() != *entity;
            idx += 1;
            keep
        });
        let removed = before - log.len();
        save_json(self.store.as_ref(), &self.key, &*log)?;
        debug!("Pruned {} synced change records for {}", removed, entity);
        Ok(removed)
    }

    /// Drops every record for `entity`.
    pub async fn discard_entity(&self, entity: &EntityKey) -> SyncResult<usize> {
        let mut log = self.log.lock().await;
        let before = log.len();
        log.retain(|r| r.entity() != *entity);
        let removed = before - log.len();
        if removed > 0 {
            save_json(self.store.as_ref(), &self.key, &*log)?;
            debug!("Discarded {} change records for {}", removed, entity);
        }
        Ok(removed)
    }
}

fn to_json<T: Serialize + ?Sized>(entity: &EntityKey, value: &T) -> Result<Value, TrackingError> {
    serde_json::to_value(value).map_err(|e| {
        warn!("Cannot track change on {}: {}", entity, e);
        TrackingError::Serialization(e)
    })
}

/// Folds each entity's records into one, then drops the oldest records if the
/// log is still over `max_entries`.
fn compact(log: &mut Vec<ChangeRecord>, max_entries: usize) {
    let mut groups: HashMap<EntityKey, Vec<ChangeRecord>> = HashMap::new();
    let mut last_seen: Vec<EntityKey> = Vec::new();
    for record in log.drain(..) {
        let key = record.entity();
        last_seen.retain(|k| k != &key);
        last_seen.push(key.clone());
        groups.entry(key).or_default().push(record);
    }

    for key in last_seen {
        if let Some(records) = groups.remove(&key) {
            log.push(fold(records));
        }
    }

    if log.len() > max_entries {
        let overflow = log.len() - max_entries;
        warn!("Change log over capacity, dropping {} oldest records", overflow);
        log.drain(..overflow);
    }
}

fn fold(mut records: Vec<ChangeRecord>) -> ChangeRecord {
    if records.len() == 1 {
        return records.remove(0);
    }
    let first = records.remove(0);
    let last = records.pop().unwrap_or_else(|| first.clone());

    let change_type = match (first.change_type, last.change_type) {
        (_, ChangeType::Delete) => ChangeType::Delete,
        (ChangeType::Create, _) => ChangeType::Create,
        _ => ChangeType::Update,
    };
    let fields = match change_type {
        ChangeType::Update => {
            let old = first.old_value.clone().unwrap_or(Value::Null);
            let new = last.new_value.clone().unwrap_or(Value::Null);
            Some(diff_fields(&old, &new))
        }
        _ => None,
    };

    // The folded record keeps the newest id: operations point at the last
    // change they carry.
    ChangeRecord {
        id: last.id,
        entity_type: last.entity_type,
        entity_id: last.entity_id,
        change_type,
        timestamp: last.timestamp,
        fields,
        old_value: if change_type == ChangeType::Create {
            None
        } else {
            first.old_value
        },
        new_value: last.new_value,
        checksum: last.checksum,
    }
}
