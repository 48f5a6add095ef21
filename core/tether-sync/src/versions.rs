//! Remote versions local state is based on.
//!
//! Update and delete operations carry the version they were written against so
//! the coordinator can tell when the remote moved on. The map is durable: after
//! a restart, new local edits still pick up the right baseline.

use crate::config::versions_key;
use crate::error::SyncResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_storage::{KeyValueStore, load_json, save_json};
use tether_types::EntityKey;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Durable map from entity to the last remote version seen for it.
pub struct KnownVersions {
    versions: RwLock<BTreeMap<EntityKey, u64>>,
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl KnownVersions {
    pub fn open(store: Arc<dyn KeyValueStore>, namespace: &str) -> SyncResult<Self> {
        let key = versions_key(namespace);
        let raw: BTreeMap<String, u64> = load_json(store.as_ref(), &key)?.unwrap_or_default();

        let mut versions = BTreeMap::new();
        for (entity, version) in raw {
            match entity.parse::<EntityKey>() {
                Ok(entity) => {
                    versions.insert(entity, version);
                }
                Err(e) => warn!("Skipping stored version for {}: {}", entity, e),
            }
        }
        debug!("Loaded {} known versions from {}", versions.len(), key);

        Ok(Self {
            versions: RwLock::new(versions),
            store,
            key,
        })
    }

    pub async fn get(&self, entity: &EntityKey) -> Option<u64> {
        self.versions.read().await.get(entity).copied()
    }

    /// Records `version` for `entity` (`None` = the remote has no such entity).
    pub async fn set(&self, entity: &EntityKey, version: Option<u64>) -> SyncResult<()> {
        let mut versions = self.versions.write().await;
        let previous = match version {
            Some(v) => versions.insert(entity.clone(), v),
            None => versions.remove(entity),
        };
        if previous == version {
            return Ok(());
        }

        let raw: BTreeMap<String, u64> = versions
            .iter()
            .map(|(entity, v)| (entity.to_string(), *v))
            .collect();
        if let Err(e) = save_json(self.store.as_ref(), &self.key, &raw) {
            match previous {
                Some(v) => versions.insert(entity.clone(), v),
                None => versions.remove(entity),
            };
            return Err(e.into());
        }
        Ok(())
    }
}
