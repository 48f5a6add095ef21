//! Access to the application's local entity state.
//!
//! The coordinator never reaches into global app state. Hosts hand it a
//! [`StateAccessor`], which it uses only when a conflict resolution changes
//! what the device should consider current.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tether_types::EntityKey;

/// Reads and writes the local copy of entities.
pub trait StateAccessor: Send + Sync {
    /// Returns the local value of an entity.
    fn get(&self, key: &EntityKey) -> Option<Value>;

    /// Replaces the local value of an entity. `None` removes it.
    fn set(&self, key: &EntityKey, value: Option<Value>);
}

/// A map-backed [`StateAccessor`].
#[derive(Debug, Default)]
pub struct InMemoryState {
    entities: RwLock<HashMap<EntityKey, Value>>,
}

impl InMemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities held.
    pub fn len(&self) -> usize {
        self.entities.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateAccessor for InMemoryState {
    fn get(&self, key: &EntityKey) -> Option<Value> {
        self.entities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &EntityKey, value: Option<Value>) {
        let mut entities = self
            .entities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match value {
            Some(v) => {
                entities.insert(key.clone(), v);
            }
            None => {
                entities.remove(key);
            }
        }
    }
}
