//! Durable key-value storage for Tether.
//!
//! The sync engine persists a few collections (the offline queue, the change
//! log, the known remote versions), each as one JSON document under a
//! namespaced key. This crate
//! provides the `get`/`set`/`remove` contract they are written against plus
//! two implementations:
//!
//! - [`SqliteStore`]: a single-table SQLite database, durable across restarts
//! - [`MemoryStore`]: a process-local map, for tests and ephemeral sessions

mod error;
mod memory;
mod sqlite;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A durable string key-value store.
///
/// Writes must be durable when `set` returns `Ok`; callers flush state
/// transitions through this before moving on.
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;
}

/// Reads and deserializes a JSON document stored under `key`.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> StorageResult<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serializes `value` as JSON and stores it under `key`.
pub fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}
