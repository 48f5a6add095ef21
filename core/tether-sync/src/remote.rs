//! Remote backend abstraction.
//!
//! The remote persistence API is a collaborator, not part of this crate. It
//! exposes create/update/delete by entity plus a fetch that reports the
//! entity's current version, which is the baseline conflict detection compares
//! against.

use crate::error::SyncError;
use crate::queue::QueuedOperation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_types::{Action, EntityKey, Timestamp};

/// The remote side's view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    /// Current remote data.
    pub data: Value,
    /// Monotonic version, bumped by every remote write.
    pub version: u64,
    /// When the remote last changed this entity.
    pub modified_at: Timestamp,
}

/// Errors reported by a remote backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    /// Retryable failure (connection reset, 5xx, ...).
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The call did not complete in time. Retryable.
    #[error("remote call timed out")]
    Timeout,

    /// The remote refused the payload; retrying cannot help.
    #[error("remote rejected operation: {0}")]
    Validation(String),

    /// The remote refused the write because its state moved on.
    #[error("remote state diverged")]
    Conflict { current: Option<RemoteEntity> },
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transient(msg) => SyncError::TransientNetwork(msg),
            RemoteError::Timeout => SyncError::Timeout,
            RemoteError::Validation(msg) => SyncError::Validation(msg),
            RemoteError::Conflict { .. } => {
                SyncError::TransientNetwork("remote state diverged".to_string())
            }
        }
    }
}

/// A remote entity API.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Returns the current remote entity, or `None` if it does not exist.
    async fn fetch(&self, key: &EntityKey) -> Result<Option<RemoteEntity>, RemoteError>;

    /// Creates an entity. Fails with `Conflict` if it already exists.
    async fn create(&self, key: &EntityKey, payload: &Value) -> Result<RemoteEntity, RemoteError>;

    /// Replaces an existing entity's data.
    async fn update(&self, key: &EntityKey, payload: &Value) -> Result<RemoteEntity, RemoteError>;

    /// Deletes an entity. Deleting a missing entity succeeds.
    async fn delete(&self, key: &EntityKey) -> Result<(), RemoteError>;
}

/// Performs the remote call a queued operation describes.
///
/// Returns the entity's new remote state, or `None` after a delete.
pub async fn apply_operation(
    remote: &dyn RemoteBackend,
    op: &QueuedOperation,
) -> Result<Option<RemoteEntity>, RemoteError> {
    let key = op.entity();
    match op.action {
        Action::Create => remote.create(&key, &op.payload).await.map(Some),
        Action::Update => remote.update(&key, &op.payload).await.map(Some),
        Action::Delete => remote.delete(&key).await.map(|()| None),
    }
}

/// An in-memory remote for testing.
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    /// A call observed by [`InMemoryRemote`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RemoteCall {
        Fetch(EntityKey),
        Create(EntityKey),
        Update(EntityKey),
        Delete(EntityKey),
    }

    #[derive(Debug, Default)]
    struct Inner {
        entities: HashMap<EntityKey, RemoteEntity>,
        failures: VecDeque<RemoteError>,
        calls: Vec<RemoteCall>,
        latency: Option<Duration>,
        clock: u64,
    }

    /// A remote backend holding entities in a map.
    ///
    /// Failures queued with [`fail_next`](Self::fail_next) are returned by the
    /// following calls (fetches included), one per call, in order.
    #[derive(Debug, Default)]
    pub struct InMemoryRemote {
        inner: Mutex<Inner>,
    }

    impl InMemoryRemote {
        /// Creates an empty remote.
        pub fn new() -> Self {
            Self::default()
        }

        fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
            let mut guard = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        }

        /// Writes an entity directly, as another device would.
        /// Bumps the version and returns the new remote state.
        pub fn put(&self, key: &EntityKey, data: Value) -> RemoteEntity {
            self.with_inner(|inner| write_entity(inner, key, data))
        }

        /// Removes an entity directly, as another device would.
        pub fn remove(&self, key: &EntityKey) {
            self.with_inner(|inner| {
                inner.entities.remove(key);
            });
        }

        /// Returns the stored entity, if any.
        pub fn get(&self, key: &EntityKey) -> Option<RemoteEntity> {
            self.with_inner(|inner| inner.entities.get(key).cloned())
        }

        /// Returns every stored entity.
        pub fn snapshot(&self) -> HashMap<EntityKey, RemoteEntity> {
            self.with_inner(|inner| inner.entities.clone())
        }

        /// Makes the next call fail with `err`.
        pub fn fail_next(&self, err: RemoteError) {
            self.with_inner(|inner| inner.failures.push_back(err));
        }

        /// Makes the next `n` calls fail with `err`.
        pub fn fail_next_n(&self, n: usize, err: RemoteError) {
            self.with_inner(|inner| {
                inner.failures.extend(std::iter::repeat_n(err, n));
            });
        }

        /// Delays every call by `latency`.
        pub fn set_latency(&self, latency: Option<Duration>) {
            self.with_inner(|inner| inner.latency = latency);
        }

        /// All calls received so far.
        pub fn calls(&self) -> Vec<RemoteCall> {
            self.with_inner(|inner| inner.calls.clone())
        }

        /// Mutating calls received so far.
        pub fn writes(&self) -> Vec<RemoteCall> {
            self.calls()
                .into_iter()
                .filter(|c| !matches!(c, RemoteCall::Fetch(_)))
                .collect()
        }

        async fn begin(&self, call: RemoteCall) -> Result<(), RemoteError> {
            let latency = self.with_inner(|inner| inner.latency);
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            self.with_inner(|inner| {
                inner.calls.push(call);
                match inner.failures.pop_front() {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            })
        }
    }

    fn write_entity(inner: &mut Inner, key: &EntityKey, data: Value) -> RemoteEntity {
        // One clock for all entities, so a recreated entity never reuses a version.
        inner.clock += 1;
        let version = inner.clock;
        let entity = RemoteEntity {
            data,
            version,
            modified_at: Timestamp::now(),
        };
        inner.entities.insert(key.clone(), entity.clone());
        entity
    }

    #[async_trait]
    impl RemoteBackend for InMemoryRemote {
        async fn fetch(&self, key: &EntityKey) -> Result<Option<RemoteEntity>, RemoteError> {
            self.begin(RemoteCall::Fetch(key.clone())).await?;
            Ok(self.get(key))
        }

        async fn create(
            &self,
            key: &EntityKey,
            payload: &Value,
        ) -> Result<RemoteEntity, RemoteError> {
            self.begin(RemoteCall::Create(key.clone())).await?;
            self.with_inner(|inner| {
                if let Some(current) = inner.entities.get(key) {
                    return Err(RemoteError::Conflict {
                        current: Some(current.clone()),
                    });
                }
                Ok(write_entity(inner, key, payload.clone()))
            })
        }

        async fn update(
            &self,
            key: &EntityKey,
            payload: &Value,
        ) -> Result<RemoteEntity, RemoteError> {
            self.begin(RemoteCall::Update(key.clone())).await?;
            self.with_inner(|inner| {
                if !inner.entities.contains_key(key) {
                    return Err(RemoteError::Validation(format!("{key} does not exist")));
                }
                Ok(write_entity(inner, key, payload.clone()))
            })
        }

        async fn delete(&self, key: &EntityKey) -> Result<(), RemoteError> {
            self.begin(RemoteCall::Delete(key.clone())).await?;
            self.with_inner(|inner| {
                inner.entities.remove(key);
            });
            Ok(())
        }
    }
}
