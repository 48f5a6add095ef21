//! Offline-first sync engine for Tether.
//!
//! Local mutations are recorded and queued while the device is offline, then
//! replayed against a remote entity API once connectivity returns.
//!
//! # Architecture
//!
//! - **Change Tracker** ([`ChangeTracker`]): records every mutation as an
//!   immutable [`ChangeRecord`] with changed fields and a checksum.
//! - **Offline Queue** ([`OfflineQueue`]): durable, priority- and
//!   dependency-ordered operations with retry and exponential backoff.
//! - **Coordinator** ([`SyncCoordinator`]): drains the queue when online,
//!   detects conflicts against the remote version, publishes status.
//! - **Resolver** ([`ConflictResolver`]): turns a conflict and a
//!   local/remote/merge strategy into queue and state changes.
//!
//! The remote API ([`RemoteBackend`]), local state ([`StateAccessor`]),
//! connectivity ([`NetworkMonitor`]) and durable storage
//! ([`tether_storage::KeyValueStore`]) are supplied by the host.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use tether_storage::MemoryStore;
//! use tether_sync::remote::mock::InMemoryRemote;
//! use tether_sync::{InMemoryState, NetworkMonitor, SyncConfig, SyncCoordinator};
//! use tether_types::EntityKey;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let remote = Arc::new(InMemoryRemote::new());
//! let sync = SyncCoordinator::open(
//!     SyncConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     remote.clone(),
//!     Arc::new(InMemoryState::new()),
//!     NetworkMonitor::default(),
//! )
//! .await?;
//!
//! let project = EntityKey::new("project", "project-1");
//! sync.local_create(project.clone(), json!({ "name": "Launch" })).await?;
//! sync.drain_once().await?;
//!
//! assert_eq!(remote.get(&project).unwrap().data["name"], "Launch");
//! assert_eq!(sync.status().status_text(), "All changes synced");
//! # Ok(())
//! # }
//! ```

mod config;
mod conflict;
mod coordinator;
pub mod delta;
mod error;
mod events;
mod network;
mod payload;
mod queue;
pub mod remote;
mod resolver;
mod state;
mod status;
mod tracker;
mod versions;

pub use config::{RetryPolicy, SyncConfig};
pub use conflict::{Conflict, ConflictDetail, EntitySnapshot, FieldChange, ResolutionStrategy};
pub use coordinator::{DrainReport, SyncCoordinator};
pub use error::{SyncError, SyncResult};
pub use events::{ConflictBus, ConflictEvent};
pub use network::{Connectivity, NetworkMonitor};
pub use payload::EntityPayload;
pub use queue::{NewOperation, OfflineQueue, OperationStatus, ProcessOutcome, QueuedOperation};
pub use remote::{RemoteBackend, RemoteEntity, RemoteError, apply_operation};
pub use resolver::{ConflictResolver, Resolution, merge_values};
pub use state::{InMemoryState, StateAccessor};
pub use status::{StatusReport, SyncStatus};
pub use tracker::{ChangeRecord, ChangeTracker, TrackingError};
