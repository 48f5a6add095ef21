//! Core type definitions for Tether.
//!
//! This crate defines the small, storage-agnostic vocabulary shared by the
//! change tracker, the offline queue and the sync coordinator:
//! - Entity keys and record identifiers (UUID v7)
//! - Millisecond wall-clock timestamps
//! - Operation kinds and priorities
//!
//! Entity payloads themselves are opaque JSON here; typing them is the job of
//! the layer that owns the entity kind.

mod ids;
mod kind;
mod timestamp;

pub use ids::{ChangeId, ConflictId, EntityKey, OperationId};
pub use kind::{Action, ChangeType, Priority};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid entity key: {0}")]
    InvalidEntityKey(String),

    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
