//! Error types for the sync layer.

use tether_storage::StorageError;
use tether_types::OperationId;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Retryable network failure.
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// A remote call exceeded the request timeout. Retryable.
    #[error("operation timed out")]
    Timeout,

    /// The operation can never succeed as written.
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Queue or change-log state could not be made durable.
    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// No queued operation with this id.
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    /// Merge was requested but both sides changed the same fields.
    #[error("merge rejected: both sides changed {}", fields.join(", "))]
    MergeRejected { fields: Vec<String> },

    /// Merge was requested for a conflict without field-level detail.
    #[error("merge unavailable for whole-entity conflicts")]
    MergeUnsupported,
}
