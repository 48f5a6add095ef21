//! Typed entity payloads.
//!
//! The queue stores payloads as JSON, but hosts can describe each entity kind
//! with a Rust type. Typed payloads are validated when they enter the queue,
//! so a malformed payload is refused up front instead of failing remotely.

use crate::error::{SyncError, SyncResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A payload type bound to one entity kind.
pub trait EntityPayload: Serialize + DeserializeOwned {
    /// The `entity_type` this payload belongs to.
    const ENTITY_TYPE: &'static str;

    /// Checks domain rules. The message becomes a validation error.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Validates and serializes this payload.
    fn to_payload(&self) -> SyncResult<Value> {
        self.validate().map_err(SyncError::Validation)?;
        let value = serde_json::to_value(self)?;
        if !value.is_object() {
            return Err(SyncError::Validation(format!(
                "{} payload must serialize to a JSON object",
                Self::ENTITY_TYPE
            )));
        }
        Ok(value)
    }

    /// Parses a stored payload back into this type.
    fn from_payload(value: &Value) -> SyncResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}
