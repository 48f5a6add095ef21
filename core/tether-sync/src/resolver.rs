//! Conflict resolution planning.
//!
//! The resolver owns no state. It turns a conflict and a strategy into a
//! [`Resolution`] describing what the queue and local state must do; the
//! coordinator carries it out.

use crate::conflict::{Conflict, ConflictDetail, ResolutionStrategy};
use crate::error::{SyncError, SyncResult};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Effect of resolving a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the queued local operations, now based on `baseline`.
    /// With `recreate` set the remote entity is gone and the local state
    /// must be written back as a create.
    KeepLocal { baseline: Option<u64>, recreate: bool },
    /// Drop local operations and take the remote state (`None` = deleted).
    AdoptRemote {
        data: Option<Value>,
        version: Option<u64>,
    },
    /// Replace local operations with one update carrying `payload`.
    Merge { payload: Value, baseline: u64 },
}

/// Plans conflict resolutions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn plan(&self, conflict: &Conflict, strategy: ResolutionStrategy) -> SyncResult<Resolution> {
        let remote = conflict.remote.as_ref();
        match strategy {
            ResolutionStrategy::Local => Ok(Resolution::KeepLocal {
                baseline: remote.map(|r| r.version),
                recreate: remote.is_none(),
            }),
            ResolutionStrategy::Remote => Ok(Resolution::AdoptRemote {
                data: remote.map(|r| r.data.clone()),
                version: remote.map(|r| r.version),
            }),
            ResolutionStrategy::Merge => {
                let (ConflictDetail::Fields { local, remote: theirs }, Some(remote)) =
                    (&conflict.detail, remote)
                else {
                    return Err(SyncError::MergeUnsupported);
                };
                let local_value = local.new_value.as_ref().unwrap_or(&Value::Null);
                let payload =
                    merge_values(&local.fields, local_value, &theirs.fields, &remote.data)?;
                Ok(Resolution::Merge {
                    payload,
                    baseline: remote.version,
                })
            }
        }
    }
}

/// Combines two field-level edits of the same base.
///
/// The result starts from `remote` and takes `local`'s value for each of
/// `local_fields` (a field missing from `local` is removed). Fails with
/// [`SyncError::MergeRejected`] when both sides touched the same field.
pub fn merge_values(
    local_fields: &[String],
    local: &Value,
    remote_fields: &[String],
    remote: &Value,
) -> SyncResult<Value> {
    let theirs: BTreeSet<&String> = remote_fields.iter().collect();
    let overlap: Vec<String> = local_fields
        .iter()
        .filter(|f| theirs.contains(f))
        .cloned()
        .collect();
    if !overlap.is_empty() {
        return Err(SyncError::MergeRejected { fields: overlap });
    }

    let mut merged: Map<String, Value> = remote.as_object().cloned().unwrap_or_default();
    for field in local_fields {
        match local.get(field) {
            Some(value) => {
                merged.insert(field.clone(), value.clone());
            }
            None => {
                merged.remove(field);
            }
        }
    }
    Ok(Value::Object(merged))
}
