//! Conflict model.
//!
//! A conflict is raised when the remote entity has moved past the version a
//! queued operation was written against. When both sides are field-level
//! updates of an existing entity the conflict carries each side's changed
//! fields; anything else (creates, deletes, history that was never tracked)
//! is described as two whole-entity snapshots.

use crate::delta::diff_fields;
use crate::queue::QueuedOperation;
use crate::remote::RemoteEntity;
use crate::tracker::ChangeRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tether_types::{Action, ChangeId, ChangeType, ConflictId, EntityKey, OperationId, Timestamp};

/// One side of a field-level conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub id: ChangeId,
    #[serde(flatten)]
    pub entity: EntityKey,
    pub change_type: ChangeType,
    pub fields: Vec<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// One side of a whole-entity conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub data: Value,
    pub modified_at: Timestamp,
    #[serde(default)]
    pub elements: Vec<Value>,
    #[serde(default)]
    pub relationships: Vec<Value>,
}

impl EntitySnapshot {
    /// Builds a snapshot, lifting `elements` and `relationships` out of `data`.
    pub fn new(data: Value, modified_at: Timestamp) -> Self {
        let list = |name: &str| {
            data.get(name)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        let elements = list("elements");
        let relationships = list("relationships");
        Self {
            data,
            modified_at,
            elements,
            relationships,
        }
    }
}

/// What diverged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConflictDetail {
    Fields {
        local: FieldChange,
        remote: FieldChange,
    },
    WholeEntity {
        #[serde(rename = "localVersion")]
        local_version: Option<EntitySnapshot>,
        #[serde(rename = "cloudVersion")]
        cloud_version: Option<EntitySnapshot>,
    },
}

/// A detected divergence between local and remote state for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: ConflictId,
    #[serde(flatten)]
    pub entity: EntityKey,
    /// The queued operation that hit the divergence.
    pub operation_id: OperationId,
    /// Version the local operation assumed.
    pub baseline: Option<u64>,
    /// Remote state when the conflict was detected. `None` if deleted remotely.
    pub remote: Option<RemoteEntity>,
    pub detected_at: Timestamp,
    pub detail: ConflictDetail,
}

impl Conflict {
    /// Describes the conflict between `op` and `remote`.
    ///
    /// `local_changes` is the tracked history for the entity, oldest first.
    pub fn detect(
        op: &QueuedOperation,
        local_changes: &[ChangeRecord],
        remote: Option<RemoteEntity>,
    ) -> Self {
        let entity = op.entity();
        let detail = field_detail(&entity, local_changes, remote.as_ref())
            .unwrap_or_else(|| ConflictDetail::WholeEntity {
                local_version: local_snapshot(op, local_changes),
                cloud_version: remote
                    .as_ref()
                    .map(|r| EntitySnapshot::new(r.data.clone(), r.modified_at)),
            });

        Self {
            id: ConflictId::new(),
            entity,
            operation_id: op.id,
            baseline: op.baseline,
            remote,
            detected_at: Timestamp::now(),
            detail,
        }
    }

    /// Remote version at detection time.
    pub fn remote_version(&self) -> Option<u64> {
        self.remote.as_ref().map(|r| r.version)
    }

    /// Fields changed on each side, if this is a field-level conflict.
    pub fn fields(&self) -> Option<(&[String], &[String])> {
        match &self.detail {
            ConflictDetail::Fields { local, remote } => Some((&local.fields, &remote.fields)),
            ConflictDetail::WholeEntity { .. } => None,
        }
    }
}

fn field_detail(
    entity: &EntityKey,
    changes: &[ChangeRecord],
    remote: Option<&RemoteEntity>,
) -> Option<ConflictDetail> {
    let remote = remote?;
    let first = changes.first()?;
    let last = changes.last()?;
    if last.change_type == ChangeType::Delete {
        return None;
    }
    let base = first.old_value.clone()?;
    let current = last.new_value.clone()?;

    let local_fields = diff_fields(&base, &current);
    let remote_fields = diff_fields(&base, &remote.data);

    Some(ConflictDetail::Fields {
        local: FieldChange {
            id: last.id,
            entity: entity.clone(),
            change_type: ChangeType::Update,
            fields: local_fields,
            old_value: Some(base.clone()),
            new_value: Some(current),
        },
        remote: FieldChange {
            id: ChangeId::new(),
            entity: entity.clone(),
            change_type: ChangeType::Update,
            fields: remote_fields,
            old_value: Some(base),
            new_value: Some(remote.data.clone()),
        },
    })
}

fn local_snapshot(op: &QueuedOperation, changes: &[ChangeRecord]) -> Option<EntitySnapshot> {
    match changes.last() {
        Some(last) => last
            .new_value
            .clone()
            .map(|data| EntitySnapshot::new(data, last.timestamp)),
        None if op.action == Action::Delete => None,
        None => Some(EntitySnapshot::new(op.payload.clone(), op.timestamp)),
    }
}

/// How the operator wants a conflict settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep local changes and let them overwrite the remote.
    Local,
    /// Drop local changes and adopt the remote state.
    Remote,
    /// Combine disjoint field edits from both sides.
    Merge,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Merge => "merge",
        })
    }
}

impl FromStr for ResolutionStrategy {
    type Err = tether_types::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "merge" => Ok(Self::Merge),
            other => Err(tether_types::Error::UnknownVariant {
                kind: "resolution strategy",
                value: other.to_string(),
            }),
        }
    }
}
