//! Observable sync status.

use serde::{Deserialize, Serialize};
use std::fmt;
use tether_types::Timestamp;

/// Coarse coordinator state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Offline,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Offline => "offline",
            Self::Error => "error",
        })
    }
}

/// The aggregate status surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: SyncStatus,
    /// Operations not yet confirmed by the remote, failed ones excluded.
    pub pending_operations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<Timestamp>,
    pub errors: Vec<String>,
    /// Unresolved conflicts.
    #[serde(default)]
    pub conflicts: usize,
}

impl StatusReport {
    /// One-line narration for a status indicator.
    pub fn status_text(&self) -> String {
        match self.status {
            SyncStatus::Offline => "Offline".to_string(),
            SyncStatus::Syncing => format!("Syncing ({})...", self.pending_operations),
            SyncStatus::Error => "Sync error — click to retry".to_string(),
            SyncStatus::Idle if self.pending_operations > 0 => {
                format!("{} pending", self.pending_operations)
            }
            SyncStatus::Idle => "All changes synced".to_string(),
        }
    }
}
