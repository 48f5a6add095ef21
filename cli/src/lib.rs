//! Inspection and maintenance commands for a Tether store.
//!
//! The commands work on the persisted offline queue and change log directly,
//! without a remote backend, so they can be run against a store copied off a
//! device. Query commands never write to the store; only `retry`, `remove`
//! and `clear` do, and those also return operations left in flight by an
//! interrupted sync to pending.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tether_storage::{KeyValueStore, SqliteStore};
use tether_sync::{
    ChangeRecord, ChangeTracker, OfflineQueue, OperationStatus, QueuedOperation, StatusReport,
    SyncConfig, SyncStatus,
};
use tether_types::{Action, EntityKey, OperationId};

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Summarize queued work
    Status,
    /// List queued operations
    Queue {
        /// Only show failed operations
        #[arg(long)]
        failed: bool,
    },
    /// List tracked changes that have not synced yet
    Changes {
        /// Only show one entity (`type/id`)
        #[arg(long)]
        entity: Option<EntityKey>,
    },
    /// Give failed operations a fresh retry budget
    Retry {
        /// Retry one operation instead of every failed one
        id: Option<OperationId>,
    },
    /// Remove one queued operation
    Remove { id: OperationId },
    /// Remove every queued operation
    Clear,
}

impl Command {
    /// Whether the command changes the store.
    pub fn mutates(&self) -> bool {
        matches!(self, Self::Retry { .. } | Self::Remove { .. } | Self::Clear)
    }
}

/// The queue and change log of one store.
pub struct Workspace {
    store: Arc<dyn KeyValueStore>,
    config: SyncConfig,
}

impl Workspace {
    /// Opens the store at `path` using `config`'s namespace and limits.
    pub fn open(path: &Path, config: &SyncConfig) -> Result<Self> {
        let store = SqliteStore::open(path)
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    pub fn with_store(store: Arc<dyn KeyValueStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            config: config.clone(),
        }
    }

    fn queue(&self, writable: bool) -> Result<OfflineQueue> {
        let (namespace, retry) = (&self.config.namespace, self.config.retry.clone());
        let queue = if writable {
            OfflineQueue::open(self.store.clone(), namespace, retry)
        } else {
            OfflineQueue::load(self.store.clone(), namespace, retry)
        };
        queue.context("failed to load offline queue")
    }

    fn tracker(&self) -> Result<ChangeTracker> {
        ChangeTracker::open(
            self.store.clone(),
            &self.config.namespace,
            self.config.max_change_log,
        )
        .context("failed to load change log")
    }

    /// Runs `command` and returns what to print.
    pub async fn execute(&self, command: &Command, as_json: bool) -> Result<String> {
        let queue = self.queue(command.mutates())?;
        match command {
            Command::Status => {
                let report = status_of(&queue).await;
                if as_json {
                    return Ok(serde_json::to_string_pretty(&report)?);
                }
                let mut out = report.status_text();
                for error in &report.errors {
                    out.push_str("\n  ");
                    out.push_str(error);
                }
                Ok(out)
            }
            Command::Queue { failed } => {
                let ops = if *failed {
                    queue.failed_operations().await
                } else {
                    queue.operations().await
                };
                if as_json {
                    return Ok(serde_json::to_string_pretty(&ops)?);
                }
                if ops.is_empty() {
                    return Ok("Queue is empty".to_string());
                }
                Ok(ops.iter().map(render_operation).collect::<Vec<_>>().join("\n"))
            }
            Command::Changes { entity } => {
                let tracker = self.tracker()?;
                let records = match entity {
                    Some(key) => tracker.changes_for(key).await,
                    None => tracker.all_changes().await,
                };
                if as_json {
                    return Ok(serde_json::to_string_pretty(&records)?);
                }
                if records.is_empty() {
                    return Ok("No unsynced changes".to_string());
                }
                Ok(records.iter().map(render_change).collect::<Vec<_>>().join("\n"))
            }
            Command::Retry { id: Some(id) } => {
                let op = queue.retry(*id).await?;
                summarize(as_json, "retry", 1, format!("Retrying {} {}", op.action, op.entity()))
            }
            Command::Retry { id: None } => {
                let count = queue.retry_failed().await?;
                summarize(
                    as_json,
                    "retry",
                    count,
                    format!("Reset {count} failed operations"),
                )
            }
            Command::Remove { id } => {
                let op = queue.remove(*id).await?;
                summarize(as_json, "remove", 1, format!("Removed {} {}", op.action, op.entity()))
            }
            Command::Clear => {
                let count = queue.clear().await?;
                summarize(as_json, "clear", count, format!("Cleared {count} operations"))
            }
        }
    }
}

/// Status as the coordinator would report it while idle.
async fn status_of(queue: &OfflineQueue) -> StatusReport {
    let failed = queue.failed_operations().await;
    StatusReport {
        status: if failed.is_empty() {
            SyncStatus::Idle
        } else {
            SyncStatus::Error
        },
        pending_operations: queue.pending_count().await,
        last_sync_time: None,
        errors: failed
            .iter()
            .map(|op| {
                format!(
                    "{} {}: {}",
                    op.action,
                    op.entity(),
                    op.error.as_deref().unwrap_or("failed")
                )
            })
            .collect(),
        conflicts: 0,
    }
}

fn summarize(as_json: bool, action: &str, count: usize, text: String) -> Result<String> {
    if as_json {
        return Ok(json!({ "action": action, "count": count }).to_string());
    }
    Ok(text)
}

fn status_label(status: OperationStatus) -> &'static str {
    match status {
        OperationStatus::Pending => "pending",
        OperationStatus::InFlight => "in_flight",
        OperationStatus::Failed => "failed",
    }
}

fn render_operation(op: &QueuedOperation) -> String {
    let mut line = format!(
        "{}  {:<6} {:<28} {:<6} {:<9} {}/{}",
        op.id,
        op.action.to_string(),
        op.entity().to_string(),
        op.priority.to_string(),
        status_label(op.status),
        op.retry_count,
        op.max_retries
    );
    if !op.dependencies.is_empty() {
        line.push_str(&format!("  after {}", op.dependencies.len()));
    }
    if let Some(error) = &op.error {
        line.push_str("  ");
        line.push_str(error);
    }
    line
}

fn render_change(record: &ChangeRecord) -> String {
    let mut line = format!(
        "{}  {:<6} {}",
        record.timestamp.to_datetime().format("%Y-%m-%d %H:%M:%S"),
        Action::from(record.change_type).to_string(),
        record.entity()
    );
    if let Some(fields) = record.fields.as_ref().filter(|f| !f.is_empty()) {
        line.push_str(&format!("  [{}]", fields.join(", ")));
    }
    line
}
