//! Sync coordinator.
//!
//! Drains the offline queue against the remote backend whenever connectivity
//! allows. One drain runs at a time and processes operations sequentially.
//! Before each write the coordinator fetches the remote entity and compares
//! its version with the operation's baseline; a mismatch raises a conflict,
//! pauses that entity, and lets every other entity keep draining.

use crate::config::SyncConfig;
use crate::conflict::{Conflict, ResolutionStrategy};
use crate::error::SyncResult;
use crate::events::{ConflictBus, ConflictEvent};
use crate::network::{Connectivity, NetworkMonitor, wait_offline};
use crate::queue::{NewOperation, OfflineQueue, ProcessOutcome, QueuedOperation};
use crate::remote::{RemoteBackend, RemoteEntity, RemoteError, apply_operation};
use crate::resolver::{ConflictResolver, Resolution};
use crate::state::StateAccessor;
use crate::status::{StatusReport, SyncStatus};
use crate::tracker::{ChangeRecord, ChangeTracker, TrackingError};
use crate::versions::KnownVersions;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tether_storage::KeyValueStore;
use tether_types::{Action, ConflictId, EntityKey, OperationId, Priority, Timestamp};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub retried: usize,
    pub failed: usize,
    pub rejected: usize,
    pub conflicts: usize,
    /// The pass stopped because connectivity dropped.
    pub interrupted: bool,
}

impl DrainReport {
    fn is_empty(&self) -> bool {
        self.applied + self.retried + self.failed + self.rejected + self.conflicts == 0
    }
}

enum Attempt {
    Applied(Option<RemoteEntity>),
    Diverged(Option<RemoteEntity>),
}

/// Drives the offline queue to the remote and owns the active conflict set.
pub struct SyncCoordinator {
    config: SyncConfig,
    queue: Arc<OfflineQueue>,
    tracker: Arc<ChangeTracker>,
    remote: Arc<dyn RemoteBackend>,
    state: Arc<dyn StateAccessor>,
    network: NetworkMonitor,
    bus: ConflictBus,
    resolver: ConflictResolver,
    conflicts: RwLock<HashMap<ConflictId, Conflict>>,
    known_versions: KnownVersions,
    rejections: RwLock<VecDeque<String>>,
    last_sync: RwLock<Option<Timestamp>>,
    status_tx: watch::Sender<StatusReport>,
    draining: AtomicBool,
    drain_lock: Mutex<()>,
}

impl SyncCoordinator {
    /// Opens the queue and change log in `store` and wires the collaborators.
    pub async fn open(
        config: SyncConfig,
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteBackend>,
        state: Arc<dyn StateAccessor>,
        network: NetworkMonitor,
    ) -> SyncResult<Self> {
        let queue = OfflineQueue::open(store.clone(), &config.namespace, config.retry.clone())?;
        let tracker = ChangeTracker::open(store.clone(), &config.namespace, config.max_change_log)?;
        let known_versions = KnownVersions::open(store, &config.namespace)?;
        let (status_tx, _rx) = watch::channel(StatusReport::default());

        let coordinator = Self {
            config,
            queue: Arc::new(queue),
            tracker: Arc::new(tracker),
            remote,
            state,
            network,
            bus: ConflictBus::default(),
            resolver: ConflictResolver::new(),
            conflicts: RwLock::new(HashMap::new()),
            known_versions,
            rejections: RwLock::new(VecDeque::new()),
            last_sync: RwLock::new(None),
            status_tx,
            draining: AtomicBool::new(false),
            drain_lock: Mutex::new(()),
        };
        coordinator.refresh_status().await;
        Ok(coordinator)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn conflict_bus(&self) -> &ConflictBus {
        &self.bus
    }

    // ── Local mutations ──────────────────────────────────────────

    /// Queues an operation. Update and delete operations without a baseline
    /// take the last remote version this coordinator saw for the entity.
    pub async fn submit(&self, mut new: NewOperation) -> SyncResult<QueuedOperation> {
        if new.baseline.is_none() && new.action != Action::Create {
            new.baseline = self.known_version(&new.entity).await;
        }
        let op = self.queue.enqueue(new).await?;
        self.refresh_status().await;
        Ok(op)
    }

    /// Creates an entity locally, tracks the change, and queues the write.
    ///
    /// An operation the queue would refuse is rejected before local state or
    /// the change log are touched.
    pub async fn local_create(&self, key: EntityKey, data: Value) -> SyncResult<QueuedOperation> {
        let new = NewOperation::create(key.clone(), data.clone());
        self.queue.validate(&new)?;
        self.state.set(&key, Some(data.clone()));
        let tracked = self.tracker.track_create(&key, &data).await;
        self.submit(linked(new, tracked)).await
    }

    /// Replaces an entity locally, tracks the change, and queues the write.
    pub async fn local_update(&self, key: EntityKey, data: Value) -> SyncResult<QueuedOperation> {
        let new = NewOperation::update(key.clone(), data.clone());
        self.queue.validate(&new)?;
        let old = self.state.get(&key);
        self.state.set(&key, Some(data.clone()));
        let tracked = match &old {
            Some(old) => self.tracker.track_update(&key, old, &data).await,
            None => self.tracker.track_create(&key, &data).await,
        };
        self.submit(linked(new, tracked)).await
    }

    /// Deletes an entity locally, tracks the change, and queues the delete.
    pub async fn local_delete(&self, key: EntityKey) -> SyncResult<QueuedOperation> {
        let new = NewOperation::delete(key.clone());
        self.queue.validate(&new)?;
        self.state.set(&key, None);
        let tracked = self.tracker.track_delete(&key).await;
        self.submit(linked(new, tracked)).await
    }

    // ── Draining ─────────────────────────────────────────────────

    /// Processes ready operations until none is left, the device goes
    /// offline, or persistence fails.
    pub async fn drain_once(&self) -> SyncResult<DrainReport> {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        if !self.network.is_online() {
            self.refresh_status().await;
            return Ok(report);
        }

        self.draining.store(true, Ordering::SeqCst);
        let result = self.drain_ready(&mut report).await;
        self.draining.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) if !report.interrupted => {
                *self.last_sync.write().await = Some(Timestamp::now());
            }
            Ok(()) => {}
            Err(e) => warn!("Sync cycle aborted: {}", e),
        }
        if !report.is_empty() {
            info!(
                "Drain finished: {} applied, {} retrying, {} failed, {} rejected, {} conflicts",
                report.applied, report.retried, report.failed, report.rejected, report.conflicts
            );
        }
        self.refresh_status().await;
        result.map(|()| report)
    }

    async fn drain_ready(&self, report: &mut DrainReport) -> SyncResult<()> {
        let mut connectivity = self.network.subscribe();
        loop {
            if !self.network.is_online() {
                report.interrupted = true;
                return Ok(());
            }
            let Some(op) = self.queue.dequeue_next_ready().await? else {
                return Ok(());
            };
            self.refresh_status().await;
            self.step(&op, &mut connectivity, report).await?;
            if report.interrupted {
                return Ok(());
            }
        }
    }

    async fn step(
        &self,
        op: &QueuedOperation,
        connectivity: &mut watch::Receiver<Connectivity>,
        report: &mut DrainReport,
    ) -> SyncResult<()> {
        let key = op.entity();
        let attempt = async {
            let current = self.remote.fetch(&key).await?;
            if diverged(op, current.as_ref()) {
                return Ok(Attempt::Diverged(current));
            }
            apply_operation(self.remote.as_ref(), op)
                .await
                .map(Attempt::Applied)
        };

        let result = tokio::select! {
            biased;
            _ = wait_offline(connectivity) => None,
            res = tokio::time::timeout(self.config.request_timeout(), attempt) => {
                Some(res.unwrap_or_else(|_| Err(RemoteError::Timeout)))
            }
        };

        let Some(result) = result else {
            self.queue.release(op.id).await?;
            info!("Went offline while syncing {}; {} is pending again", key, op.id);
            report.interrupted = true;
            return Ok(());
        };

        let outcome = match result {
            Ok(Attempt::Diverged(current)) => ProcessOutcome::Conflict { current },
            Ok(Attempt::Applied(remote)) => self.queue.settle(op.id, Ok(remote)).await?,
            Err(err) => self.queue.settle(op.id, Err(err)).await?,
        };

        match outcome {
            ProcessOutcome::Done { remote } => {
                report.applied += 1;
                self.set_known_version(&key, remote.map(|r| r.version)).await?;
                if let Some(change) = op.change_id {
                    self.tracker.prune_synced(&key, change).await?;
                }
            }
            ProcessOutcome::Retrying { .. } => report.retried += 1,
            ProcessOutcome::Failed { .. } => report.failed += 1,
            ProcessOutcome::Rejected { reason } => {
                report.rejected += 1;
                self.record_rejection(format!("{} {}: {}", op.action, key, reason))
                    .await;
            }
            ProcessOutcome::Conflict { current } => {
                report.conflicts += 1;
                self.raise_conflict(op, current).await?;
            }
            ProcessOutcome::Missing => {}
        }
        Ok(())
    }

    async fn raise_conflict(
        &self,
        op: &QueuedOperation,
        current: Option<RemoteEntity>,
    ) -> SyncResult<()> {
        let key = op.entity();
        self.queue.pause_entity(&key).await;
        self.queue.release(op.id).await?;

        let changes = self.tracker.changes_for(&key).await;
        let conflict = Conflict::detect(op, &changes, current);
        warn!(
            "Conflict {} on {}: baseline {:?}, remote {:?}",
            conflict.id,
            key,
            conflict.baseline,
            conflict.remote_version()
        );
        self.conflicts
            .write()
            .await
            .insert(conflict.id, conflict.clone());
        self.bus.publish(ConflictEvent::Raised(conflict));
        Ok(())
    }

    /// Drains on connectivity changes, on the sync timer, when new work is
    /// queued, and when a retry backoff expires. Returns once `shutdown`
    /// turns `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut connectivity = self.network.subscribe();
        let notify = self.queue.notifier();
        let mut timer = tokio::time::interval(self.config.sync_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Sync coordinator started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let wakeup = self.queue.next_wakeup().await;

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *connectivity.borrow_and_update() == Connectivity::Offline {
                        self.refresh_status().await;
                        continue;
                    }
                }
                _ = timer.tick() => {}
                _ = notify.notified() => {}
                _ = sleep_until(wakeup) => {}
            }

            if let Err(e) = self.drain_once().await {
                warn!("Sync cycle failed, will retry on next trigger: {}", e);
            }
        }
        info!("Sync coordinator stopped");
    }

    // ── Conflicts ────────────────────────────────────────────────

    /// Unresolved conflicts, oldest first.
    pub async fn conflicts(&self) -> Vec<Conflict> {
        let mut all: Vec<Conflict> = self.conflicts.read().await.values().cloned().collect();
        all.sort_by_key(|c| c.detected_at);
        all
    }

    pub async fn conflict(&self, id: ConflictId) -> Option<Conflict> {
        self.conflicts.read().await.get(&id).cloned()
    }

    /// Resolves a conflict and resumes its entity.
    ///
    /// Returns `None` when the conflict is not active (already resolved or
    /// never raised). A rejected merge leaves the conflict active.
    pub async fn resolve(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> SyncResult<Option<Resolution>> {
        let Some(conflict) = self.conflicts.write().await.remove(&id) else {
            debug!("Conflict {} is not active; nothing to resolve", id);
            return Ok(None);
        };

        let applied = self.apply_resolution(&conflict, strategy).await;
        let resolution = match applied {
            Ok(resolution) => resolution,
            Err(e) => {
                self.conflicts.write().await.insert(id, conflict);
                return Err(e);
            }
        };

        let entity = conflict.entity;
        self.queue.resume_entity(&entity).await;
        info!("Resolved conflict {} on {} with {}", id, entity, strategy);
        self.bus.publish(ConflictEvent::Resolved {
            conflict_id: id,
            entity,
            strategy,
        });
        self.refresh_status().await;
        Ok(Some(resolution))
    }

    async fn apply_resolution(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
    ) -> SyncResult<Resolution> {
        let resolution = self.resolver.plan(conflict, strategy)?;
        let key = &conflict.entity;

        match &resolution {
            Resolution::KeepLocal {
                baseline,
                recreate: false,
            } => {
                self.queue.rebase_entity(key, *baseline).await?;
                self.set_known_version(key, *baseline).await?;
            }
            Resolution::KeepLocal {
                recreate: true, ..
            } => {
                match self.state.get(key) {
                    Some(data) => {
                        let priority = self.entity_priority(key).await;
                        let new = NewOperation::create(key.clone(), data).with_priority(priority);
                        self.queue.replace_entity(key, new).await?;
                    }
                    None => {
                        self.queue.discard_entity(key).await?;
                        self.tracker.discard_entity(key).await?;
                    }
                }
                self.set_known_version(key, None).await?;
            }
            Resolution::AdoptRemote { data, version } => {
                self.queue.discard_entity(key).await?;
                self.state.set(key, data.clone());
                self.tracker.discard_entity(key).await?;
                self.set_known_version(key, *version).await?;
            }
            Resolution::Merge { payload, baseline } => {
                let priority = self.entity_priority(key).await;
                let new = NewOperation::update(key.clone(), payload.clone())
                    .with_baseline(*baseline)
                    .with_priority(priority);
                self.queue.replace_entity(key, new).await?;
                self.state.set(key, Some(payload.clone()));
                self.set_known_version(key, Some(*baseline)).await?;
            }
        }
        Ok(resolution)
    }

    async fn entity_priority(&self, key: &EntityKey) -> Priority {
        self.queue
            .operations_for(key)
            .await
            .iter()
            .map(|op| op.priority)
            .max()
            .unwrap_or_default()
    }

    // ── Versions ─────────────────────────────────────────────────

    /// The last remote version seen for `key`. Survives restarts.
    pub async fn known_version(&self, key: &EntityKey) -> Option<u64> {
        self.known_versions.get(key).await
    }

    /// Records the remote version local state is based on (`None` = absent).
    /// Hosts that load entities from the remote themselves report the
    /// version here so later edits are checked against it.
    pub async fn set_known_version(&self, key: &EntityKey, version: Option<u64>) -> SyncResult<()> {
        self.known_versions.set(key, version).await
    }

    // ── User actions ─────────────────────────────────────────────

    /// Gives every failed operation a fresh retry budget.
    pub async fn retry_failed(&self) -> SyncResult<usize> {
        let count = self.queue.retry_failed().await?;
        self.refresh_status().await;
        Ok(count)
    }

    pub async fn retry(&self, id: OperationId) -> SyncResult<QueuedOperation> {
        let op = self.queue.retry(id).await?;
        self.refresh_status().await;
        Ok(op)
    }

    /// Drops every queued operation that is not currently in flight.
    pub async fn clear_queue(&self) -> SyncResult<usize> {
        let count = self.queue.clear().await?;
        self.refresh_status().await;
        Ok(count)
    }

    pub async fn remove_operation(&self, id: OperationId) -> SyncResult<QueuedOperation> {
        let op = self.queue.remove(id).await?;
        self.refresh_status().await;
        Ok(op)
    }

    /// Messages for operations the remote refused as invalid, oldest first.
    pub async fn rejections(&self) -> Vec<String> {
        self.rejections.read().await.iter().cloned().collect()
    }

    pub async fn clear_rejections(&self) {
        self.rejections.write().await.clear();
        self.refresh_status().await;
    }

    async fn record_rejection(&self, message: String) {
        let mut rejections = self.rejections.write().await;
        rejections.push_back(message);
        while rejections.len() > self.config.max_reported_errors {
            rejections.pop_front();
        }
    }

    // ── Status ───────────────────────────────────────────────────

    /// The current status surface.
    pub fn status(&self) -> StatusReport {
        self.status_tx.borrow().clone()
    }

    /// A receiver woken on every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<StatusReport> {
        self.status_tx.subscribe()
    }

    async fn refresh_status(&self) {
        let failed = self.queue.failed_operations().await;
        let status = if !self.network.is_online() {
            SyncStatus::Offline
        } else if self.draining.load(Ordering::SeqCst) {
            SyncStatus::Syncing
        } else if !failed.is_empty() {
            SyncStatus::Error
        } else {
            SyncStatus::Idle
        };

        let mut errors: Vec<String> = failed
            .iter()
            .map(|op| {
                format!(
                    "{} {}: {}",
                    op.action,
                    op.entity(),
                    op.error.as_deref().unwrap_or("failed")
                )
            })
            .collect();
        errors.extend(self.rejections.read().await.iter().cloned());
        errors.truncate(self.config.max_reported_errors);

        let report = StatusReport {
            status,
            pending_operations: self.queue.pending_count().await,
            last_sync_time: *self.last_sync.read().await,
            errors,
            conflicts: self.conflicts.read().await.len(),
        };

        self.status_tx.send_if_modified(|current| {
            if *current == report {
                return false;
            }
            if current.status != report.status {
                info!("Sync status: {} -> {}", current.status, report.status);
            }
            *current = report;
            true
        });
    }
}

fn linked(new: NewOperation, tracked: Result<ChangeRecord, TrackingError>) -> NewOperation {
    match tracked {
        Ok(record) => new.with_change(record.id),
        Err(e) => {
            warn!("{} of {} not tracked: {}", new.action, new.entity, e);
            new
        }
    }
}

/// Whether the remote moved away from what `op` was written against.
///
/// Creates conflict with any existing remote entity. Updates and deletes are
/// only checked when they carry a baseline; a delete of an entity that is
/// already gone is not a conflict.
fn diverged(op: &QueuedOperation, current: Option<&RemoteEntity>) -> bool {
    match (op.action, op.baseline, current) {
        (Action::Create, _, current) => current.is_some(),
        (_, None, _) => false,
        (Action::Update, Some(_), None) => true,
        (Action::Delete, Some(_), None) => false,
        (_, Some(baseline), Some(remote)) => remote.version != baseline,
    }
}

async fn sleep_until(at: Option<Timestamp>) {
    match at {
        Some(at) => {
            let wait = at.as_millis().saturating_sub(Timestamp::now().as_millis());
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
        None => std::future::pending::<()>().await,
    }
}
