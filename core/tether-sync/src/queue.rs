//! Offline operation queue.
//!
//! Pending remote operations live here until the remote confirms them. Each
//! operation moves through a small state machine:
//!
//! ```text
//! pending -> in_flight -> done (removed)
//!                      -> pending   (transient failure, retry_count + 1, backoff)
//!                      -> failed    (retries exhausted; terminal until retried)
//! ```
//!
//! Ordering is decided at dequeue time. Among operations that are ready (the
//! oldest for their entity, not paused, past their backoff, all dependencies
//! gone from the queue) the highest priority wins and ties go to the oldest.
//! Every transition is flushed to the key-value store before the call returns.

use crate::config::{RetryPolicy, queue_key};
use crate::error::{SyncError, SyncResult};
use crate::payload::EntityPayload;
use crate::remote::{RemoteBackend, RemoteEntity, RemoteError, apply_operation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tether_storage::{KeyValueStore, load_json, save_json};
use tether_types::{Action, ChangeId, EntityKey, OperationId, Priority, Timestamp};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Lifecycle state of a queued operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    InFlight,
    Failed,
}

/// A unit of work to replay against the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: OperationId,
    pub action: Action,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub timestamp: Timestamp,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<OperationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub status: OperationStatus,
    /// Remote version the local change was made against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<u64>,
    /// Earliest time the next attempt may start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<Timestamp>,
    /// Newest change record this operation carries to the remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<ChangeId>,
}

impl QueuedOperation {
    pub fn entity(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }

    fn targets(&self, key: &EntityKey) -> bool {
        self.entity_type == key.entity_type && self.entity_id == key.entity_id
    }
}

/// What a caller asks to enqueue. The queue assigns id, timestamp and counters.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub action: Action,
    pub entity: EntityKey,
    pub payload: Value,
    pub priority: Priority,
    pub dependencies: Vec<OperationId>,
    /// Overrides the queue's retry policy for this operation.
    pub max_retries: Option<u32>,
    pub baseline: Option<u64>,
    pub change_id: Option<ChangeId>,
}

impl NewOperation {
    pub fn new(action: Action, entity: EntityKey, payload: Value) -> Self {
        Self {
            action,
            entity,
            payload,
            priority: Priority::Normal,
            dependencies: Vec::new(),
            max_retries: None,
            baseline: None,
            change_id: None,
        }
    }

    pub fn create(entity: EntityKey, payload: Value) -> Self {
        Self::new(Action::Create, entity, payload)
    }

    pub fn update(entity: EntityKey, payload: Value) -> Self {
        Self::new(Action::Update, entity, payload)
    }

    pub fn delete(entity: EntityKey) -> Self {
        Self::new(Action::Delete, entity, Value::Null)
    }

    /// Builds an operation from a typed payload, validating it first.
    pub fn typed<P: EntityPayload>(
        action: Action,
        entity_id: impl Into<String>,
        payload: &P,
    ) -> SyncResult<Self> {
        let entity = EntityKey::new(P::ENTITY_TYPE, entity_id);
        let payload = match action {
            Action::Delete => Value::Null,
            _ => payload.to_payload()?,
        };
        Ok(Self::new(action, entity, payload))
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, dep: OperationId) -> Self {
        self.dependencies.push(dep);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn with_baseline(mut self, version: u64) -> Self {
        self.baseline = Some(version);
        self
    }

    /// Links the operation to the change record it syncs.
    #[must_use]
    pub fn with_change(mut self, change: ChangeId) -> Self {
        self.change_id = Some(change);
        self
    }
}

/// Result of settling an in-flight operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Applied remotely and removed from the queue.
    Done { remote: Option<RemoteEntity> },
    /// Back to pending; eligible again at `next_attempt_at`.
    Retrying {
        retry_count: u32,
        next_attempt_at: Timestamp,
    },
    /// Retries exhausted. Stays in the queue until retried or cleared.
    Failed { error: String },
    /// Refused by the remote as invalid and removed from the queue.
    Rejected { reason: String },
    /// The remote reported divergence. Back to pending without penalty.
    Conflict { current: Option<RemoteEntity> },
    /// The operation was no longer in the queue (cleared mid-flight).
    Missing,
}

#[derive(Debug, Default)]
struct QueueState {
    ops: Vec<QueuedOperation>,
    paused: HashSet<EntityKey>,
}

/// The durable, priority- and dependency-ordered offline queue.
pub struct OfflineQueue {
    state: Mutex<QueueState>,
    store: Arc<dyn KeyValueStore>,
    key: String,
    retry: RetryPolicy,
    notify: Arc<Notify>,
}

impl OfflineQueue {
    /// Opens the queue stored under `namespace`.
    ///
    /// Operations persisted as in-flight were interrupted by a restart; they
    /// return to pending with their retry count untouched.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        namespace: &str,
        retry: RetryPolicy,
    ) -> SyncResult<Self> {
        let mut queue = Self::load(store, namespace, retry)?;
        let state = queue.state.get_mut();

        let mut interrupted = 0;
        for op in state
            .ops
            .iter_mut()
            .filter(|op| op.status == OperationStatus::InFlight)
        {
            op.status = OperationStatus::Pending;
            interrupted += 1;
        }
        if interrupted > 0 {
            info!("Resuming {} operations interrupted mid-flight", interrupted);
            save_json(queue.store.as_ref(), &queue.key, &state.ops)?;
        }
        Ok(queue)
    }

    /// Loads the queue stored under `namespace` exactly as persisted, without
    /// writing anything back. In-flight operations stay in flight, so this
    /// suits inspecting a store another process owns.
    pub fn load(
        store: Arc<dyn KeyValueStore>,
        namespace: &str,
        retry: RetryPolicy,
    ) -> SyncResult<Self> {
        let key = queue_key(namespace);
        let ops: Vec<QueuedOperation> = load_json(store.as_ref(), &key)?.unwrap_or_default();
        debug!("Loaded {} queued operations from {}", ops.len(), key);

        Ok(Self {
            state: Mutex::new(QueueState {
                ops,
                paused: HashSet::new(),
            }),
            store,
            key,
            retry,
            notify: Arc::new(Notify::new()),
        })
    }

    /// Woken whenever new work may be ready.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn persist(&self, state: &QueueState) -> SyncResult<()> {
        save_json(self.store.as_ref(), &self.key, &state.ops)?;
        Ok(())
    }

    // ── Enqueue ──────────────────────────────────────────────────

    /// Validates and appends an operation at the logical tail.
    pub async fn enqueue(&self, new: NewOperation) -> SyncResult<QueuedOperation> {
        self.validate(&new)?;
        let op = self.build(new);

        let mut state = self.state.lock().await;
        state.ops.push(op.clone());
        if let Err(e) = self.persist(&state) {
            state.ops.pop();
            return Err(e);
        }
        drop(state);

        debug!(
            "Enqueued {} {} ({}, priority {})",
            op.action,
            op.entity(),
            op.id,
            op.priority
        );
        self.notify.notify_one();
        Ok(op)
    }

    /// Enqueues a typed payload, validating it at the queue boundary.
    pub async fn enqueue_typed<P: EntityPayload>(
        &self,
        action: Action,
        entity_id: impl Into<String>,
        payload: &P,
        priority: Priority,
    ) -> SyncResult<QueuedOperation> {
        let new = NewOperation::typed(action, entity_id, payload)?.with_priority(priority);
        self.enqueue(new).await
    }

    fn build(&self, new: NewOperation) -> QueuedOperation {
        QueuedOperation {
            id: OperationId::new(),
            action: new.action,
            entity_type: new.entity.entity_type,
            entity_id: new.entity.entity_id,
            payload: new.payload,
            timestamp: Timestamp::now(),
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(self.retry.max_retries),
            priority: new.priority,
            dependencies: new.dependencies,
            error: None,
            status: OperationStatus::Pending,
            baseline: new.baseline,
            next_attempt_at: None,
            change_id: new.change_id,
        }
    }

    /// Checks what [`enqueue`](Self::enqueue) would refuse, without queuing.
    pub(crate) fn validate(&self, new: &NewOperation) -> SyncResult<()> {
        if new.entity.entity_type.trim().is_empty() {
            return Err(SyncError::Validation("entity type is empty".into()));
        }
        if new.entity.entity_id.trim().is_empty() {
            return Err(SyncError::Validation("entity id is empty".into()));
        }
        if matches!(new.action, Action::Create | Action::Update) && !new.payload.is_object() {
            return Err(SyncError::Validation(format!(
                "{} of {} needs an object payload",
                new.action, new.entity
            )));
        }
        Ok(())
    }

    // ── Dequeue ──────────────────────────────────────────────────

    /// Marks the next ready operation in-flight and returns it.
    pub async fn dequeue_next_ready(&self) -> SyncResult<Option<QueuedOperation>> {
        self.dequeue_next_ready_at(Timestamp::now()).await
    }

    /// [`dequeue_next_ready`](Self::dequeue_next_ready) evaluated at `now`.
    pub async fn dequeue_next_ready_at(
        &self,
        now: Timestamp,
    ) -> SyncResult<Option<QueuedOperation>> {
        let mut state = self.state.lock().await;
        let Some(idx) = select_ready(&state.ops, &state.paused, now) else {
            return Ok(None);
        };

        state.ops[idx].status = OperationStatus::InFlight;
        if let Err(e) = self.persist(&state) {
            state.ops[idx].status = OperationStatus::Pending;
            return Err(e);
        }

        let op = state.ops[idx].clone();
        debug!("Dequeued {} {} ({})", op.action, op.entity(), op.id);
        Ok(Some(op))
    }

    // ── Processing ───────────────────────────────────────────────

    /// Applies an in-flight operation remotely and settles it.
    pub async fn process_operation(
        &self,
        op: &QueuedOperation,
        remote: &dyn RemoteBackend,
        timeout: Duration,
    ) -> SyncResult<ProcessOutcome> {
        let result = match tokio::time::timeout(timeout, apply_operation(remote, op)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        };
        self.settle(op.id, result).await
    }

    /// Applies the state transition for a finished remote attempt.
    pub async fn settle(
        &self,
        id: OperationId,
        result: Result<Option<RemoteEntity>, RemoteError>,
    ) -> SyncResult<ProcessOutcome> {
        let mut state = self.state.lock().await;
        let Some(idx) = state.ops.iter().position(|op| op.id == id) else {
            debug!("Operation {} left the queue while in flight", id);
            return Ok(ProcessOutcome::Missing);
        };
        let snapshot = state.ops.clone();

        let outcome = match result {
            Ok(remote) => {
                let op = state.ops.remove(idx);
                let key = op.entity();
                let version = remote.as_ref().map(|r| r.version);
                // Later writes from this device build on the version just produced.
                for later in state.ops.iter_mut().filter(|o| o.targets(&key)) {
                    later.baseline = version;
                }
                info!("Synced {} {} ({})", op.action, key, op.id);
                ProcessOutcome::Done { remote }
            }
            Err(RemoteError::Validation(reason)) => {
                let op = state.ops.remove(idx);
                warn!("Remote rejected {} {} ({}): {}", op.action, op.entity(), op.id, reason);
                fail_dependents(&mut state.ops, &[op.id], "was rejected by the remote");
                ProcessOutcome::Rejected { reason }
            }
            Err(RemoteError::Conflict { current }) => {
                let op = &mut state.ops[idx];
                op.status = OperationStatus::Pending;
                ProcessOutcome::Conflict { current }
            }
            Err(err) => self.record_failure(&mut state.ops[idx], err.to_string()),
        };

        if let Err(e) = self.persist(&state) {
            // The store still holds the attempt as in flight; a restart would
            // make it pending again, so memory does the same.
            state.ops = snapshot;
            if let Some(op) = state.ops.iter_mut().find(|op| op.id == id) {
                op.status = OperationStatus::Pending;
            }
            return Err(e);
        }
        Ok(outcome)
    }

    fn record_failure(&self, op: &mut QueuedOperation, error: String) -> ProcessOutcome {
        if op.retry_count < op.max_retries {
            op.retry_count += 1;
            let next = Timestamp::now().saturating_add(self.retry.backoff(op.retry_count));
            op.status = OperationStatus::Pending;
            op.error = Some(error);
            op.next_attempt_at = Some(next);
            debug!(
                "Retry {}/{} for {} scheduled at {}",
                op.retry_count, op.max_retries, op.id, next
            );
            ProcessOutcome::Retrying {
                retry_count: op.retry_count,
                next_attempt_at: next,
            }
        } else {
            op.status = OperationStatus::Failed;
            op.error = Some(error.clone());
            op.next_attempt_at = None;
            warn!(
                "Operation {} on {} failed after {} retries: {}",
                op.id,
                op.entity(),
                op.retry_count,
                error
            );
            ProcessOutcome::Failed { error }
        }
    }

    /// Returns an in-flight operation to pending without counting a retry.
    /// Used when the attempt was cut short by connectivity, not by the remote.
    pub async fn release(&self, id: OperationId) -> SyncResult<bool> {
        let mut state = self.state.lock().await;
        let Some(op) = state
            .ops
            .iter_mut()
            .find(|op| op.id == id && op.status == OperationStatus::InFlight)
        else {
            return Ok(false);
        };
        op.status = OperationStatus::Pending;
        debug!("Released {} back to pending", id);
        self.persist(&state)?;
        Ok(true)
    }

    // ── Entity controls ──────────────────────────────────────────

    /// Stops dequeuing operations for `key` until resumed.
    pub async fn pause_entity(&self, key: &EntityKey) {
        self.state.lock().await.paused.insert(key.clone());
    }

    pub async fn resume_entity(&self, key: &EntityKey) {
        let removed = self.state.lock().await.paused.remove(key);
        if removed {
            self.notify.notify_one();
        }
    }

    pub async fn is_paused(&self, key: &EntityKey) -> bool {
        self.state.lock().await.paused.contains(key)
    }

    /// Points every queued operation for `key` at a new baseline version.
    /// Against an existing remote entity, queued creates become updates.
    pub async fn rebase_entity(&self, key: &EntityKey, version: Option<u64>) -> SyncResult<usize> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for op in state.ops.iter_mut().filter(|op| op.targets(key)) {
            op.baseline = version;
            if version.is_some() && op.action == Action::Create {
                op.action = Action::Update;
            }
            count += 1;
        }
        if count > 0 {
            self.persist(&state)?;
        }
        Ok(count)
    }

    /// Removes every queued operation for `key` that is not in flight.
    ///
    /// Operations elsewhere that depend on a discarded one fail: they were
    /// ordered after a write that will never happen.
    pub async fn discard_entity(&self, key: &EntityKey) -> SyncResult<Vec<QueuedOperation>> {
        let mut state = self.state.lock().await;
        let snapshot = state.ops.clone();
        let (discarded, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.ops)
            .into_iter()
            .partition(|op| op.targets(key) && op.status != OperationStatus::InFlight);
        state.ops = kept;
        if discarded.is_empty() {
            return Ok(discarded);
        }

        let ids: Vec<OperationId> = discarded.iter().map(|op| op.id).collect();
        let blocked = fail_dependents(&mut state.ops, &ids, "was discarded");
        if let Err(e) = self.persist(&state) {
            state.ops = snapshot;
            return Err(e);
        }
        info!("Discarded {} queued operations for {}", discarded.len(), key);
        if blocked > 0 {
            warn!("{} dependent operations failed after discarding {}", blocked, key);
        }
        Ok(discarded)
    }

    /// Replaces the queued operations for `key` with a single new one.
    ///
    /// The replacement takes over the ordering of what it replaces: it keeps
    /// their outside dependencies, and operations that depended on them now
    /// depend on it. Without a change id of its own it carries the newest one
    /// it replaces.
    pub async fn replace_entity(
        &self,
        key: &EntityKey,
        mut new: NewOperation,
    ) -> SyncResult<QueuedOperation> {
        self.validate(&new)?;

        let mut state = self.state.lock().await;
        let snapshot = state.ops.clone();
        let (replaced, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.ops)
            .into_iter()
            .partition(|op| op.targets(key) && op.status != OperationStatus::InFlight);
        state.ops = kept;

        let replaced_ids: HashSet<OperationId> = replaced.iter().map(|op| op.id).collect();
        for dep in replaced.iter().flat_map(|op| &op.dependencies) {
            if !replaced_ids.contains(dep) && !new.dependencies.contains(dep) {
                new.dependencies.push(*dep);
            }
        }
        if new.change_id.is_none() {
            new.change_id = replaced.iter().rev().find_map(|op| op.change_id);
        }

        let op = self.build(new);
        for other in state.ops.iter_mut() {
            if other.dependencies.iter().any(|dep| replaced_ids.contains(dep)) {
                let mut seen = HashSet::new();
                other.dependencies = other
                    .dependencies
                    .iter()
                    .map(|dep| if replaced_ids.contains(dep) { op.id } else { *dep })
                    .filter(|dep| seen.insert(*dep))
                    .collect();
            }
        }
        state.ops.push(op.clone());

        if let Err(e) = self.persist(&state) {
            state.ops = snapshot;
            return Err(e);
        }
        drop(state);

        info!(
            "Replaced {} queued operations for {} with {} ({})",
            replaced.len(),
            key,
            op.action,
            op.id
        );
        self.notify.notify_one();
        Ok(op)
    }

    // ── User actions ─────────────────────────────────────────────

    /// Resets a failed operation to pending with a fresh retry budget.
    pub async fn retry(&self, id: OperationId) -> SyncResult<QueuedOperation> {
        let mut state = self.state.lock().await;
        let op = state
            .ops
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or(SyncError::OperationNotFound(id))?;
        if op.status == OperationStatus::Failed {
            reset_for_retry(op);
        }
        let op = op.clone();
        self.persist(&state)?;
        drop(state);
        self.notify.notify_one();
        Ok(op)
    }

    /// Resets every failed operation. Returns how many were reset.
    pub async fn retry_failed(&self) -> SyncResult<usize> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for op in state
            .ops
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Failed)
        {
            reset_for_retry(op);
            count += 1;
        }
        if count > 0 {
            self.persist(&state)?;
            drop(state);
            info!("Retrying {} failed operations", count);
            self.notify.notify_one();
        }
        Ok(count)
    }

    /// Removes one operation. An in-flight operation finishes its attempt first
    /// and is then simply not found. Operations depending on the removed one
    /// fail.
    pub async fn remove(&self, id: OperationId) -> SyncResult<QueuedOperation> {
        let mut state = self.state.lock().await;
        let idx = state
            .ops
            .iter()
            .position(|op| op.id == id)
            .ok_or(SyncError::OperationNotFound(id))?;
        let snapshot = state.ops.clone();
        let op = state.ops.remove(idx);
        fail_dependents(&mut state.ops, &[op.id], "was removed");
        if let Err(e) = self.persist(&state) {
            state.ops = snapshot;
            return Err(e);
        }
        Ok(op)
    }

    /// Removes every operation that is not in flight. Returns how many.
    pub async fn clear(&self) -> SyncResult<usize> {
        let mut state = self.state.lock().await;
        let before = state.ops.len();
        state.ops.retain(|op| op.status == OperationStatus::InFlight);
        let removed = before - state.ops.len();
        self.persist(&state)?;
        info!("Cleared {} queued operations", removed);
        Ok(removed)
    }

    // ── Queries ──────────────────────────────────────────────────

    /// A snapshot of the queue in insertion order.
    pub async fn operations(&self) -> Vec<QueuedOperation> {
        self.state.lock().await.ops.clone()
    }

    pub async fn get(&self, id: OperationId) -> Option<QueuedOperation> {
        self.state
            .lock()
            .await
            .ops
            .iter()
            .find(|op| op.id == id)
            .cloned()
    }

    pub async fn operations_for(&self, key: &EntityKey) -> Vec<QueuedOperation> {
        self.state
            .lock()
            .await
            .ops
            .iter()
            .filter(|op| op.targets(key))
            .cloned()
            .collect()
    }

    pub async fn failed_operations(&self) -> Vec<QueuedOperation> {
        self.state
            .lock()
            .await
            .ops
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.ops.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.ops.is_empty()
    }

    /// Operations still waiting to reach the remote (pending or in flight).
    pub async fn pending_count(&self) -> usize {
        self.state
            .lock()
            .await
            .ops
            .iter()
            .filter(|op| op.status != OperationStatus::Failed)
            .count()
    }

    pub async fn has_failed(&self) -> bool {
        self.state
            .lock()
            .await
            .ops
            .iter()
            .any(|op| op.status == OperationStatus::Failed)
    }

    /// Earliest pending backoff deadline, if any operation is waiting on one.
    pub async fn next_wakeup(&self) -> Option<Timestamp> {
        self.state
            .lock()
            .await
            .ops
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .filter_map(|op| op.next_attempt_at)
            .min()
    }
}

/// Fails every waiting operation that depends on one of `gone`, which left the
/// queue without reaching the remote. Returns how many failed.
fn fail_dependents(ops: &mut [QueuedOperation], gone: &[OperationId], why: &str) -> usize {
    let mut count = 0;
    for op in ops
        .iter_mut()
        .filter(|op| op.status != OperationStatus::InFlight)
    {
        let Some(dep) = op.dependencies.iter().copied().find(|dep| gone.contains(dep)) else {
            continue;
        };
        op.error = Some(format!("dependency {dep} {why}"));
        op.status = OperationStatus::Failed;
        op.next_attempt_at = None;
        count += 1;
    }
    count
}

fn reset_for_retry(op: &mut QueuedOperation) {
    op.status = OperationStatus::Pending;
    op.retry_count = 0;
    op.error = None;
    op.next_attempt_at = None;
}

/// Index of the operation to run next, if any is ready.
///
/// Readiness is a filter applied before ordering: only the oldest operation of
/// each entity is a candidate, and it must be pending, unpaused, past its
/// backoff, and have no dependency still in the queue.
fn select_ready(
    ops: &[QueuedOperation],
    paused: &HashSet<EntityKey>,
    now: Timestamp,
) -> Option<usize> {
    let queued: HashSet<OperationId> = ops.iter().map(|op| op.id).collect();
    let mut heads: HashSet<EntityKey> = HashSet::new();
    let mut best: Option<usize> = None;

    for (idx, op) in ops.iter().enumerate() {
        let key = op.entity();
        if !heads.insert(key.clone()) {
            continue;
        }
        if op.status != OperationStatus::Pending || paused.contains(&key) {
            continue;
        }
        if op.next_attempt_at.is_some_and(|at| at > now) {
            continue;
        }
        if op.dependencies.iter().any(|dep| queued.contains(dep)) {
            continue;
        }

        best = match best {
            Some(b) if !outranks(op, &ops[b]) => Some(b),
            _ => Some(idx),
        };
    }
    best
}

/// Higher priority first, then older timestamp. Equal ranks keep queue order.
fn outranks(a: &QueuedOperation, b: &QueuedOperation) -> bool {
    a.priority > b.priority || (a.priority == b.priority && a.timestamp < b.timestamp)
}
