//! Tests for the sync coordinator: draining, connectivity, conflicts, status.

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tether_storage::MemoryStore;
use tether_sync::remote::mock::{InMemoryRemote, RemoteCall};
use tether_sync::{
    ConflictDetail, ConflictEvent, InMemoryState, NetworkMonitor, NewOperation, OperationStatus,
    RemoteError, Resolution, ResolutionStrategy, RetryPolicy, StateAccessor, SyncConfig,
    SyncCoordinator, SyncError, SyncStatus,
};
use tether_types::{Action, EntityKey};
use tokio::sync::watch;

struct Harness {
    sync: SyncCoordinator,
    store: Arc<MemoryStore>,
    remote: Arc<InMemoryRemote>,
    state: Arc<InMemoryState>,
    network: NetworkMonitor,
}

fn config() -> SyncConfig {
    SyncConfig {
        namespace: "test".into(),
        retry: RetryPolicy::immediate(3),
        ..Default::default()
    }
}

async fn harness_with(config: SyncConfig, network: NetworkMonitor) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(InMemoryRemote::new());
    let state = Arc::new(InMemoryState::new());
    let sync = SyncCoordinator::open(
        config,
        store.clone(),
        remote.clone(),
        state.clone(),
        network.clone(),
    )
    .await
    .unwrap();
    Harness {
        sync,
        store,
        remote,
        state,
        network,
    }
}

async fn harness() -> Harness {
    harness_with(config(), NetworkMonitor::default()).await
}

fn project(id: &str) -> EntityKey {
    EntityKey::new("project", id)
}

/// Seeds an entity that both sides agree on and returns its remote version.
fn seed(h: &Harness, key: &EntityKey, data: Value) -> u64 {
    h.state.set(key, Some(data.clone()));
    h.remote.put(key, data).version
}

// ── Draining ────────────────────────────────────────────────────

#[tokio::test]
async fn online_drain_applies_local_changes() {
    let h = harness().await;
    let key = project("p1");

    h.sync.local_create(key.clone(), json!({ "name": "Draft" })).await.unwrap();
    h.sync.local_update(key.clone(), json!({ "name": "Final" })).await.unwrap();
    assert_eq!(h.sync.status().status_text(), "2 pending");

    let report = h.sync.drain_once().await.unwrap();

    assert_eq!(report.applied, 2);
    assert_eq!(h.remote.get(&key).unwrap().data, json!({ "name": "Final" }));
    assert!(h.sync.queue().is_empty().await);
    assert!(h.sync.tracker().is_empty().await);

    let status = h.sync.status();
    assert_eq!(status.status, SyncStatus::Idle);
    assert_eq!(status.pending_operations, 0);
    assert!(status.last_sync_time.is_some());
    assert_eq!(status.status_text(), "All changes synced");
}

#[tokio::test]
async fn local_delete_removes_remote_entity() {
    let h = harness().await;
    let key = project("p1");
    let version = seed(&h, &key, json!({ "name": "Old" }));
    h.sync.set_known_version(&key, Some(version)).await.unwrap();

    let op = h.sync.local_delete(key.clone()).await.unwrap();
    assert_eq!(op.baseline, Some(version));

    h.sync.drain_once().await.unwrap();
    assert_eq!(h.remote.get(&key), None);
    assert_eq!(h.state.get(&key), None);
    assert_eq!(h.sync.known_version(&key).await, None);
}

#[tokio::test]
async fn known_version_follows_applied_writes() {
    let h = harness().await;
    let key = project("p1");

    h.sync.local_create(key.clone(), json!({ "n": 1 })).await.unwrap();
    h.sync.drain_once().await.unwrap();
    let created = h.remote.get(&key).unwrap().version;
    assert_eq!(h.sync.known_version(&key).await, Some(created));

    let op = h.sync.local_update(key.clone(), json!({ "n": 2 })).await.unwrap();
    assert_eq!(op.baseline, Some(created));
}

#[tokio::test]
async fn offline_changes_wait_for_connectivity() {
    let h = harness_with(config(), NetworkMonitor::new(tether_sync::Connectivity::Offline)).await;
    let key = project("p1");

    h.sync.local_create(key.clone(), json!({ "name": "a" })).await.unwrap();
    let report = h.sync.drain_once().await.unwrap();

    assert_eq!(report.applied, 0);
    assert!(h.remote.calls().is_empty());
    assert_eq!(h.sync.status().status, SyncStatus::Offline);
    assert_eq!(h.sync.status().status_text(), "Offline");
    assert_eq!(h.sync.status().pending_operations, 1);

    h.network.set_online();
    h.sync.drain_once().await.unwrap();
    assert!(h.remote.get(&key).is_some());
    assert_eq!(h.sync.status().status_text(), "All changes synced");
}

#[tokio::test(start_paused = true)]
async fn going_offline_mid_apply_returns_operation_without_penalty() {
    let h = harness().await;
    let key = project("p1");
    h.remote.set_latency(Some(Duration::from_secs(1)));
    let op = h.sync.local_create(key.clone(), json!({ "name": "a" })).await.unwrap();

    let disconnect = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.network.set_offline();
    };
    let (report, ()) = tokio::join!(h.sync.drain_once(), disconnect);
    let report = report.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.applied, 0);
    let stored = h.sync.queue().get(op.id).await.unwrap();
    assert_eq!(stored.status, OperationStatus::Pending);
    assert_eq!(stored.retry_count, 0);
    assert!(h.remote.writes().is_empty());
    assert_eq!(h.sync.status().status, SyncStatus::Offline);
}

#[tokio::test]
async fn exhausted_retries_surface_as_error_status() {
    let h = harness().await;
    let key = project("p1");
    // Each attempt fails at its fetch: one try plus three retries.
    h.remote
        .fail_next_n(4, RemoteError::Transient("service unavailable".into()));

    h.sync.local_create(key.clone(), json!({ "name": "a" })).await.unwrap();
    let report = h.sync.drain_once().await.unwrap();

    assert_eq!(report.retried, 3);
    assert_eq!(report.failed, 1);
    let status = h.sync.status();
    assert_eq!(status.status, SyncStatus::Error);
    assert_eq!(status.status_text(), "Sync error — click to retry");
    assert_eq!(status.errors.len(), 1);
    assert!(status.errors[0].contains("service unavailable"));

    assert_eq!(h.sync.retry_failed().await.unwrap(), 1);
    assert_eq!(h.sync.status().status, SyncStatus::Idle);
    h.sync.drain_once().await.unwrap();
    assert!(h.remote.get(&key).is_some());
    assert!(h.sync.status().errors.is_empty());
}

#[tokio::test]
async fn rejected_operations_are_reported_and_dropped() {
    let h = harness().await;
    let missing = project("ghost");
    h.sync
        .submit(NewOperation::update(missing.clone(), json!({ "name": "x" })))
        .await
        .unwrap();

    let report = h.sync.drain_once().await.unwrap();

    assert_eq!(report.rejected, 1);
    assert!(h.sync.queue().is_empty().await);
    let rejections = h.sync.rejections().await;
    assert_eq!(rejections.len(), 1);
    assert!(rejections[0].contains("project/ghost"));
    assert_eq!(h.sync.status().errors, rejections);

    h.sync.clear_rejections().await;
    assert!(h.sync.status().errors.is_empty());
}

#[tokio::test]
async fn clear_queue_drops_pending_work() {
    let h = harness_with(config(), NetworkMonitor::new(tether_sync::Connectivity::Offline)).await;
    h.sync.local_create(project("p1"), json!({})).await.unwrap();
    h.sync.local_create(project("p2"), json!({})).await.unwrap();

    assert_eq!(h.sync.clear_queue().await.unwrap(), 2);
    assert_eq!(h.sync.status().pending_operations, 0);
}

#[tokio::test]
async fn invalid_local_change_touches_nothing() {
    let h = harness().await;
    let key = project("p1");

    let err = h.sync.local_create(key.clone(), json!(1)).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    let err = h
        .sync
        .local_update(project(""), json!({ "name": "x" }))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    assert_eq!(h.state.get(&key), None);
    assert!(h.sync.tracker().is_empty().await);
    assert!(h.sync.queue().is_empty().await);
}

#[tokio::test]
async fn storage_failure_aborts_the_cycle_until_writes_recover() {
    let h = harness().await;
    let key = project("p1");
    h.sync.local_create(key.clone(), json!({ "name": "a" })).await.unwrap();

    h.store.set_fail_writes(true);
    let err = h.sync.drain_once().await.unwrap_err();

    assert!(matches!(err, SyncError::Persistence(_)));
    let ops = h.sync.queue().operations().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, OperationStatus::Pending);
    assert_eq!(ops[0].retry_count, 0);
    assert!(h.remote.writes().is_empty());
    assert_eq!(h.sync.status().last_sync_time, None);

    h.store.set_fail_writes(false);
    let report = h.sync.drain_once().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(h.remote.get(&key).unwrap().data, json!({ "name": "a" }));
    assert!(h.sync.queue().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn syncing_one_change_keeps_later_records_for_the_entity() {
    let h = harness().await;
    let key = project("p1");
    h.remote.set_latency(Some(Duration::from_secs(1)));
    h.sync.local_create(key.clone(), json!({ "name": "a" })).await.unwrap();
    let second = h
        .sync
        .local_update(key.clone(), json!({ "name": "b" }))
        .await
        .unwrap();

    // The create takes a fetch and a write; drop offline during the update.
    let disconnect = async {
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        h.network.set_offline();
    };
    let (report, ()) = tokio::join!(h.sync.drain_once(), disconnect);
    let report = report.unwrap();

    assert_eq!(report.applied, 1);
    assert!(report.interrupted);
    let left = h.sync.tracker().changes_for(&key).await;
    assert_eq!(left.len(), 1);
    assert_eq!(Some(left[0].id), second.change_id);
    assert_eq!(left[0].new_value, Some(json!({ "name": "b" })));
}

#[tokio::test]
async fn known_versions_survive_restart() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(InMemoryRemote::new());
    let state = Arc::new(InMemoryState::new());
    let key = project("project-1");
    let open = || {
        SyncCoordinator::open(
            config(),
            store.clone(),
            remote.clone(),
            state.clone(),
            NetworkMonitor::default(),
        )
    };

    let synced = {
        let sync = open().await.unwrap();
        sync.local_create(key.clone(), json!({ "name": "Original" }))
            .await
            .unwrap();
        sync.drain_once().await.unwrap();
        remote.get(&key).unwrap().version
    };

    let sync = open().await.unwrap();
    assert_eq!(sync.known_version(&key).await, Some(synced));

    remote.put(&key, json!({ "name": "Remote Name" }));
    let op = sync
        .local_update(key.clone(), json!({ "name": "Local Name" }))
        .await
        .unwrap();
    assert_eq!(op.baseline, Some(synced));

    let report = sync.drain_once().await.unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(remote.get(&key).unwrap().data, json!({ "name": "Remote Name" }));
    let conflict = sync.conflicts().await.remove(0);
    assert_eq!(conflict.fields().unwrap().0, ["name".to_string()]);
}

// ── Conflicts ───────────────────────────────────────────────────

/// Both sides edit `project-1` from the same baseline.
async fn diverge(h: &Harness, local: Value, remote: Value) -> tether_sync::Conflict {
    let key = project("project-1");
    let base = seed(h, &key, json!({ "name": "Original", "status": "open" }));
    h.sync.set_known_version(&key, Some(base)).await.unwrap();

    h.sync.local_update(key.clone(), local).await.unwrap();
    h.remote.put(&key, remote);

    let report = h.sync.drain_once().await.unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.applied, 0);

    let conflicts = h.sync.conflicts().await;
    assert_eq!(conflicts.len(), 1);
    conflicts.into_iter().next().unwrap()
}

#[tokio::test]
async fn same_field_edit_raises_field_conflict_and_local_wins() {
    let h = harness().await;
    let key = project("project-1");
    let conflict = diverge(
        &h,
        json!({ "name": "Local Name", "status": "open" }),
        json!({ "name": "Remote Name", "status": "open" }),
    )
    .await;

    assert_eq!(conflict.entity.entity_id, "project-1");
    let (local, remote) = conflict.fields().unwrap();
    assert_eq!(local, ["name".to_string()]);
    assert_eq!(remote, ["name".to_string()]);
    assert_eq!(h.sync.status().conflicts, 1);

    let resolution = h
        .sync
        .resolve(conflict.id, ResolutionStrategy::Local)
        .await
        .unwrap();
    assert!(matches!(resolution, Some(Resolution::KeepLocal { recreate: false, .. })));

    h.sync.drain_once().await.unwrap();
    assert_eq!(h.remote.get(&key).unwrap().data["name"], "Local Name");
    assert!(h.sync.conflicts().await.is_empty());
    assert!(h.sync.queue().is_empty().await);
}

#[tokio::test]
async fn resolving_twice_is_a_no_op() {
    let h = harness().await;
    let conflict = diverge(
        &h,
        json!({ "name": "Local Name", "status": "open" }),
        json!({ "name": "Remote Name", "status": "open" }),
    )
    .await;

    let first = h.sync.resolve(conflict.id, ResolutionStrategy::Remote).await.unwrap();
    let queue_after_first = h.sync.queue().operations().await;
    let second = h.sync.resolve(conflict.id, ResolutionStrategy::Local).await.unwrap();

    assert!(first.is_some());
    assert_eq!(second, None);
    assert_eq!(h.sync.queue().operations().await, queue_after_first);
}

#[tokio::test]
async fn remote_resolution_adopts_remote_state() {
    let h = harness().await;
    let key = project("project-1");
    let remote_data = json!({ "name": "Remote Name", "status": "open" });
    let conflict = diverge(
        &h,
        json!({ "name": "Local Name", "status": "open" }),
        remote_data.clone(),
    )
    .await;

    h.sync
        .resolve(conflict.id, ResolutionStrategy::Remote)
        .await
        .unwrap();

    assert!(h.sync.queue().is_empty().await);
    assert_eq!(h.state.get(&key), Some(remote_data));
    assert!(h.sync.tracker().changes_for(&key).await.is_empty());
    assert_eq!(h.sync.known_version(&key).await, conflict.remote_version());

    let writes_before = h.remote.writes().len();
    h.sync.drain_once().await.unwrap();
    assert_eq!(h.remote.writes().len(), writes_before);
}

#[tokio::test]
async fn disjoint_fields_merge() {
    let h = harness().await;
    let key = project("project-1");
    let conflict = diverge(
        &h,
        json!({ "name": "Local Name", "status": "open" }),
        json!({ "name": "Original", "status": "closed" }),
    )
    .await;

    let resolution = h
        .sync
        .resolve(conflict.id, ResolutionStrategy::Merge)
        .await
        .unwrap();
    let merged = json!({ "name": "Local Name", "status": "closed" });
    assert!(matches!(resolution, Some(Resolution::Merge { ref payload, .. }) if *payload == merged));
    assert_eq!(h.state.get(&key), Some(merged.clone()));

    let ops = h.sync.queue().operations().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].action, Action::Update);
    assert_eq!(ops[0].baseline, conflict.remote_version());

    h.sync.drain_once().await.unwrap();
    assert_eq!(h.remote.get(&key).unwrap().data, merged);
}

#[tokio::test]
async fn dependent_waits_for_merged_write() {
    let h = harness().await;
    let other = project("p2");
    let other_base = seed(&h, &other, json!({ "n": 0 }));
    h.sync.set_known_version(&other, Some(other_base)).await.unwrap();

    let key = project("project-1");
    let base = seed(&h, &key, json!({ "name": "Original", "status": "open" }));
    h.sync.set_known_version(&key, Some(base)).await.unwrap();
    let parent = h
        .sync
        .local_update(key.clone(), json!({ "name": "Local Name", "status": "open" }))
        .await
        .unwrap();
    h.sync
        .submit(NewOperation::update(other.clone(), json!({ "n": 1 })).with_dependency(parent.id))
        .await
        .unwrap();
    h.remote
        .put(&key, json!({ "name": "Original", "status": "closed" }));

    let report = h.sync.drain_once().await.unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.applied, 0);

    let conflict = h.sync.conflicts().await.remove(0);
    h.sync
        .resolve(conflict.id, ResolutionStrategy::Merge)
        .await
        .unwrap();
    h.sync.drain_once().await.unwrap();

    assert_eq!(
        h.remote.writes(),
        vec![RemoteCall::Update(key.clone()), RemoteCall::Update(other.clone())]
    );
    assert_eq!(h.remote.get(&other).unwrap().data, json!({ "n": 1 }));
}

#[tokio::test]
async fn adopting_remote_fails_operations_that_depended_on_local_edits() {
    let h = harness().await;
    let key = project("project-1");
    let base = seed(&h, &key, json!({ "name": "Original" }));
    h.sync.set_known_version(&key, Some(base)).await.unwrap();
    let parent = h
        .sync
        .local_update(key.clone(), json!({ "name": "Local" }))
        .await
        .unwrap();
    let child = h
        .sync
        .submit(
            NewOperation::create(project("p2"), json!({ "owner": "project-1" }))
                .with_dependency(parent.id),
        )
        .await
        .unwrap();
    h.remote.put(&key, json!({ "name": "Remote" }));

    h.sync.drain_once().await.unwrap();
    let conflict = h.sync.conflicts().await.remove(0);
    h.sync
        .resolve(conflict.id, ResolutionStrategy::Remote)
        .await
        .unwrap();

    let stored = h.sync.queue().get(child.id).await.unwrap();
    assert_eq!(stored.status, OperationStatus::Failed);
    assert_eq!(h.sync.status().status, SyncStatus::Error);
    h.sync.drain_once().await.unwrap();
    assert_eq!(h.remote.get(&project("p2")), None);
}

#[tokio::test]
async fn overlapping_merge_is_rejected_and_conflict_stays() {
    let h = harness().await;
    let conflict = diverge(
        &h,
        json!({ "name": "Local Name", "status": "open" }),
        json!({ "name": "Remote Name", "status": "open" }),
    )
    .await;

    let err = h
        .sync
        .resolve(conflict.id, ResolutionStrategy::Merge)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::MergeRejected { ref fields } if fields == &["name".to_string()]));
    assert_eq!(h.sync.conflicts().await.len(), 1);
    assert!(h.sync.queue().is_paused(&project("project-1")).await);
}

#[tokio::test]
async fn conflict_pauses_only_its_entity() {
    let h = harness().await;
    let key = project("project-1");
    let base = seed(&h, &key, json!({ "name": "Original" }));
    h.sync.set_known_version(&key, Some(base)).await.unwrap();
    h.sync
        .local_update(key.clone(), json!({ "name": "Local" }))
        .await
        .unwrap();
    h.remote.put(&key, json!({ "name": "Remote" }));
    h.sync.local_create(project("p2"), json!({ "name": "Other" })).await.unwrap();

    let report = h.sync.drain_once().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.applied, 1);
    assert!(h.remote.get(&project("p2")).is_some());
    assert_eq!(h.sync.status().status_text(), "1 pending");
}

#[tokio::test]
async fn create_against_existing_entity_is_whole_entity_conflict() {
    let h = harness().await;
    let key = project("p1");
    h.remote.put(&key, json!({ "name": "Theirs" }));

    h.sync
        .local_create(key.clone(), json!({ "name": "Mine", "elements": [1, 2] }))
        .await
        .unwrap();
    h.sync.drain_once().await.unwrap();

    let conflict = h.sync.conflicts().await.remove(0);
    let ConflictDetail::WholeEntity {
        local_version,
        cloud_version,
    } = &conflict.detail
    else {
        panic!("expected a whole-entity conflict");
    };
    assert_eq!(local_version.as_ref().unwrap().elements, vec![json!(1), json!(2)]);
    assert_eq!(cloud_version.as_ref().unwrap().data, json!({ "name": "Theirs" }));

    let err = h
        .sync
        .resolve(conflict.id, ResolutionStrategy::Merge)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::MergeUnsupported));

    h.sync
        .resolve(conflict.id, ResolutionStrategy::Local)
        .await
        .unwrap();
    h.sync.drain_once().await.unwrap();
    assert_eq!(h.remote.get(&key).unwrap().data["name"], "Mine");
}

#[tokio::test]
async fn keeping_local_after_remote_delete_recreates_entity() {
    let h = harness().await;
    let key = project("p1");
    let base = seed(&h, &key, json!({ "name": "Original" }));
    h.sync.set_known_version(&key, Some(base)).await.unwrap();
    h.sync
        .local_update(key.clone(), json!({ "name": "Edited" }))
        .await
        .unwrap();
    h.remote.remove(&key);

    h.sync.drain_once().await.unwrap();
    let conflict = h.sync.conflicts().await.remove(0);
    assert_eq!(conflict.remote, None);

    let resolution = h
        .sync
        .resolve(conflict.id, ResolutionStrategy::Local)
        .await
        .unwrap();
    assert!(matches!(resolution, Some(Resolution::KeepLocal { recreate: true, .. })));

    h.sync.drain_once().await.unwrap();
    assert_eq!(h.remote.get(&key).unwrap().data, json!({ "name": "Edited" }));
    assert!(
        h.remote
            .writes()
            .contains(&RemoteCall::Create(key.clone()))
    );
}

#[tokio::test]
async fn conflict_bus_announces_raise_and_resolve() {
    let h = harness().await;
    let mut events = h.sync.conflict_bus().subscribe();

    let conflict = diverge(
        &h,
        json!({ "name": "Local Name", "status": "open" }),
        json!({ "name": "Remote Name", "status": "open" }),
    )
    .await;
    h.sync
        .resolve(conflict.id, ResolutionStrategy::Local)
        .await
        .unwrap();

    assert_eq!(events.recv().await.unwrap(), ConflictEvent::Raised(conflict.clone()));
    assert_eq!(
        events.recv().await.unwrap(),
        ConflictEvent::Resolved {
            conflict_id: conflict.id,
            entity: conflict.entity.clone(),
            strategy: ResolutionStrategy::Local,
        }
    );
}

#[tokio::test]
async fn on_conflict_callback_receives_conflicts() {
    let h = harness().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let listener = h.sync.conflict_bus().on_conflict(move |conflict| {
        let _ = tx.send(conflict.entity.entity_id);
    });

    diverge(
        &h,
        json!({ "name": "Local Name", "status": "open" }),
        json!({ "name": "Remote Name", "status": "open" }),
    )
    .await;

    assert_eq!(rx.recv().await.unwrap(), "project-1");
    listener.abort();
}

// ── Status and run loop ─────────────────────────────────────────

#[tokio::test]
async fn status_changes_are_published() {
    let h = harness().await;
    let mut status = h.sync.subscribe_status();
    status.borrow_and_update();

    h.sync.local_create(project("p1"), json!({})).await.unwrap();
    assert!(status.has_changed().unwrap());
    assert_eq!(status.borrow_and_update().pending_operations, 1);

    h.network.set_offline();
    h.sync.drain_once().await.unwrap();
    assert_eq!(status.borrow_and_update().status, SyncStatus::Offline);
}

#[tokio::test]
async fn network_monitor_notifies_listeners() {
    let network = NetworkMonitor::default();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let listener = network.on_status_change(move |c| {
        let _ = tx.send(c);
    });

    network.set_offline();
    assert_eq!(rx.recv().await.unwrap(), tether_sync::Connectivity::Offline);
    network.set_online();
    assert_eq!(rx.recv().await.unwrap(), tether_sync::Connectivity::Online);
    listener.abort();
}

#[tokio::test]
async fn run_loop_drains_when_connectivity_returns() {
    let h = harness_with(config(), NetworkMonitor::new(tether_sync::Connectivity::Offline)).await;
    let key = project("p1");
    h.sync.local_create(key.clone(), json!({ "name": "a" })).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let driver = async {
        h.network.set_online();
        for _ in 0..200 {
            if h.remote.get(&key).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.remote.get(&key).is_some());

        // Work queued while running is picked up without a timer tick.
        h.sync.local_create(project("p2"), json!({})).await.unwrap();
        for _ in 0..200 {
            if h.remote.get(&project("p2")).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.remote.get(&project("p2")).is_some());
        shutdown_tx.send(true).unwrap();
    };

    tokio::join!(h.sync.run(shutdown_rx), driver);
    assert_eq!(h.sync.status().status_text(), "All changes synced");
}
