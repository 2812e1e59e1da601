//! Snapshot persistence and recovery tests.
//!
//! A coordinator that dies mid-run leaves its last snapshot behind. A new
//! coordinator loads it, returns in-flight tasks to pending, forgets the old
//! workers and carries on.

use std::sync::Arc;

use tempfile::TempDir;

use super::fixtures::*;

use maestro::core::{TaskId, TaskStatus};
use maestro::orchestration::Step;
use maestro::state::{RunPhase, StateStore, SystemState, STATE_VERSION};
use maestro::ErrorKind;

fn store(dir: &TempDir) -> StateStore {
    StateStore::new(&dir.path().join("state.json"))
}

/// Run a until it completes and b is in flight, then drop the coordinator.
async fn crash_mid_run(store: &StateStore) {
    let mut h = harness(independent(&["a", "b"]), config(1));
    h.orch = h.orch.with_store(store.clone());
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;

    let a = assignment(&mut link);
    assert_eq!(h.report(&link, completed(&a)).await, Step::Continue);
    let b = assignment(&mut link);
    assert_eq!(b.id, TaskId::from("b"));
}

// ========== Recovery Tests ==========

/// Test: a crashed run resumes from its snapshot
///
/// Given: a snapshot with a completed and b running on worker-1
/// When: the snapshot is loaded, recovered and run by a new coordinator
/// Then: b is redone under generation 2 and a is left alone
#[tokio::test]
async fn test_resume_after_crash() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    crash_mid_run(&store).await;

    let mut state = store.load().unwrap().expect("snapshot missing");
    assert_eq!(state.phase, RunPhase::Running);
    assert_eq!(state.graph.get_task(&"b".into()).unwrap().status, TaskStatus::Running);

    let requeued = state.recover().unwrap();
    assert_eq!(requeued, vec![TaskId::from("b")]);
    assert_eq!(state.phase, RunPhase::Idle);
    assert!(state.pool.is_empty());
    assert_eq!(state.graph.get_task(&"b".into()).unwrap().status, TaskStatus::Pending);
    assert_eq!(state.graph.get_task(&"a".into()).unwrap().status, TaskStatus::Completed);

    let run_id = state.run_id;
    let mut h = harness_with(
        state,
        config(1),
        FakeIsolation::new(),
        Arc::new(CountingAgent::new()),
    );
    h.orch = h.orch.with_store(store.clone());
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;

    let b = assignment(&mut link);
    assert_eq!(b.id, TaskId::from("b"));
    assert_eq!(b.generation, 2);
    assert_eq!(
        h.report(&link, completed(&b)).await,
        Step::Finished(RunPhase::Completed)
    );
    assert_eq!(h.isolation.integrated(), vec!["maestro/b"]);

    let finished = store.load().unwrap().unwrap();
    assert_eq!(finished.run_id, run_id);
    assert_eq!(finished.phase, RunPhase::Completed);
    assert_eq!(finished.counters.requeued, 1);
    assert_eq!(finished.graph.get_task(&"a".into()).unwrap().attempts, 1);
}

/// Test: a finished snapshot cannot be started again without recovery
#[tokio::test]
async fn test_terminal_snapshot_is_not_restarted() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    crash_mid_run(&store).await;

    let mut state = store.load().unwrap().unwrap();
    state.set_phase(RunPhase::Failed);
    let mut h = harness_with(
        state,
        config(1),
        FakeIsolation::new(),
        Arc::new(CountingAgent::new()),
    );
    let err = h.orch.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

// ========== Snapshot Format Tests ==========

/// Test: the snapshot on disk uses the documented top-level keys
#[tokio::test]
async fn test_snapshot_layout() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    crash_mid_run(&store).await;

    let raw = std::fs::read_to_string(store.path()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["version"], STATE_VERSION);
    assert_eq!(value["phase"], "running");
    assert_eq!(value["base_branch"], "main");
    assert_eq!(value["tasks"].as_array().unwrap().len(), 2);
    assert_eq!(value["workers"][0]["name"], "worker-1");
    assert_eq!(value["workers"][0]["status"], "busy");
    assert_eq!(value["counters"]["dispatched"], 2);
    assert!(!store.path().with_extension("json.tmp").exists());
}

#[test]
fn test_missing_snapshot_loads_as_none() {
    let dir = TempDir::new().unwrap();
    assert!(store(&dir).load().unwrap().is_none());
}

#[test]
fn test_newer_snapshot_version_rejected() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let mut state = SystemState::new(maestro::core::TaskGraph::load(independent(&["a"])).unwrap());
    state.version = STATE_VERSION + 1;
    store.save_sync(&state).unwrap();

    let err = store.load().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("newer"));
}

#[test]
fn test_corrupt_snapshot_is_an_error() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    std::fs::write(store.path(), "{ not json").unwrap();
    assert!(store.load().is_err());
}
