//! Orchestrator scenarios.
//!
//! Workers are in-memory links driven by the test; each `step` handles one
//! event. Time-based scenarios run on a paused clock so deadlines fire
//! without waiting.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use super::fixtures::*;

use maestro::agent::CodingAgent;
use maestro::channel::transport::serve_unix;
use maestro::channel::{CommunicationChannel, CoordinatorCommand, OperatorRequest};
use maestro::core::{TaskGraph, TaskId, TaskStatus, WorkerStatus};
use maestro::orchestration::{
    ConflictGate, ConflictRules, Orchestrator, OrchestratorConfig, Step, StopMode,
};
use maestro::provision::InProcessProvisioner;
use maestro::state::{RunPhase, StateStore, SystemState};
use maestro::ErrorKind;

fn error_kind(h: &Harness, id: &str) -> ErrorKind {
    h.orch
        .state()
        .graph
        .get_task(&TaskId::from(id))
        .and_then(|t| t.error.as_ref())
        .map(|e| e.kind)
        .expect("task has no error")
}

fn error_message(h: &Harness, id: &str) -> String {
    h.orch
        .state()
        .graph
        .get_task(&TaskId::from(id))
        .and_then(|t| t.error.as_ref())
        .map(|e| e.message.clone())
        .expect("task has no error")
}

fn worker(h: &Harness, name: &str) -> maestro::core::Worker {
    h.orch
        .state()
        .pool
        .workers()
        .find(|w| w.name == name)
        .cloned()
        .expect("unknown worker")
}

fn is_terminate(command: Option<CoordinatorCommand>) -> bool {
    matches!(command, Some(CoordinatorCommand::WorkerTerminate { .. }))
}

// ========== Dispatch Tests ==========

/// Test: a diamond runs to completion on two workers
///
/// Given: tasks 1 -> {2, 3} -> 4 and two registered workers
/// When: every assignment is reported complete
/// Then: 2 and 3 run in parallel, branches integrate in dependency order
///       and the run completes
#[tokio::test]
async fn test_diamond_completes_on_two_workers() {
    let mut h = harness(diamond(), config(2));
    h.orch.start().await.unwrap();
    let mut first = h.register("worker-1").await;
    let mut second = h.register("worker-2").await;

    let one = assignment(&mut first);
    assert_eq!(one.id, TaskId::from("1"));
    assert!(second.try_recv().is_none());
    assert_eq!(h.report(&first, completed(&one)).await, Step::Continue);

    // Both middle tasks go out at once.
    let two = assignment(&mut first);
    let three = assignment(&mut second);
    assert_eq!(two.id, TaskId::from("2"));
    assert_eq!(three.id, TaskId::from("3"));
    assert_eq!(h.status("2"), TaskStatus::Running);
    assert_eq!(h.status("3"), TaskStatus::Running);
    assert_eq!(h.status("4"), TaskStatus::Pending);

    assert_eq!(h.report(&first, completed(&two)).await, Step::Continue);
    assert!(first.try_recv().is_none());
    assert_eq!(h.report(&second, completed(&three)).await, Step::Continue);

    let four = assignment(&mut first);
    assert_eq!(four.id, TaskId::from("4"));
    assert_eq!(
        h.report(&first, completed(&four)).await,
        Step::Finished(RunPhase::Completed)
    );

    assert_eq!(
        h.isolation.integrated(),
        vec!["maestro/1", "maestro/2", "maestro/3", "maestro/4"]
    );
    let counters = &h.orch.state().counters;
    assert_eq!(counters.dispatched, 4);
    assert_eq!(counters.completed, 4);
    assert_eq!(counters.workers_registered, 2);
    assert!(is_terminate(first.try_recv()));
    assert!(is_terminate(second.try_recv()));
    assert_eq!(worker(&h, "worker-1").completed, 3);
}

/// Test: progress reports are recorded on the running task
#[tokio::test]
async fn test_progress_is_recorded() {
    let mut h = harness(independent(&["a"]), config(1));
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;
    let task = assignment(&mut link);

    let progress = maestro::channel::WorkerMessage::TaskProgress {
        task_id: task.id.clone(),
        generation: task.generation,
        percent: 250,
        message: "tool: Edit".to_string(),
    };
    assert_eq!(h.report(&link, progress).await, Step::Continue);

    let recorded = h
        .orch
        .state()
        .graph
        .get_task(&"a".into())
        .and_then(|t| t.progress.clone())
        .unwrap();
    assert_eq!(recorded.percent, 100);
    assert_eq!(recorded.message, "tool: Edit");
}

// ========== Timeout Tests ==========

/// Test: an overdue task is cancelled and failed, and its late report is
/// discarded
///
/// Given: a 10s task deadline and tasks a, b on one worker
/// When: a runs past its deadline and then reports completion
/// Then: the worker gets task_cancel for a and then b, a fails with
///       WorkerTimeoutError, and the stale report only bumps the late counter
#[tokio::test(start_paused = true)]
async fn test_task_timeout_cancels_and_moves_on() {
    let config = OrchestratorConfig {
        workers: 1,
        task_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    let mut h = harness(independent(&["a", "b"]), config);
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;
    let a = assignment(&mut link);
    assert_eq!(a.id, TaskId::from("a"));

    assert_eq!(h.orch.step().await.unwrap(), Step::Continue);

    assert_eq!(
        link.try_recv(),
        Some(CoordinatorCommand::TaskCancel {
            task_id: "a".into(),
            generation: 1
        })
    );
    let b = assignment(&mut link);
    assert_eq!(b.id, TaskId::from("b"));
    assert_eq!(h.status("a"), TaskStatus::Failed);
    assert_eq!(error_kind(&h, "a"), ErrorKind::WorkerTimeout);
    assert_eq!(worker(&h, "worker-1").consecutive_failures, 1);

    assert_eq!(h.report(&link, completed(&a)).await, Step::Continue);
    assert_eq!(h.orch.state().counters.late_reports, 1);
    assert_eq!(h.status("a"), TaskStatus::Failed);

    // A run whose tasks all reached a terminal state completes, failures included.
    assert_eq!(
        h.report(&link, completed(&b)).await,
        Step::Finished(RunPhase::Completed)
    );
}

/// Test: a task's own timeout overrides the run default
#[tokio::test(start_paused = true)]
async fn test_per_task_timeout_wins() {
    let tasks = vec![maestro::core::Task::new("slow", "slow").with_timeout_secs(5)];
    let mut h = harness(tasks, config(1));
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;
    let _ = assignment(&mut link);

    let before = tokio::time::Instant::now();
    assert_eq!(
        h.orch.step().await.unwrap(),
        Step::Finished(RunPhase::Completed)
    );
    let waited = before.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
    assert_eq!(h.status("slow"), TaskStatus::Failed);
}

// ========== Liveness Tests ==========

/// Test: a silent worker goes offline and its task is requeued
///
/// Given: one worker holding task a and no heartbeats
/// When: 90 seconds pass
/// Then: the worker is offline, its connection is dropped, a waits for a
///       new worker, and a replacement is provisioned
#[tokio::test(start_paused = true)]
async fn test_missed_heartbeats_requeue_task() {
    let mut h = harness(independent(&["a"]), config(1));
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;
    let a = assignment(&mut link);

    let before = tokio::time::Instant::now();
    assert_eq!(h.orch.step().await.unwrap(), Step::Continue);
    let waited = before.elapsed();
    assert!(waited >= Duration::from_secs(90) && waited < Duration::from_secs(91));

    assert_eq!(worker(&h, "worker-1").status, WorkerStatus::Offline);
    assert_eq!(h.status("a"), TaskStatus::Ready);
    let task = h.orch.state().graph.get_task(&"a".into()).unwrap();
    assert_eq!(task.attempts, 1);
    assert!(task.assigned_worker.is_none());
    assert!(link.recv().await.is_none());
    assert_eq!(h.orch.state().counters.requeued, 1);
    assert_eq!(
        h.provisions(),
        vec!["provision worker-1", "release worker-1", "provision worker-2"]
    );

    // The replacement picks the task up under a new generation.
    let mut replacement = h.register("worker-2").await;
    let again = assignment(&mut replacement);
    assert_eq!(again.id, a.id);
    assert_eq!(again.generation, 2);
}

/// Test: heartbeats keep a worker alive past the expiry window
#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_worker_alive() {
    let mut h = harness(independent(&["a"]), config(1));
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;
    let a = assignment(&mut link);

    for _ in 0..4 {
        tokio::time::advance(Duration::from_secs(30)).await;
        let step = h
            .report(&link, maestro::channel::WorkerMessage::Heartbeat)
            .await;
        assert_eq!(step, Step::Continue);
    }
    assert_eq!(worker(&h, "worker-1").status, WorkerStatus::Busy);
    assert_eq!(
        h.report(&link, completed(&a)).await,
        Step::Finished(RunPhase::Completed)
    );
}

/// Test: with no worker ever registering, the run fails instead of hanging
#[tokio::test(start_paused = true)]
async fn test_starvation_fails_run() {
    let mut h = harness(independent(&["a"]), config(1));
    h.orch.start().await.unwrap();
    assert!(h.orch.next_deadline().is_some());

    assert_eq!(
        h.orch.step().await.unwrap(),
        Step::Finished(RunPhase::Failed)
    );
    assert_eq!(h.status("a"), TaskStatus::Cancelled);
    assert_eq!(error_kind(&h, "a"), ErrorKind::Deadlock);
    assert!(h
        .orch
        .state()
        .errors
        .iter()
        .any(|e| e.kind == ErrorKind::Deadlock));
    assert_eq!(h.provisions(), vec!["provision worker-1", "release worker-1"]);
}

/// Test: re-registering under the same name replaces the old slot
///
/// Given: worker-1 holding task a
/// When: a second connection registers as worker-1
/// Then: a is requeued to the new slot under generation 2, and reports on
///       the old connection are ignored
#[tokio::test]
async fn test_reconnect_replaces_slot() {
    let mut h = harness(independent(&["a"]), config(1));
    h.orch.start().await.unwrap();
    let mut old = h.register("worker-1").await;
    let first = assignment(&mut old);
    assert_eq!(first.generation, 1);

    let mut new = h.register("worker-1").await;
    let second = assignment(&mut new);
    assert_eq!(second.id, first.id);
    assert_eq!(second.generation, 2);
    assert_eq!(h.orch.state().pool.len(), 1);
    assert_eq!(h.orch.state().counters.requeued, 1);
    assert!(old.recv().await.is_none());

    assert_eq!(h.report(&old, completed(&first)).await, Step::Continue);
    assert_eq!(h.status("a"), TaskStatus::Running);

    assert_eq!(
        h.report(&new, completed(&second)).await,
        Step::Finished(RunPhase::Completed)
    );
    assert_eq!(
        h.orch.state().graph.get_task(&"a".into()).unwrap().attempts,
        2
    );
}

/// Test: a dropped connection requeues immediately, without waiting for
/// heartbeat expiry
#[tokio::test]
async fn test_disconnect_requeues_task() {
    let mut h = harness(independent(&["a"]), config(1));
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;
    let _ = assignment(&mut link);

    drop(link);
    assert_eq!(h.orch.step().await.unwrap(), Step::Continue);
    assert_eq!(h.status("a"), TaskStatus::Ready);
    assert_eq!(worker(&h, "worker-1").status, WorkerStatus::Offline);
    assert!(h
        .orch
        .state()
        .errors
        .iter()
        .any(|e| e.kind == ErrorKind::WorkerTimeout));
}

// ========== Failure Tests ==========

/// Test: a rejected merge fails the task but not the worker
///
/// Given: task a whose branch conflicts on a manual-only path
/// When: a is reported complete
/// Then: a fails with ConflictUnresolvedError, nothing is integrated, the
///       worker keeps a clean record and moves on to b
#[tokio::test]
async fn test_gate_rejection_fails_task_only() {
    let state = SystemState::new(TaskGraph::load(independent(&["a", "b"])).unwrap())
        .with_base_branch("main");
    let isolation = FakeIsolation::new().with_conflicts(&[".gitmodules"]);
    let agent = Arc::new(CountingAgent::new());
    let mut h = harness_with(state, config(1), isolation, agent.clone());
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;

    let a = assignment(&mut link);
    assert_eq!(h.report(&link, completed(&a)).await, Step::Continue);

    assert_eq!(h.status("a"), TaskStatus::Failed);
    assert_eq!(error_kind(&h, "a"), ErrorKind::ConflictUnresolved);
    assert!(h.isolation.integrated().is_empty());
    assert_eq!(agent.calls(), 0);
    assert_eq!(h.orch.state().counters.conflicts_manual, 1);
    let w = worker(&h, "worker-1");
    assert_eq!(w.consecutive_failures, 0);
    assert_eq!(w.failed, 0);

    let b = assignment(&mut link);
    assert_eq!(b.id, TaskId::from("b"));
    assert_eq!(
        h.report(&link, completed(&b)).await,
        Step::Finished(RunPhase::Completed)
    );
    assert_eq!(h.isolation.integrated(), vec!["maestro/b"]);
}

/// Test: a worker that keeps failing is retired and replaced
///
/// Given: retirement after 2 consecutive failures and tasks a, b, c
/// When: worker-1 fails a and b
/// Then: worker-1 is terminated and retired, worker-2 is provisioned and
///       finishes c
#[tokio::test]
async fn test_failing_worker_is_retired() {
    let mut config = config(1);
    config.health.retire_after_failures = 2;
    let mut h = harness(independent(&["a", "b", "c"]), config);
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;

    let a = assignment(&mut link);
    assert_eq!(h.report(&link, failed(&a, "tests failed")).await, Step::Continue);
    assert_eq!(error_kind(&h, "a"), ErrorKind::Agent);
    assert_eq!(error_message(&h, "a"), "Coding agent error: tests failed");

    let b = assignment(&mut link);
    assert_eq!(h.report(&link, failed(&b, "build broke")).await, Step::Continue);
    assert!(is_terminate(link.try_recv()));

    assert_eq!(worker(&h, "worker-1").status, WorkerStatus::Error);
    assert_eq!(h.orch.state().counters.workers_retired, 1);
    assert_eq!(
        h.provisions(),
        vec!["provision worker-1", "release worker-1", "provision worker-2"]
    );
    assert_eq!(h.status("c"), TaskStatus::Ready);

    let mut replacement = h.register("worker-2").await;
    let c = assignment(&mut replacement);
    assert_eq!(c.id, TaskId::from("c"));
    assert_eq!(
        h.report(&replacement, completed(&c)).await,
        Step::Finished(RunPhase::Completed)
    );
    assert_eq!(h.orch.state().graph.count(TaskStatus::Failed), 2);
}

/// Test: dependents of a failed task are cancelled and the run fails
///
/// Given: a -> b -> c
/// When: a fails
/// Then: b and c are cancelled with the dependency that blocks them
#[tokio::test]
async fn test_failed_dependency_cancels_chain() {
    let mut h = harness(chain(), config(1));
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;

    let a = assignment(&mut link);
    assert_eq!(
        h.report(&link, failed(&a, "does not compile")).await,
        Step::Finished(RunPhase::Failed)
    );

    assert_eq!(h.status("a"), TaskStatus::Failed);
    assert_eq!(h.status("b"), TaskStatus::Cancelled);
    assert_eq!(h.status("c"), TaskStatus::Cancelled);
    assert_eq!(error_kind(&h, "b"), ErrorKind::Deadlock);
    assert_eq!(error_message(&h, "b"), "blocked by failed dependency a");
    assert_eq!(error_message(&h, "c"), "blocked by cancelled dependency b");
    assert!(is_terminate(link.try_recv()));
}

// ========== Stop Tests ==========

/// Test: a graceful stop lets running work finish and cancels the rest
///
/// Given: one worker running a with b waiting
/// When: a graceful stop is requested
/// Then: b is cancelled at once, a late registration is turned away, a
///       still integrates and the run ends failed
#[tokio::test]
async fn test_graceful_stop() {
    let mut h = harness(independent(&["a", "b"]), config(1));
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;
    let a = assignment(&mut link);

    h.orch.connector().request(OperatorRequest::Stop { force: false });
    assert_eq!(h.orch.step().await.unwrap(), Step::Continue);
    assert_eq!(h.orch.stopping(), Some(StopMode::Graceful));
    assert_eq!(h.status("b"), TaskStatus::Cancelled);
    assert_eq!(error_kind(&h, "b"), ErrorKind::Cancelled);
    assert_eq!(h.status("a"), TaskStatus::Running);

    let mut late = h.register("worker-9").await;
    assert!(is_terminate(late.try_recv()));

    assert_eq!(
        h.report(&link, completed(&a)).await,
        Step::Finished(RunPhase::Failed)
    );
    assert_eq!(h.status("a"), TaskStatus::Completed);
    assert_eq!(h.isolation.integrated(), vec!["maestro/a"]);
}

/// Test: a forced stop cancels running tasks on their workers
#[tokio::test]
async fn test_force_stop() {
    let mut h = harness(independent(&["a"]), config(1));
    h.orch.start().await.unwrap();
    let mut link = h.register("worker-1").await;
    let _ = assignment(&mut link);

    h.orch.connector().request(OperatorRequest::Stop { force: true });
    assert_eq!(
        h.orch.step().await.unwrap(),
        Step::Finished(RunPhase::Failed)
    );
    assert_eq!(
        link.try_recv(),
        Some(CoordinatorCommand::TaskCancel {
            task_id: "a".into(),
            generation: 1
        })
    );
    assert!(is_terminate(link.try_recv()));
    assert_eq!(h.status("a"), TaskStatus::Cancelled);
    assert_eq!(h.orch.state().counters.cancelled, 1);
    assert!(h.isolation.integrated().is_empty());
}

/// Test: stepping a finished run reports the terminal phase
#[tokio::test]
async fn test_step_after_finish() {
    let mut h = harness(independent(&["a"]), config(1));
    h.orch.start().await.unwrap();
    h.orch.connector().request(OperatorRequest::Stop { force: true });
    assert_eq!(
        h.orch.step().await.unwrap(),
        Step::Finished(RunPhase::Failed)
    );
    assert_eq!(
        h.orch.step().await.unwrap(),
        Step::Finished(RunPhase::Failed)
    );
}

// ========== Persistence Tests ==========

/// Test: every transition is flushed to the snapshot
#[tokio::test]
async fn test_state_is_persisted() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(&dir.path().join("state.json"));
    let mut h = harness(independent(&["a"]), config(1));
    h.orch = h.orch.with_store(store.clone());

    h.orch.start().await.unwrap();
    let saved = store.load().unwrap().unwrap();
    assert_eq!(saved.phase, RunPhase::Running);
    assert_eq!(saved.run_id, h.orch.state().run_id);

    let mut link = h.register("worker-1").await;
    let a = assignment(&mut link);
    let saved = store.load().unwrap().unwrap();
    assert_eq!(saved.graph.get_task(&"a".into()).unwrap().status, TaskStatus::Running);
    assert_eq!(saved.pool.len(), 1);

    assert_eq!(
        h.report(&link, completed(&a)).await,
        Step::Finished(RunPhase::Completed)
    );
    let saved = store.load().unwrap().unwrap();
    assert_eq!(saved.phase, RunPhase::Completed);
    assert_eq!(saved.counters.completed, 1);
    assert!(saved.finished_at.is_some());
}

// ========== Transport Tests ==========

async fn connect(path: &std::path::Path) -> UnixStream {
    for _ in 0..100 {
        if let Ok(stream) = UnixStream::connect(path).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {} never came up", path.display());
}

/// Test: a socket worker that sends garbage is dropped and its task requeued
///
/// Given: a worker registered over the Unix socket holding task a
/// When: it sends an undecodable frame
/// Then: the worker goes offline and a waits again
#[tokio::test]
async fn test_socket_worker_malformed_frame() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("maestro.sock");
    let mut h = harness(independent(&["a"]), config(1));
    h.orch.start().await.unwrap();

    let cancel = CancellationToken::new();
    let server = tokio::spawn({
        let (path, connector, cancel) = (path.clone(), h.orch.connector(), cancel.clone());
        async move { serve_unix(&path, connector, cancel).await }
    });

    let (read_half, mut write_half) = connect(&path).await.into_split();
    let mut lines = BufReader::new(read_half).lines();
    write_half
        .write_all(b"{\"type\":\"register\",\"name\":\"sock-1\"}\n")
        .await
        .unwrap();
    assert_eq!(h.orch.step().await.unwrap(), Step::Continue);

    let line = lines.next_line().await.unwrap().unwrap();
    assert!(line.contains("\"type\":\"task_assign\""));
    assert!(line.contains("\"generation\":1"));
    assert_eq!(h.status("a"), TaskStatus::Running);

    write_half.write_all(b"this is not json\n").await.unwrap();
    assert_eq!(h.orch.step().await.unwrap(), Step::Continue);

    assert_eq!(worker(&h, "sock-1").status, WorkerStatus::Offline);
    assert_eq!(h.status("a"), TaskStatus::Ready);
    assert!(h
        .orch
        .state()
        .errors
        .iter()
        .any(|e| e.kind == ErrorKind::Channel));

    cancel.cancel();
    tokio_test::assert_ok!(server.await.unwrap());
    assert!(!path.exists());
}

// ========== End-to-End Tests ==========

/// Test: in-process workers run a diamond against a real repository
///
/// Given: a git repository and a file-writing agent
/// When: the run is driven to completion with two in-process workers
/// Then: every task's file lands on main and no worktree is left behind
#[tokio::test]
async fn test_in_process_run_integrates_into_main() {
    let repo = TestRepo::new();
    let agent: Arc<dyn CodingAgent> = Arc::new(FileAgent);
    let channel = CommunicationChannel::new();
    let provisioner =
        InProcessProvisioner::new(channel.connector(), Arc::clone(&agent), Duration::from_secs(30));
    let state = SystemState::new(TaskGraph::load(diamond()).unwrap()).with_base_branch("main");

    let mut orch = Orchestrator::new(
        config(2),
        state,
        channel,
        Arc::new(repo.git()),
        ConflictGate::new(agent, ConflictRules::default()),
        Box::new(provisioner),
    );
    let phase = tokio::time::timeout(Duration::from_secs(60), orch.run(CancellationToken::new()))
        .await
        .expect("run did not finish")
        .unwrap();

    assert_eq!(phase, RunPhase::Completed);
    for file in ["schema.txt", "api.txt", "ui.txt", "docs.txt"] {
        assert!(repo.read_on("main", file).is_some(), "{} missing on main", file);
        assert!(repo.path.join(file).exists(), "{} not checked out", file);
    }
    assert_eq!(repo.read_on("main", "api.txt").unwrap(), "api");
    assert_eq!(orch.state().counters.completed, 4);
    assert_eq!(std::fs::read_dir(repo.worktrees.path()).unwrap().count(), 0);
}

/// Test: a workspace that cannot be created fails its task
#[tokio::test]
async fn test_unknown_base_branch_fails_task() {
    let repo = TestRepo::new();
    let agent: Arc<dyn CodingAgent> = Arc::new(FileAgent);
    let channel = CommunicationChannel::new();
    let provisioner =
        InProcessProvisioner::new(channel.connector(), Arc::clone(&agent), Duration::from_secs(30));
    let state = SystemState::new(TaskGraph::load(independent(&["a"])).unwrap())
        .with_base_branch("no-such-branch");

    let mut orch = Orchestrator::new(
        config(1),
        state,
        channel,
        Arc::new(repo.git()),
        ConflictGate::new(agent, ConflictRules::default()),
        Box::new(provisioner),
    );
    let phase = tokio::time::timeout(Duration::from_secs(60), orch.run(CancellationToken::new()))
        .await
        .expect("run did not finish")
        .unwrap();

    // Workspace creation fails, the task fails, nothing else can run.
    assert_eq!(phase, RunPhase::Completed);
    let task = orch.state().graph.get_task(&"a".into()).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_ref().unwrap().kind, ErrorKind::Internal);
}
