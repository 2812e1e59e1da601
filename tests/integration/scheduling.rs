//! Scheduling scenarios: ready waves, dispatch policies and cycles.
//!
//! These drive the graph and scheduler directly, the same way the
//! orchestrator does on each dispatch cycle.

use super::fixtures::{chain, diamond};

use maestro::core::task::parse_task_file;
use maestro::core::{Task, TaskGraph, TaskId, TaskStatus, WorkerId};
use maestro::orchestration::{SchedulePolicy, Scheduler};
use maestro::ErrorKind;

fn ids(tasks: Vec<&Task>) -> Vec<String> {
    tasks.iter().map(|t| t.id.to_string()).collect()
}

fn run_and_complete(graph: &mut TaskGraph, id: &str) {
    let id = TaskId::from(id);
    graph.mark_running(&id, WorkerId(1)).unwrap();
    graph.mark_completed(&id).unwrap();
}

// ========== Ready Wave Tests ==========

/// Test: a diamond becomes ready in three waves
///
/// Given: tasks 1 -> {2, 3} -> 4
/// When: each wave is completed in turn
/// Then: 2 and 3 become ready together and 4 only after both
#[test]
fn test_diamond_ready_waves() {
    let mut graph = TaskGraph::load(diamond()).unwrap();

    assert_eq!(ids(graph.get_ready_tasks()), vec!["1"]);
    assert_eq!(graph.promote_ready(), vec![TaskId::from("1")]);
    assert_eq!(graph.get_task(&"1".into()).unwrap().status, TaskStatus::Ready);

    run_and_complete(&mut graph, "1");
    assert_eq!(ids(graph.get_ready_tasks()), vec!["2", "3"]);

    run_and_complete(&mut graph, "2");
    assert_eq!(ids(graph.get_ready_tasks()), vec!["3"]);

    run_and_complete(&mut graph, "3");
    assert_eq!(ids(graph.get_ready_tasks()), vec!["4"]);

    run_and_complete(&mut graph, "4");
    assert!(graph.get_ready_tasks().is_empty());
    assert!(graph.is_settled());
}

/// Test: running a task whose dependency is not completed is rejected
#[test]
fn test_cannot_run_ahead_of_dependencies() {
    let mut graph = TaskGraph::load(chain()).unwrap();
    let err = graph.mark_running(&"b".into(), WorkerId(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(graph.get_task(&"b".into()).unwrap().status, TaskStatus::Pending);
}

// ========== Policy Tests ==========

/// Test: the two policies disagree on a fan-out graph
///
/// Given: `hub` unlocks three tasks but has the worst priority,
///        `leaf` unlocks nothing but has the best
/// When: one worker is free
/// Then: priority picks `leaf`, unlock picks `hub`
#[test]
fn test_unlock_policy_prefers_fan_out() {
    let mut tasks = vec![
        Task::new("hub", "hub").with_priority(50),
        Task::new("leaf", "leaf").with_priority(1),
    ];
    for i in 0..3 {
        tasks.push(Task::new(format!("spoke-{}", i).as_str(), "spoke").with_dependencies(["hub"]));
    }
    let graph = TaskGraph::load(tasks).unwrap();

    let priority = Scheduler::new(SchedulePolicy::PriorityFirst);
    let unlock = Scheduler::new(SchedulePolicy::UnlockFirst);

    assert_eq!(priority.parallel_tasks(&graph, 1), vec![TaskId::from("leaf")]);
    assert_eq!(unlock.parallel_tasks(&graph, 1), vec![TaskId::from("hub")]);
    assert_eq!(graph.unlock_count(&"hub".into()), 3);
}

/// Test: equal priorities keep file order
#[test]
fn test_ties_keep_insertion_order() {
    let graph = TaskGraph::load(vec![
        Task::new("c", "c"),
        Task::new("a", "a"),
        Task::new("b", "b"),
    ])
    .unwrap();
    let scheduler = Scheduler::new(SchedulePolicy::PriorityFirst);
    assert_eq!(
        scheduler.parallel_tasks(&graph, 3),
        vec![TaskId::from("c"), TaskId::from("a"), TaskId::from("b")]
    );
    assert_eq!(scheduler.parallel_tasks(&graph, 10).len(), 3);
}

// ========== Cycle Tests ==========

/// Test: cyclic tasks are never offered for dispatch
///
/// Given: a graph built without validation containing x <-> y and a free task z
/// When: ready tasks are queried
/// Then: only z is ready and the cycle is detected
#[test]
fn test_cycle_never_becomes_ready() {
    let mut graph = TaskGraph::new();
    graph
        .add_tasks(vec![
            Task::new("x", "x").with_dependencies(["y"]),
            Task::new("y", "y").with_dependencies(["x"]),
            Task::new("z", "z"),
        ])
        .unwrap();

    assert!(graph.has_cycle());
    assert!(graph.validate().is_err());
    assert!(graph.topological_sort().is_err());
    assert_eq!(ids(graph.get_ready_tasks()), vec!["z"]);
}

#[test]
fn test_load_rejects_cycle() {
    let result = TaskGraph::load(vec![
        Task::new("a", "a").with_dependencies(["c"]),
        Task::new("b", "b").with_dependencies(["a"]),
        Task::new("c", "c").with_dependencies(["b"]),
    ]);
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("cycle"));
}

/// Test: topological order puts every dependency before its dependents
#[test]
fn test_topological_order_respects_edges() {
    let graph = TaskGraph::load(diamond()).unwrap();
    let order: Vec<String> = ids(graph.topological_sort().unwrap());
    let pos = |id: &str| order.iter().position(|x| x == id).unwrap();

    assert_eq!(order.len(), 4);
    assert!(pos("1") < pos("2"));
    assert!(pos("1") < pos("3"));
    assert!(pos("2") < pos("4"));
    assert!(pos("3") < pos("4"));
}

// ========== Task File Tests ==========

/// Test: a task file loads into a runnable graph
///
/// Given: a JSON document in dependency-reversed order
/// When: parsed and loaded
/// Then: edges resolve regardless of order and defaults apply
#[test]
fn test_task_file_into_graph() {
    let content = r#"[
        {"id": "deploy", "title": "Deploy", "dependencies": ["build", "test"]},
        {"id": "test", "title": "Run tests", "dependencies": ["build"], "timeout_secs": 120},
        {"id": "build", "title": "Build", "description": "cargo build", "priority": 1}
    ]"#;

    let graph = TaskGraph::load(parse_task_file(content).unwrap()).unwrap();
    assert_eq!(graph.task_count(), 3);
    assert_eq!(ids(graph.get_ready_tasks()), vec!["build"]);

    let build = graph.get_task(&"build".into()).unwrap();
    assert_eq!(build.priority, 1);
    assert_eq!(build.description, "cargo build");
    assert_eq!(
        graph.get_task(&"test".into()).unwrap().timeout_secs,
        Some(120)
    );
    assert_eq!(graph.dependents(&"build".into()).len(), 2);
}

#[test]
fn test_task_file_unknown_dependency() {
    let content = r#"[{"id": "a", "title": "A", "dependencies": ["ghost"]}]"#;
    let tasks = parse_task_file(content).unwrap();
    let err = TaskGraph::load(tasks).unwrap_err();
    assert!(err.to_string().contains("unknown task ghost"));
}

/// Test: ids that only differ in punctuation cannot share a worktree
///
/// Given: tasks `api.v1` and `api-v1`, both mapping to branch `maestro/api-v1`
/// When: the task file is loaded
/// Then: loading fails before any workspace is created
#[test]
fn test_task_file_rejects_workspace_collision() {
    let content = r#"[
        {"id": "api.v1", "title": "Old API"},
        {"id": "api-v1", "title": "New API"}
    ]"#;
    let tasks = parse_task_file(content).unwrap();
    assert_eq!(TaskId::from("api.v1").slug(), TaskId::from("api-v1").slug());

    let err = TaskGraph::load(tasks).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("api.v1"));
    assert!(err.to_string().contains("api-v1"));
}
