//! Dispatch ordering for ready tasks.
//!
//! The Scheduler decides which ready task goes to the next idle worker. It is
//! stateless: every answer is a pure function of the graph snapshot and the
//! configured policy, so the Orchestrator can call it on every dispatch cycle
//! without keeping it in sync.

use crate::core::graph::TaskGraph;
use crate::core::task::{Task, TaskId};
use serde::{Deserialize, Serialize};

/// Ordering policy for ready tasks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum SchedulePolicy {
    /// Ascending priority, ties broken by insertion order.
    #[default]
    #[value(name = "priority")]
    #[serde(rename = "priority")]
    PriorityFirst,
    /// Tasks that would make the most pending tasks ready go first.
    #[value(name = "unlock")]
    #[serde(rename = "unlock")]
    UnlockFirst,
}

impl std::fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulePolicy::PriorityFirst => write!(f, "priority"),
            SchedulePolicy::UnlockFirst => write!(f, "unlock"),
        }
    }
}

/// Orders ready tasks under a [`SchedulePolicy`].
///
/// # Example
///
/// ```ignore
/// use maestro::core::TaskGraph;
/// use maestro::orchestration::{SchedulePolicy, Scheduler};
///
/// let scheduler = Scheduler::new(SchedulePolicy::PriorityFirst);
/// let next = scheduler.parallel_tasks(&graph, 2);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler {
    policy: SchedulePolicy,
}

impl Scheduler {
    pub fn new(policy: SchedulePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    /// Order `ready` for dispatch.
    ///
    /// `ready` is expected in insertion order, as returned by
    /// [`TaskGraph::get_ready_tasks`]; the sort is stable so that order
    /// breaks every remaining tie.
    pub fn schedule<'a>(&self, graph: &TaskGraph, ready: Vec<&'a Task>) -> Vec<&'a Task> {
        let mut keyed: Vec<(usize, &'a Task)> = match self.policy {
            SchedulePolicy::PriorityFirst => ready.into_iter().map(|t| (0, t)).collect(),
            SchedulePolicy::UnlockFirst => ready
                .into_iter()
                .map(|t| (graph.unlock_count(&t.id), t))
                .collect(),
        };

        // Higher unlock count first, then lower priority value.
        keyed.sort_by(|(ua, a), (ub, b)| ub.cmp(ua).then(a.priority.cmp(&b.priority)));
        keyed.into_iter().map(|(_, t)| t).collect()
    }

    /// The first `n` task ids in dispatch order.
    pub fn parallel_tasks(&self, graph: &TaskGraph, n: usize) -> Vec<TaskId> {
        self.schedule(graph, graph.get_ready_tasks())
            .into_iter()
            .take(n)
            .map(|t| t.id.clone())
            .collect()
    }
}
