//! Run state owned by the orchestrator and its durable snapshot.
//!
//! [`SystemState`] is the single record of a run: the task graph, the
//! worker arena, the phase and the error log. It is rewritten to disk by
//! [`StateStore`] after every state-changing event.

mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::{TaskId, TaskStatus};
use crate::core::worker::WorkerId;
use crate::core::TaskGraph;
use crate::error::{Error, ErrorKind, Result};
use crate::orchestration::pool::WorkerPool;
use crate::{mlog, mlog_debug};

pub use store::StateStore;

/// Snapshot format version.
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Running => "running",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Event counters, for the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    /// Tasks returned to pending after a worker went away.
    pub requeued: u64,
    pub cancelled: u64,
    pub workers_registered: u64,
    pub workers_retired: u64,
    /// Reports dropped by the task/generation check.
    pub late_reports: u64,
    pub conflicts_auto: u64,
    pub conflicts_assisted: u64,
    pub conflicts_manual: u64,
}

/// One error surfaced in the final report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedError {
    pub task_id: Option<TaskId>,
    pub worker: Option<WorkerId>,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub run_id: Uuid,
    pub phase: RunPhase,
    #[serde(rename = "tasks")]
    pub graph: TaskGraph,
    #[serde(rename = "workers", default)]
    pub pool: WorkerPool,
    /// Branch tasks start from and are integrated into.
    #[serde(default)]
    pub base_branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub errors: Vec<ReportedError>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl SystemState {
    /// A fresh idle run over `graph`.
    pub fn new(graph: TaskGraph) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            run_id: Uuid::new_v4(),
            phase: RunPhase::Idle,
            graph,
            pool: WorkerPool::new(),
            base_branch: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
            counters: Counters::default(),
            errors: Vec::new(),
        }
    }

    pub fn with_base_branch(mut self, base: &str) -> Self {
        self.base_branch = Some(base.to_string());
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn set_phase(&mut self, phase: RunPhase) {
        mlog_debug!("SystemState: phase {} -> {}", self.phase, phase);
        self.phase = phase;
        let now = Utc::now();
        match phase {
            RunPhase::Running => self.started_at = Some(now),
            RunPhase::Completed | RunPhase::Failed => self.finished_at = Some(now),
            RunPhase::Idle => {}
        }
        self.updated_at = now;
    }

    /// Append to the error log.
    pub fn record_error(&mut self, task_id: Option<&TaskId>, worker: Option<WorkerId>, err: &Error) {
        self.push_error(task_id, worker, err.kind(), err.to_string());
    }

    pub fn push_error(
        &mut self,
        task_id: Option<&TaskId>,
        worker: Option<WorkerId>,
        kind: ErrorKind,
        message: String,
    ) {
        self.errors.push(ReportedError {
            task_id: task_id.cloned(),
            worker,
            kind,
            message,
            at: Utc::now(),
        });
        self.touch();
    }

    /// Prepare a reloaded snapshot for a new coordinator.
    ///
    /// Running tasks go back to pending and every worker slot is dropped;
    /// workers must register again. Returns the requeued task ids.
    ///
    /// # Errors
    /// Returns `Error::Validation` if the snapshot's graph no longer
    /// validates.
    pub fn recover(&mut self) -> Result<Vec<TaskId>> {
        self.graph.validate()?;

        let running: Vec<TaskId> = self
            .graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .collect();
        for id in &running {
            self.graph.requeue(id)?;
        }
        self.counters.requeued += running.len() as u64;

        let dropped = self.pool.len();
        self.pool = WorkerPool::new();
        self.phase = RunPhase::Idle;
        self.finished_at = None;
        self.touch();

        mlog!(
            "Recovered run {}: {} task(s) requeued, {} worker slot(s) dropped",
            self.run_id,
            running.len(),
            dropped
        );
        Ok(running)
    }
}
