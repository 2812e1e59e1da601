//! Worker pool.
//!
//! The `WorkerPool` is an arena of worker slots keyed by [`WorkerId`]. It
//! tracks each worker's lifecycle, assignment and failure counters. It never
//! talks to the channel; the Orchestrator maps connections to slots and
//! decides what a status change means for the task graph.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::channel::ConnectionId;
use crate::core::task::TaskId;
use crate::core::worker::{Worker, WorkerId, WorkerStatus, Workspace};
use crate::error::{Error, Result};

/// Arena of worker slots in registration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Worker>", into = "Vec<Worker>")]
pub struct WorkerPool {
    /// Slots indexed by id. `BTreeMap` keeps registration order.
    workers: BTreeMap<WorkerId, Worker>,
    /// Next id to hand out. Ids are never reused.
    next_id: u64,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh idle slot for a registering worker.
    pub fn add_worker(&mut self, name: &str, connection: Option<ConnectionId>) -> WorkerId {
        self.next_id += 1;
        let id = WorkerId(self.next_id);
        self.workers.insert(id, Worker::new(id, name, connection));
        id
    }

    pub fn remove_worker(&mut self, id: WorkerId) -> Option<Worker> {
        self.workers.remove(&id)
    }

    pub fn get(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.get(&id)
    }

    fn slot(&mut self, id: WorkerId) -> Result<&mut Worker> {
        self.workers.get_mut(&id).ok_or(Error::WorkerNotFound(id))
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// First-registered idle worker, if any.
    pub fn get_idle_worker(&self) -> Option<WorkerId> {
        self.workers.values().find(|w| w.is_idle()).map(|w| w.id)
    }

    pub fn idle_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_idle()).count()
    }

    /// Workers that are idle or busy.
    pub fn live_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_live()).count()
    }

    pub fn find_by_connection(&self, conn: ConnectionId) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|w| w.connection == Some(conn))
            .map(|w| w.id)
    }

    /// Most recently registered slot with this name that is still live.
    pub fn find_by_name(&self, name: &str) -> Option<WorkerId> {
        self.workers
            .values()
            .rev()
            .find(|w| w.name == name && w.is_live())
            .map(|w| w.id)
    }

    /// Bind an idle worker to a task.
    ///
    /// # Errors
    /// `Error::Validation` if the worker is not idle.
    pub fn mark_busy(&mut self, id: WorkerId, task_id: TaskId, workspace: Workspace) -> Result<()> {
        let worker = self.slot(id)?;
        if !worker.is_idle() {
            return Err(Error::Validation(format!(
                "worker {} is {}, not idle",
                id, worker.status
            )));
        }
        worker.status = WorkerStatus::Busy;
        worker.current_task = Some(task_id);
        worker.workspace = Some(workspace);
        Ok(())
    }

    /// Release the worker's assignment and make it available again.
    ///
    /// Returns the task it held, if any. Offline and retired workers stay
    /// where they are.
    pub fn mark_idle(&mut self, id: WorkerId) -> Result<Option<TaskId>> {
        let worker = self.slot(id)?;
        let held = worker.current_task.take();
        worker.workspace = None;
        if worker.status == WorkerStatus::Busy {
            worker.status = WorkerStatus::Idle;
        }
        Ok(held)
    }

    /// Declare a worker unreachable. Returns the task it held.
    pub fn mark_offline(&mut self, id: WorkerId) -> Result<Option<TaskId>> {
        let worker = self.slot(id)?;
        worker.status = WorkerStatus::Offline;
        worker.connection = None;
        worker.workspace = None;
        Ok(worker.current_task.take())
    }

    /// Retire a worker; it is never handed new work.
    pub fn mark_error(&mut self, id: WorkerId) -> Result<Option<TaskId>> {
        let worker = self.slot(id)?;
        worker.status = WorkerStatus::Error;
        worker.workspace = None;
        Ok(worker.current_task.take())
    }

    pub fn record_heartbeat(&mut self, id: WorkerId) -> Result<()> {
        self.slot(id)?.touch();
        Ok(())
    }

    pub fn record_success(&mut self, id: WorkerId) -> Result<()> {
        let worker = self.slot(id)?;
        worker.completed += 1;
        worker.consecutive_failures = 0;
        Ok(())
    }

    /// Count a failure. Returns the consecutive-failure streak.
    pub fn record_failure(&mut self, id: WorkerId) -> Result<u32> {
        let worker = self.slot(id)?;
        worker.failed += 1;
        worker.consecutive_failures += 1;
        Ok(worker.consecutive_failures)
    }

    pub fn set_session(&mut self, id: WorkerId, session: Option<String>) -> Result<()> {
        self.slot(id)?.session = session;
        Ok(())
    }
}

impl From<Vec<Worker>> for WorkerPool {
    fn from(workers: Vec<Worker>) -> Self {
        let next_id = workers.iter().map(|w| w.id.0).max().unwrap_or(0);
        Self {
            workers: workers.into_iter().map(|w| (w.id, w)).collect(),
            next_id,
        }
    }
}

impl From<WorkerPool> for Vec<Worker> {
    fn from(pool: WorkerPool) -> Self {
        pool.workers.into_values().collect()
    }
}
