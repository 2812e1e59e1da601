//! Worker data model.
//!
//! A worker is one agent session able to hold a single task at a time.
//! Workers are slots in the pool's arena, keyed by [`WorkerId`]; the channel
//! connection a worker speaks through is attached to the slot, never the
//! other way around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::time::Instant;

use crate::channel::ConnectionId;
use crate::core::task::TaskId;

/// Arena key for a worker slot. Assigned in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    /// Being retired; never handed new work.
    Error,
    /// Missed its heartbeat deadline or lost its connection.
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Error => "error",
            WorkerStatus::Offline => "offline",
        };
        write!(f, "{}", s)
    }
}

/// An isolated, branch-scoped checkout given to one worker for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    /// Name the worker registered with.
    pub name: String,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub workspace: Option<Workspace>,
    /// Terminal session hosting the worker, when it runs in one.
    #[serde(default)]
    pub session: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub connection: Option<ConnectionId>,
    /// Monotonic twin of `last_heartbeat`, used for deadline arithmetic.
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
}

impl Worker {
    pub fn new(id: WorkerId, name: &str, connection: Option<ConnectionId>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.to_string(),
            status: WorkerStatus::Idle,
            current_task: None,
            workspace: None,
            session: None,
            registered_at: now,
            last_heartbeat: now,
            completed: 0,
            failed: 0,
            consecutive_failures: 0,
            connection,
            last_seen: Instant::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    /// Idle or busy: reachable and in good standing.
    pub fn is_live(&self) -> bool {
        matches!(self.status, WorkerStatus::Idle | WorkerStatus::Busy)
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
        self.last_seen = Instant::now();
    }
}
