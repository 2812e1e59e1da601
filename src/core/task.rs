//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of work handed to workers. They are read once
//! from a task-definition file at startup; afterwards only their status,
//! assignment and progress fields change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::core::worker::WorkerId;
use crate::error::{Error, ErrorKind, Result};

/// Default priority for tasks that don't specify one (lower = more urgent).
pub const DEFAULT_PRIORITY: i64 = 100;

/// Identifier for a task, as written in the task-definition file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Form of the id that is safe inside branch and directory names.
    pub fn slug(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or a free worker.
    #[default]
    Pending,
    /// Every dependency completed; eligible for dispatch.
    Ready,
    /// Bound to exactly one worker.
    Running,
    Completed,
    Failed,
    /// Withdrawn by an operator stop or because a dependency failed.
    Cancelled,
}

impl TaskStatus {
    /// Whether `self -> to` is a legal lifecycle step.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Ready)
                | (Pending, Running)
                | (Ready, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Pending, Cancelled)
                | (Ready, Cancelled)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Error recorded on a failed or cancelled task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&Error> for TaskError {
    fn from(err: &Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// Latest progress report from the worker running a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

/// Token and cost accounting reported with a completed task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

/// One record of the task-definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub dependencies: BTreeSet<TaskId>,
    pub priority: i64,
    pub status: TaskStatus,
    /// Set iff the task is running.
    pub assigned_worker: Option<WorkerId>,
    /// Worker that last held the task, kept for reports.
    #[serde(default)]
    pub last_worker: Option<WorkerId>,
    /// Number of times the task was bound to a worker. Doubles as the
    /// generation carried by assignment and report messages.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<TaskError>,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl Task {
    /// Create a pending task with no dependencies.
    pub fn new(id: impl Into<TaskId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: String::new(),
            dependencies: BTreeSet::new(),
            priority: DEFAULT_PRIORITY,
            status: TaskStatus::Pending,
            assigned_worker: None,
            last_worker: None,
            attempts: 0,
            timeout_secs: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            progress: None,
            output: None,
            usage: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Validate and apply a status change.
    ///
    /// # Errors
    /// Returns `Error::InvalidTransition` if the lifecycle forbids the step.
    pub fn transition(&mut self, to: TaskStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(Error::InvalidTransition {
                task: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Bind the task to a worker. Bumps the generation.
    pub fn start(&mut self, worker: WorkerId) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.attempts += 1;
        self.assigned_worker = Some(worker);
        self.last_worker = Some(worker);
        self.started_at = Some(Utc::now());
        self.error = None;
        self.progress = None;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.release();
        Ok(())
    }

    pub fn fail(&mut self, error: TaskError) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error);
        self.release();
        Ok(())
    }

    /// Return a running task to pending without recording a failure.
    pub fn requeue(&mut self) -> Result<()> {
        self.transition(TaskStatus::Pending)?;
        self.assigned_worker = None;
        self.started_at = None;
        self.progress = None;
        Ok(())
    }

    pub fn cancel(&mut self, reason: TaskError) -> Result<()> {
        self.transition(TaskStatus::Cancelled)?;
        self.error = Some(reason);
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        self.assigned_worker = None;
        self.finished_at = Some(Utc::now());
    }

    /// Current assignment generation.
    pub fn generation(&self) -> u32 {
        self.attempts
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending or ready.
    pub fn is_waiting(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }
}

impl From<TaskSpec> for Task {
    fn from(spec: TaskSpec) -> Self {
        let mut task = Task::new(spec.id, &spec.title)
            .with_description(&spec.description)
            .with_priority(spec.priority)
            .with_dependencies(spec.dependencies);
        task.timeout_secs = spec.timeout_secs;
        task
    }
}

/// Parse a task-definition document (a JSON array of task records).
///
/// Checks each record in isolation; duplicate ids, unknown dependencies and
/// cycles are the graph's job.
pub fn parse_task_file(content: &str) -> Result<Vec<Task>> {
    let specs: Vec<TaskSpec> = serde_json::from_str(content)
        .map_err(|e| Error::Validation(format!("malformed task file: {}", e)))?;

    if specs.is_empty() {
        return Err(Error::Validation("task file contains no tasks".to_string()));
    }

    for spec in &specs {
        if spec.id.as_str().trim().is_empty() {
            return Err(Error::Validation("task id cannot be empty".to_string()));
        }
        if spec.title.trim().is_empty() {
            return Err(Error::Validation(format!(
                "task {} has an empty title",
                spec.id
            )));
        }
        if spec.dependencies.contains(&spec.id) {
            return Err(Error::Validation(format!(
                "task {} depends on itself",
                spec.id
            )));
        }
        if spec.timeout_secs == Some(0) {
            return Err(Error::Validation(format!(
                "task {} has a zero timeout",
                spec.id
            )));
        }
    }

    Ok(specs.into_iter().map(Task::from).collect())
}

/// Read and parse a task-definition file. The file is never written back.
pub fn load_task_file(path: &Path) -> Result<Vec<Task>> {
    let content = std::fs::read_to_string(path)?;
    parse_task_file(&content)
}
