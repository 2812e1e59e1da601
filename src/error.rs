use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::task::TaskId;
use crate::core::worker::WorkerId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Worker {worker} timed out: {reason}")]
    WorkerTimeout { worker: WorkerId, reason: String },

    #[error("Conflict unresolved at level {level}: {reason}")]
    ConflictUnresolved { level: u8, reason: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Run cannot progress: {0}")]
    Deadlock(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Coding agent binary not found in PATH")]
    AgentBinaryNotFound,

    #[error("Coding agent error: {0}")]
    Agent(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Classify this error for the run report.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::InvalidTransition { .. } => ErrorKind::State,
            Error::WorkerTimeout { .. } | Error::Timeout(_) => ErrorKind::WorkerTimeout,
            Error::ConflictUnresolved { .. } => ErrorKind::ConflictUnresolved,
            Error::Channel(_) => ErrorKind::Channel,
            Error::Deadlock(_) => ErrorKind::Deadlock,
            Error::Agent(_) | Error::AgentBinaryNotFound => ErrorKind::Agent,
            Error::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }
}

/// Error categories as they appear in snapshots and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    State,
    WorkerTimeout,
    ConflictUnresolved,
    Channel,
    Deadlock,
    Agent,
    /// Withdrawn by an operator stop.
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::State => "StateError",
            ErrorKind::WorkerTimeout => "WorkerTimeoutError",
            ErrorKind::ConflictUnresolved => "ConflictUnresolvedError",
            ErrorKind::Channel => "ChannelError",
            ErrorKind::Deadlock => "DeadlockError",
            ErrorKind::Agent => "AgentError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "InternalError",
        };
        write!(f, "{}", s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
