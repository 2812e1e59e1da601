//! Wire protocol between the coordinator and its workers.
//!
//! Every frame is one JSON object on its own line. Each direction carries a
//! closed set of messages tagged by `"type"`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::task::{TaskId, Usage};
use crate::core::worker::Workspace;
use crate::error::{Error, Result};

/// Frames longer than this are rejected as malformed.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Worker → coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        name: String,
    },
    Heartbeat,
    TaskStarted {
        task_id: TaskId,
        generation: u32,
    },
    TaskProgress {
        task_id: TaskId,
        generation: u32,
        percent: u8,
        message: String,
    },
    TaskCompleted {
        task_id: TaskId,
        generation: u32,
        output: String,
        #[serde(default)]
        usage: Usage,
    },
    TaskFailed {
        task_id: TaskId,
        generation: u32,
        error: String,
    },
}

impl WorkerMessage {
    /// Task and generation a report refers to, if it is a task report.
    pub fn task_ref(&self) -> Option<(&TaskId, u32)> {
        match self {
            WorkerMessage::TaskStarted {
                task_id,
                generation,
            }
            | WorkerMessage::TaskProgress {
                task_id,
                generation,
                ..
            }
            | WorkerMessage::TaskCompleted {
                task_id,
                generation,
                ..
            }
            | WorkerMessage::TaskFailed {
                task_id,
                generation,
                ..
            } => Some((task_id, *generation)),
            WorkerMessage::Register { .. } | WorkerMessage::Heartbeat => None,
        }
    }
}

/// Everything a worker needs to carry out one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub generation: u32,
    pub workspace: Workspace,
}

impl Assignment {
    /// Prompt handed to the coding agent.
    pub fn prompt(&self) -> String {
        if self.description.trim().is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.description)
        }
    }
}

/// Coordinator → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorCommand {
    TaskAssign { task: Assignment },
    TaskCancel { task_id: TaskId, generation: u32 },
    WorkerTerminate { reason: String },
}

/// Operator → coordinator, sent by `maestro stop` over the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorRequest {
    Stop { force: bool },
}

/// Any frame the coordinator may receive on a socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Upstream {
    Worker(WorkerMessage),
    Operator(OperatorRequest),
}

/// Serialize a message as one newline-terminated frame.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one frame. Oversized or unparseable frames are `Error::Channel`.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    let line = line.trim();
    if line.len() > MAX_FRAME_BYTES {
        return Err(Error::Channel(format!(
            "frame of {} bytes exceeds limit",
            line.len()
        )));
    }
    serde_json::from_str(line).map_err(|e| Error::Channel(format!("malformed frame: {}", e)))
}
