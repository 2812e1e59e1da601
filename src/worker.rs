//! Worker side of the channel.
//!
//! A [`WorkerRunner`] registers under a stable name, heartbeats on an
//! interval, and runs each assigned task through the coding agent inside the
//! task's workspace. It runs either as a tokio task in the coordinator
//! process or as `maestro worker` inside a terminal session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::agent::{drain, AgentConstraints, AgentEvent, AgentRequest, CodingAgent};
use crate::channel::{Assignment, CoordinatorCommand, WorkerLink, WorkerMessage};
use crate::core::task::TaskId;
use crate::git::GitOps;
use crate::util::blocking;
use crate::{mlog, mlog_debug, mlog_warn, Error, Result};

/// Progress reported per tool call, capped below completion.
const PROGRESS_STEP: u32 = 5;
const PROGRESS_CAP: u32 = 95;

struct RunningTask {
    id: TaskId,
    generation: u32,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningTask {
    fn stop(self) {
        self.cancel.cancel();
        drop(self.handle);
    }
}

pub struct WorkerRunner {
    name: String,
    agent: Arc<dyn CodingAgent>,
    heartbeat_interval: Duration,
    constraints: AgentConstraints,
}

impl WorkerRunner {
    pub fn new(name: &str, agent: Arc<dyn CodingAgent>, heartbeat_interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            agent,
            heartbeat_interval,
            constraints: AgentConstraints::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: AgentConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serve one connection until terminated, cancelled or disconnected.
    ///
    /// # Errors
    /// `Error::Channel` if the initial registration cannot be sent.
    pub async fn run(self, mut link: WorkerLink, cancel: CancellationToken) -> Result<()> {
        link.send(WorkerMessage::Register {
            name: self.name.clone(),
        })?;
        mlog!("Worker {} registered", self.name);

        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut current: Option<RunningTask> = None;

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break "cancelled".to_string(),
                _ = heartbeat.tick() => {
                    if link.send(WorkerMessage::Heartbeat).is_err() {
                        break "connection closed".to_string();
                    }
                }
                command = link.recv() => match command {
                    None => break "coordinator went away".to_string(),
                    Some(CoordinatorCommand::TaskAssign { task }) => {
                        if let Some(previous) = current.take() {
                            mlog_warn!(
                                "Worker {}: new assignment {} while holding {}",
                                self.name, task.id, previous.id
                            );
                            previous.stop();
                        }
                        current = Some(self.start(task, link.sender()));
                    }
                    Some(CoordinatorCommand::TaskCancel { task_id, generation }) => {
                        let matches = current
                            .as_ref()
                            .is_some_and(|c| c.id == task_id && c.generation == generation);
                        if matches {
                            if let Some(running) = current.take() {
                                mlog!("Worker {}: cancelling {}", self.name, task_id);
                                running.stop();
                            }
                        } else {
                            mlog_debug!(
                                "Worker {}: ignoring cancel for {} gen {}",
                                self.name, task_id, generation
                            );
                        }
                    }
                    Some(CoordinatorCommand::WorkerTerminate { reason }) => break reason,
                }
            }
        };

        if let Some(running) = current.take() {
            running.stop();
        }
        mlog!("Worker {} exiting: {}", self.name, reason);
        Ok(())
    }

    fn start(&self, task: Assignment, tx: UnboundedSender<WorkerMessage>) -> RunningTask {
        mlog!(
            "Worker {}: starting {} (gen {}) in {}",
            self.name,
            task.id,
            task.generation,
            task.workspace.path.display()
        );
        let cancel = CancellationToken::new();
        let id = task.id.clone();
        let generation = task.generation;
        let handle = tokio::spawn(execute(
            task,
            Arc::clone(&self.agent),
            self.constraints.clone(),
            tx,
            cancel.clone(),
        ));
        RunningTask {
            id,
            generation,
            cancel,
            handle,
        }
    }
}

async fn execute(
    task: Assignment,
    agent: Arc<dyn CodingAgent>,
    constraints: AgentConstraints,
    tx: UnboundedSender<WorkerMessage>,
    cancel: CancellationToken,
) {
    let task_id = task.id.clone();
    let generation = task.generation;
    let _ = tx.send(WorkerMessage::TaskStarted {
        task_id: task_id.clone(),
        generation,
    });

    let report = match perform(&task, agent.as_ref(), constraints, &tx, &cancel).await {
        Ok(outcome) => WorkerMessage::TaskCompleted {
            task_id,
            generation,
            output: outcome.output,
            usage: outcome.usage,
        },
        Err(Error::Cancelled) => {
            mlog!("Task {} cancelled", task.id);
            return;
        }
        Err(e) => {
            mlog_warn!("Task {} failed: {}", task.id, e);
            WorkerMessage::TaskFailed {
                task_id,
                generation,
                error: e.to_string(),
            }
        }
    };
    let _ = tx.send(report);
}

async fn perform(
    task: &Assignment,
    agent: &dyn CodingAgent,
    constraints: AgentConstraints,
    tx: &UnboundedSender<WorkerMessage>,
    cancel: &CancellationToken,
) -> Result<crate::agent::AgentOutcome> {
    let request =
        AgentRequest::new(task.prompt(), &task.workspace.path).with_constraints(constraints);
    let mut stream = agent.invoke(&request)?;

    let mut tool_calls: u32 = 0;
    let outcome = drain(&mut stream, cancel, |event| {
        if let AgentEvent::ToolCall { name, .. } = event {
            tool_calls += 1;
            let _ = tx.send(WorkerMessage::TaskProgress {
                task_id: task.id.clone(),
                generation: task.generation,
                percent: progress_percent(tool_calls),
                message: format!("tool: {}", name),
            });
        }
    })
    .await?;

    if !outcome.success {
        return Err(Error::Agent(outcome.output));
    }

    let path = task.workspace.path.clone();
    let message = format!("{}: {}", task.id, task.title);
    let committed = blocking(move || GitOps::commit_all(&path, &message)).await?;
    mlog_debug!("Task {} committed={}", task.id, committed);
    Ok(outcome)
}

fn progress_percent(tool_calls: u32) -> u8 {
    (tool_calls.saturating_mul(PROGRESS_STEP)).min(PROGRESS_CAP) as u8
}
