//! The coordinator's event loop.
//!
//! The [`Orchestrator`] owns the [`SystemState`] and mutates it only from
//! [`Orchestrator::step`], which handles exactly one inbound event or one
//! expired deadline, then dispatches and re-evaluates the run phase. There
//! is no polling: the loop sleeps until the next message or the earliest
//! deadline computed from state (task timeouts, heartbeat expiry,
//! starvation).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{
    Assignment, CommunicationChannel, ConnectionId, Connector, CoordinatorCommand, Inbound,
    OperatorRequest, WorkerMessage,
};
use crate::config::Config;
use crate::core::task::{Progress, TaskError, TaskId, TaskStatus};
use crate::core::worker::{WorkerId, Workspace};
use crate::error::{Error, ErrorKind, Result};
use crate::git::BranchIsolation;
use crate::orchestration::gate::{ConflictGate, ConflictLevel};
use crate::orchestration::health::{HealthConfig, HealthMonitor};
use crate::orchestration::scheduler::{SchedulePolicy, Scheduler};
use crate::provision::WorkerProvisioner;
use crate::state::{RunPhase, StateStore, SystemState};
use crate::util::{blocking_with_timeout, sleep_until_opt};
use crate::{mlog, mlog_debug, mlog_error, mlog_trace, mlog_warn};

/// Run-level settings, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Workers provisioned at start.
    pub workers: usize,
    pub policy: SchedulePolicy,
    /// Default per-task deadline; a task's own `timeout_secs` wins.
    pub task_timeout: Duration,
    /// Bound on each workspace operation.
    pub git_timeout: Duration,
    /// How long ready tasks may wait with no live worker.
    pub starvation_timeout: Duration,
    pub health: HealthConfig,
    pub replace_retired: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers,
            policy: config.policy,
            task_timeout: config.task_timeout(),
            git_timeout: config.git_timeout(),
            starvation_timeout: config.starvation_timeout(),
            health: config.health(),
            replace_retired: config.replace_retired,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Let running tasks finish, cancel the rest.
    Graceful,
    /// Cancel everything now.
    Force,
}

/// What a call to [`Orchestrator::step`] left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Finished(RunPhase),
}

enum Wake {
    Inbound(Option<Inbound>),
    Deadline,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    state: SystemState,
    store: Option<StateStore>,
    channel: CommunicationChannel,
    scheduler: Scheduler,
    health: HealthMonitor,
    isolation: Arc<dyn BranchIsolation>,
    gate: ConflictGate,
    provisioner: Box<dyn WorkerProvisioner>,
    /// Connection -> worker slot. Slots never point back.
    connections: HashMap<ConnectionId, WorkerId>,
    /// Worker name -> session handle, for workers we started.
    sessions: HashMap<String, String>,
    deadlines: HashMap<TaskId, Instant>,
    starved_since: Option<Instant>,
    stopping: Option<StopMode>,
    next_worker: u64,
    dirty: bool,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        state: SystemState,
        channel: CommunicationChannel,
        isolation: Arc<dyn BranchIsolation>,
        gate: ConflictGate,
        provisioner: Box<dyn WorkerProvisioner>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(config.policy),
            health: HealthMonitor::new(config.health.clone()),
            config,
            state,
            store: None,
            channel,
            isolation,
            gate,
            provisioner,
            connections: HashMap::new(),
            sessions: HashMap::new(),
            deadlines: HashMap::new(),
            starved_since: None,
            stopping: None,
            next_worker: 0,
            dirty: false,
        }
    }

    /// Persist the state to `store` after every state-changing event.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    pub fn phase(&self) -> RunPhase {
        self.state.phase
    }

    pub fn stopping(&self) -> Option<StopMode> {
        self.stopping
    }

    /// Handle for opening connections, in-memory or from the socket server.
    pub fn connector(&self) -> Connector {
        self.channel.connector()
    }

    /// `idle -> running`: provision workers, persist, try to dispatch.
    ///
    /// # Errors
    /// `Error::Validation` if the run was already started, has no base
    /// branch, or its graph does not validate.
    pub async fn start(&mut self) -> Result<()> {
        if self.state.phase != RunPhase::Idle {
            return Err(Error::Validation(format!(
                "run {} is already {}",
                self.state.run_id, self.state.phase
            )));
        }
        if self.state.base_branch.is_none() {
            return Err(Error::Validation("no base branch for the run".to_string()));
        }
        self.state.graph.validate()?;

        self.state.set_phase(RunPhase::Running);
        mlog!(
            "Run {} started: {} task(s), {} worker(s), policy={}",
            self.state.run_id,
            self.state.graph.task_count(),
            self.config.workers,
            self.config.policy
        );
        for _ in 0..self.config.workers {
            self.provision_worker();
        }
        self.dirty = true;
        self.settle().await;
        Ok(())
    }

    /// Drive the run to a terminal phase.
    ///
    /// Cancelling `cancel` requests a graceful stop; the loop keeps going
    /// until running tasks finish.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunPhase> {
        if self.state.phase == RunPhase::Idle {
            self.start().await?;
        }

        let connector = self.channel.connector();
        let watcher = tokio::spawn(async move {
            cancel.cancelled().await;
            connector.request(OperatorRequest::Stop { force: false });
        });

        let result = loop {
            match self.step().await {
                Ok(Step::Continue) => continue,
                Ok(Step::Finished(phase)) => break Ok(phase),
                Err(e) => break Err(e),
            }
        };
        watcher.abort();
        result
    }

    /// Wait for one event or deadline and handle it.
    pub async fn step(&mut self) -> Result<Step> {
        if self.state.phase.is_terminal() {
            return Ok(Step::Finished(self.state.phase));
        }
        if self.state.phase == RunPhase::Idle {
            return Err(Error::Validation("run has not been started".to_string()));
        }

        let deadline = self.next_deadline();
        let wake = tokio::select! {
            // Queued messages win over deadlines so a busy loop never
            // expires a worker whose heartbeat is already waiting.
            biased;
            inbound = self.channel.recv() => Wake::Inbound(inbound),
            _ = sleep_until_opt(deadline) => Wake::Deadline,
        };

        match wake {
            Wake::Inbound(Some(event)) => self.handle(event).await,
            Wake::Inbound(None) => {
                mlog_error!("Channel closed while the run was active");
                self.state.push_error(
                    None,
                    None,
                    ErrorKind::Channel,
                    "coordinator channel closed".to_string(),
                );
                self.finish(RunPhase::Failed).await;
                return Ok(Step::Finished(self.state.phase));
            }
            Wake::Deadline => self.on_deadlines(Instant::now()).await,
        }

        self.settle().await;
        if self.state.phase.is_terminal() {
            Ok(Step::Finished(self.state.phase))
        } else {
            Ok(Step::Continue)
        }
    }

    /// Earliest of: task deadlines, heartbeat expiry, starvation limit.
    pub fn next_deadline(&self) -> Option<Instant> {
        let starvation = self
            .starved_since
            .map(|since| since + self.config.starvation_timeout);
        self.deadlines
            .values()
            .copied()
            .chain(self.health.next_deadline(&self.state.pool))
            .chain(starvation)
            .min()
    }

    // ========== Events ==========

    async fn handle(&mut self, event: Inbound) {
        match event {
            Inbound::Connected { .. } => {}
            Inbound::Message { conn, message } => self.on_message(conn, message).await,
            Inbound::Operator { request, .. } => match request {
                OperatorRequest::Stop { force } => {
                    let mode = if force {
                        StopMode::Force
                    } else {
                        StopMode::Graceful
                    };
                    self.request_stop(mode).await;
                }
            },
            Inbound::Malformed { conn, error } => {
                mlog_warn!("Malformed frame on {}: {}", conn, error);
                let worker = self.connections.get(&conn).copied();
                self.state
                    .record_error(None, worker, &Error::Channel(error));
                self.connection_lost(conn, "malformed frame").await;
            }
            Inbound::Disconnected { conn } => self.connection_lost(conn, "disconnected").await,
        }
    }

    async fn on_message(&mut self, conn: ConnectionId, message: WorkerMessage) {
        mlog_trace!("{} -> {:?}", conn, message);
        if let WorkerMessage::Register { name } = message {
            self.on_register(conn, &name).await;
            return;
        }

        let Some(&worker) = self.connections.get(&conn) else {
            mlog_warn!("Message from unregistered {}; ignoring", conn);
            return;
        };
        // Any traffic proves liveness.
        let _ = self.state.pool.record_heartbeat(worker);

        let Some((task_id, generation)) = message.task_ref().map(|(id, g)| (id.clone(), g)) else {
            return;
        };
        if !self.is_current(&task_id, generation, worker) {
            mlog!(
                "Discarding late report for {} gen {} from {}",
                task_id,
                generation,
                worker
            );
            self.state.counters.late_reports += 1;
            self.dirty = true;
            return;
        }

        self.dirty = true;
        match message {
            WorkerMessage::TaskStarted { .. } => {
                mlog!("Task {} started on {}", task_id, worker);
            }
            WorkerMessage::TaskProgress {
                percent, message, ..
            } => {
                mlog_debug!("Task {} progress {}%: {}", task_id, percent, message);
                let _ = self.state.graph.record_progress(
                    &task_id,
                    Progress {
                        percent: percent.min(100),
                        message,
                    },
                );
            }
            WorkerMessage::TaskCompleted { output, usage, .. } => {
                let _ = self.state.graph.record_output(&task_id, output, usage);
                self.on_completed(worker, &task_id).await;
            }
            WorkerMessage::TaskFailed { error, .. } => {
                mlog_warn!("Task {} failed on {}: {}", task_id, worker, error);
                self.fail_task(&task_id, Some(worker), &Error::Agent(error))
                    .await;
                self.worker_finished(worker, true);
            }
            WorkerMessage::Register { .. } | WorkerMessage::Heartbeat => {}
        }
    }

    /// Whether a report still refers to the live assignment.
    fn is_current(&self, task_id: &TaskId, generation: u32, worker: WorkerId) -> bool {
        self.state.graph.get_task(task_id).is_some_and(|t| {
            t.status == TaskStatus::Running
                && t.assigned_worker == Some(worker)
                && t.generation() == generation
        })
    }

    async fn on_register(&mut self, conn: ConnectionId, name: &str) {
        if self.stopping.is_some() {
            mlog!("Worker {} registered during stop; terminating", name);
            let _ = self.channel.send(
                conn,
                CoordinatorCommand::WorkerTerminate {
                    reason: "run is stopping".to_string(),
                },
            );
            return;
        }

        // A reconnect is a fresh worker; whatever the old slot held goes back
        // to pending.
        let mut stale = Vec::new();
        if let Some(&old) = self.connections.get(&conn) {
            stale.push(old);
        }
        if let Some(old) = self.state.pool.find_by_name(name) {
            if !stale.contains(&old) {
                stale.push(old);
            }
        }
        for old in stale {
            let old_conn = self.state.pool.get(old).and_then(|w| w.connection);
            mlog!("Worker {} re-registered; replacing slot {}", name, old);
            let held = self.detach_worker(old);
            if let Some(c) = old_conn.filter(|c| *c != conn) {
                self.channel.disconnect(c);
            }
            if let Some(task_id) = held {
                self.requeue_task(&task_id).await;
            }
            self.state.pool.remove_worker(old);
        }

        let id = self.state.pool.add_worker(name, Some(conn));
        self.connections.insert(conn, id);
        if let Some(session) = self.sessions.get(name) {
            let _ = self.state.pool.set_session(id, Some(session.clone()));
        }
        self.state.counters.workers_registered += 1;
        self.dirty = true;
        mlog!("Worker {} registered as {} on {}", name, id, conn);
    }

    async fn connection_lost(&mut self, conn: ConnectionId, reason: &str) {
        self.channel.disconnect(conn);
        let Some(worker) = self.connections.remove(&conn) else {
            return;
        };
        let live = self.state.pool.get(worker).is_some_and(|w| w.is_live());
        if live {
            self.worker_offline(worker, reason).await;
        }
    }

    /// A worker went silent or away. Its task returns to pending.
    async fn worker_offline(&mut self, worker: WorkerId, reason: &str) {
        let Some(name) = self.state.pool.get(worker).map(|w| w.name.clone()) else {
            return;
        };
        if let Some(output) = self.provisioner.capture(&name) {
            mlog_debug!("Last output of {}:\n{}", name, output);
        }
        let conn = self.state.pool.get(worker).and_then(|w| w.connection);
        let held = self.detach_worker(worker);
        if let Some(c) = conn {
            self.channel.disconnect(c);
        }

        mlog_warn!("Worker {} ({}) offline: {}", worker, name, reason);
        self.state.record_error(
            held.as_ref(),
            Some(worker),
            &Error::WorkerTimeout {
                worker,
                reason: reason.to_string(),
            },
        );
        if let Some(task_id) = held {
            self.requeue_task(&task_id).await;
        }
        self.replace_worker(&name);
        self.dirty = true;
    }

    /// Mark a slot offline and forget its connection. Returns the held task.
    fn detach_worker(&mut self, worker: WorkerId) -> Option<TaskId> {
        self.connections.retain(|_, w| *w != worker);
        match self.state.pool.mark_offline(worker) {
            Ok(held) => held,
            Err(e) => {
                mlog_error!("Cannot detach {}: {}", worker, e);
                None
            }
        }
    }

    // ========== Deadlines ==========

    async fn on_deadlines(&mut self, now: Instant) {
        let expired_tasks: Vec<TaskId> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in expired_tasks {
            self.on_task_timeout(&task_id).await;
        }

        for worker in self.health.expired(&self.state.pool, now) {
            let reason = format!(
                "no heartbeat for {:?}",
                self.health.config().heartbeat_timeout()
            );
            self.worker_offline(worker, &reason).await;
        }

        if let Some(since) = self.starved_since {
            if since + self.config.starvation_timeout <= now {
                let message = format!(
                    "ready tasks waited {:?} with no live worker",
                    self.config.starvation_timeout
                );
                mlog_error!("{}", message);
                self.state.record_error(None, None, &Error::Deadlock(message.clone()));
                self.cancel_waiting(ErrorKind::Deadlock, &message);
                self.finish(RunPhase::Failed).await;
            }
        }
    }

    async fn on_task_timeout(&mut self, task_id: &TaskId) {
        self.deadlines.remove(task_id);
        let Some(task) = self.state.graph.get_task(task_id) else {
            return;
        };
        if task.status != TaskStatus::Running {
            return;
        }
        let generation = task.generation();
        let worker = task.assigned_worker;
        let limit = self.task_timeout(task_id);
        mlog_warn!("Task {} exceeded its {:?} deadline", task_id, limit);

        if let Some(w) = worker {
            self.send_to_worker(
                w,
                CoordinatorCommand::TaskCancel {
                    task_id: task_id.clone(),
                    generation,
                },
            );
        }
        let err = match worker {
            Some(w) => Error::WorkerTimeout {
                worker: w,
                reason: format!("task {} exceeded {:?}", task_id, limit),
            },
            None => Error::Timeout(limit),
        };
        self.fail_task(task_id, worker, &err).await;
        if let Some(w) = worker {
            self.worker_finished(w, true);
        }
    }

    fn task_timeout(&self, task_id: &TaskId) -> Duration {
        self.state
            .graph
            .get_task(task_id)
            .and_then(|t| t.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(self.config.task_timeout)
    }

    // ========== Dispatch ==========

    /// Bind idle workers to the head of the schedule until one side runs
    /// out.
    async fn dispatch(&mut self) {
        if self.state.phase != RunPhase::Running || self.stopping.is_some() {
            return;
        }
        loop {
            let idle = self.state.pool.idle_count();
            if idle == 0 {
                return;
            }
            let batch = self.scheduler.parallel_tasks(&self.state.graph, idle);
            if batch.is_empty() {
                return;
            }
            for task_id in batch {
                let Some(worker) = self.state.pool.get_idle_worker() else {
                    return;
                };
                self.bind(&task_id, worker).await;
            }
        }
    }

    async fn bind(&mut self, task_id: &TaskId, worker: WorkerId) {
        self.dirty = true;
        let generation = match self.state.graph.mark_running(task_id, worker) {
            Ok(generation) => generation,
            Err(e) => {
                // Only reachable through a bookkeeping bug; never coerce.
                mlog_error!("Cannot start {}: {}", task_id, e);
                self.state.record_error(Some(task_id), Some(worker), &e);
                let _ = self
                    .state
                    .graph
                    .mark_cancelled(task_id, TaskError::from(&e));
                return;
            }
        };

        let workspace = match self.create_workspace(task_id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                mlog_error!("Workspace for {} failed: {}", task_id, e);
                self.fail_task(task_id, None, &e).await;
                return;
            }
        };

        if let Err(e) = self
            .state
            .pool
            .mark_busy(worker, task_id.clone(), workspace.clone())
        {
            mlog_error!("Cannot bind {} to {}: {}", task_id, worker, e);
            let _ = self.state.graph.requeue(task_id);
            return;
        }

        let Some(task) = self.state.graph.get_task(task_id) else {
            return;
        };
        let assignment = Assignment {
            id: task_id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            generation,
            workspace,
        };
        let deadline = Instant::now() + self.task_timeout(task_id);
        self.deadlines.insert(task_id.clone(), deadline);
        self.state.counters.dispatched += 1;

        let conn = self.state.pool.get(worker).and_then(|w| w.connection);
        let sent = conn.map(|c| {
            self.channel
                .send(c, CoordinatorCommand::TaskAssign { task: assignment })
        });
        match (conn, sent) {
            (Some(_), Some(Ok(()))) => {
                mlog!("Dispatched {} (gen {}) to {}", task_id, generation, worker);
            }
            (Some(c), Some(Err(e))) => {
                mlog_warn!("Assignment of {} to {} failed: {}", task_id, worker, e);
                self.connection_lost(c, "send failed").await;
            }
            _ => {
                mlog_warn!("{} has no connection; returning {}", worker, task_id);
                self.worker_offline(worker, "no connection").await;
            }
        }
    }

    async fn create_workspace(&self, task_id: &TaskId) -> Result<Workspace> {
        let base = self.base_branch();
        let isolation = Arc::clone(&self.isolation);
        let id = task_id.clone();
        blocking_with_timeout(self.config.git_timeout, move || isolation.create(&id, &base)).await
    }

    async fn release_workspace(&self, task_id: &TaskId) {
        let isolation = Arc::clone(&self.isolation);
        let id = task_id.clone();
        if let Err(e) =
            blocking_with_timeout(self.config.git_timeout, move || isolation.remove(&id)).await
        {
            mlog_warn!("Removing workspace of {} failed: {}", task_id, e);
        }
    }

    fn base_branch(&self) -> String {
        self.state
            .base_branch
            .clone()
            .unwrap_or_else(|| "main".to_string())
    }

    // ========== Completion ==========

    async fn on_completed(&mut self, worker: WorkerId, task_id: &TaskId) {
        self.deadlines.remove(task_id);
        let Some(workspace) = self
            .state
            .pool
            .get(worker)
            .and_then(|w| w.workspace.clone())
        else {
            let err = Error::Validation(format!("{} reported {} without a workspace", worker, task_id));
            self.fail_task(task_id, Some(worker), &err).await;
            self.worker_finished(worker, false);
            return;
        };

        match self.reconcile(task_id, &workspace).await {
            Ok(()) => match self.state.graph.mark_completed(task_id) {
                Ok(()) => {
                    self.state.counters.completed += 1;
                    mlog!("Task {} completed and integrated", task_id);
                    self.release_workspace(task_id).await;
                    self.worker_finished(worker, false);
                }
                Err(e) => {
                    mlog_error!("Task {} integrated but not completable: {}", task_id, e);
                    self.state.record_error(Some(task_id), Some(worker), &e);
                    self.release_workspace(task_id).await;
                    let _ = self.state.pool.mark_idle(worker);
                    self.dirty = true;
                }
            },
            Err(e) => {
                mlog_warn!("Task {} rejected: {}", task_id, e);
                self.fail_task(task_id, Some(worker), &e).await;
                // The worker did its job; a merge conflict is not its failure.
                let _ = self.state.pool.mark_idle(worker);
            }
        }
    }

    /// Merge base into the task branch, gate the conflicts, integrate.
    async fn reconcile(&mut self, task_id: &TaskId, workspace: &Workspace) -> Result<()> {
        let base = self.base_branch();
        let git_timeout = self.config.git_timeout;

        let isolation = Arc::clone(&self.isolation);
        let (ws, b) = (workspace.clone(), base.clone());
        let synced = blocking_with_timeout(git_timeout, move || isolation.sync(&ws, &b)).await?;
        mlog_debug!("Task {} sync with {}: {:?}", task_id, base, synced);

        let isolation = Arc::clone(&self.isolation);
        let path = workspace.path.clone();
        let conflicts =
            blocking_with_timeout(git_timeout, move || isolation.list_conflicts(&path)).await?;

        let limit = self.task_timeout(task_id);
        let cancel = CancellationToken::new();
        let outcome = match tokio::time::timeout(
            limit,
            self.gate.run(&workspace.path, &conflicts, &cancel),
        )
        .await
        {
            Ok(outcome) => outcome?,
            Err(_) => {
                cancel.cancel();
                return Err(Error::Timeout(limit));
            }
        };

        for record in &outcome.records {
            match record.level {
                ConflictLevel::Auto => self.state.counters.conflicts_auto += 1,
                ConflictLevel::Assisted => self.state.counters.conflicts_assisted += 1,
                ConflictLevel::Manual => self.state.counters.conflicts_manual += 1,
            }
        }
        if let Some(err) = outcome.error() {
            return Err(err);
        }

        let isolation = Arc::clone(&self.isolation);
        let ws = workspace.clone();
        blocking_with_timeout(git_timeout, move || isolation.integrate(&ws, &base)).await
    }

    async fn fail_task(&mut self, task_id: &TaskId, worker: Option<WorkerId>, err: &Error) {
        self.deadlines.remove(task_id);
        if let Err(e) = self.state.graph.mark_failed(task_id, TaskError::from(err)) {
            mlog_error!("Cannot fail {}: {}", task_id, e);
            return;
        }
        self.state.counters.failed += 1;
        self.state.record_error(Some(task_id), worker, err);
        self.dirty = true;
        self.release_workspace(task_id).await;
    }

    async fn requeue_task(&mut self, task_id: &TaskId) {
        self.deadlines.remove(task_id);
        match self.state.graph.requeue(task_id) {
            Ok(()) => {
                self.state.counters.requeued += 1;
                mlog!("Task {} returned to pending", task_id);
                self.release_workspace(task_id).await;
            }
            Err(e) => mlog_warn!("Cannot requeue {}: {}", task_id, e),
        }
    }

    /// Return a worker to idle, or retire it past the failure threshold.
    fn worker_finished(&mut self, worker: WorkerId, failed: bool) {
        let _ = self.state.pool.mark_idle(worker);
        if !failed {
            let _ = self.state.pool.record_success(worker);
            return;
        }
        let streak = match self.state.pool.record_failure(worker) {
            Ok(streak) => streak,
            Err(_) => return,
        };
        if self.health.should_retire(streak) {
            self.retire(worker, streak);
        }
    }

    fn retire(&mut self, worker: WorkerId, streak: u32) {
        let Some(name) = self.state.pool.get(worker).map(|w| w.name.clone()) else {
            return;
        };
        let reason = format!("retired after {} consecutive failures", streak);
        mlog_warn!("Worker {} ({}) {}", worker, name, reason);
        self.send_to_worker(worker, CoordinatorCommand::WorkerTerminate { reason });
        let _ = self.state.pool.mark_error(worker);
        self.state.counters.workers_retired += 1;
        self.dirty = true;
        self.replace_worker(&name);
    }

    fn provision_worker(&mut self) {
        self.next_worker += 1;
        let name = format!("worker-{}", self.next_worker);
        match self.provisioner.provision(&name) {
            Ok(session) => {
                mlog_debug!("Provisioned {} session={:?}", name, session);
                if let Some(session) = session {
                    self.sessions.insert(name, session);
                }
            }
            Err(e) => {
                mlog_error!("Provisioning {} failed: {}", name, e);
                self.state.record_error(None, None, &e);
            }
        }
    }

    /// Release a worker we started and, if configured, start another.
    fn replace_worker(&mut self, name: &str) {
        if !self.provisioner.active().iter().any(|n| n == name) {
            return;
        }
        if let Err(e) = self.provisioner.release(name) {
            mlog_warn!("Releasing {} failed: {}", name, e);
        }
        self.sessions.remove(name);
        if self.config.replace_retired
            && self.stopping.is_none()
            && self.state.phase == RunPhase::Running
        {
            self.provision_worker();
        }
    }

    fn send_to_worker(&self, worker: WorkerId, command: CoordinatorCommand) {
        let Some(conn) = self.state.pool.get(worker).and_then(|w| w.connection) else {
            return;
        };
        if let Err(e) = self.channel.send(conn, command) {
            mlog_debug!("Send to {} failed: {}", worker, e);
        }
    }

    // ========== Phase ==========

    async fn request_stop(&mut self, mode: StopMode) {
        if self.state.phase != RunPhase::Running || self.stopping == Some(StopMode::Force) {
            return;
        }
        mlog!("Stop requested: {:?}", mode);
        self.stopping = Some(mode);
        self.dirty = true;
        self.cancel_waiting(ErrorKind::Cancelled, "run stopped by operator");

        if mode == StopMode::Force {
            let running: Vec<(TaskId, Option<WorkerId>, u32)> = self
                .state
                .graph
                .running_tasks()
                .into_iter()
                .map(|t| (t.id.clone(), t.assigned_worker, t.generation()))
                .collect();
            for (task_id, worker, generation) in running {
                if let Some(w) = worker {
                    self.send_to_worker(
                        w,
                        CoordinatorCommand::TaskCancel {
                            task_id: task_id.clone(),
                            generation,
                        },
                    );
                    let _ = self.state.pool.mark_idle(w);
                }
                self.deadlines.remove(&task_id);
                let reason = TaskError::new(ErrorKind::Cancelled, "run force-stopped by operator");
                if self.state.graph.mark_cancelled(&task_id, reason).is_ok() {
                    self.state.counters.cancelled += 1;
                }
                self.release_workspace(&task_id).await;
            }
        }
    }

    fn cancel_waiting(&mut self, kind: ErrorKind, reason: &str) {
        let waiting: Vec<TaskId> = self
            .state
            .graph
            .tasks()
            .filter(|t| t.is_waiting())
            .map(|t| t.id.clone())
            .collect();
        for task_id in waiting {
            if self
                .state
                .graph
                .mark_cancelled(&task_id, TaskError::new(kind, reason))
                .is_ok()
            {
                self.state.counters.cancelled += 1;
            }
        }
    }

    /// Dispatch, then decide whether the run is over. Persists if anything
    /// changed.
    async fn settle(&mut self) {
        if self.state.phase.is_terminal() {
            return;
        }
        self.dispatch().await;
        self.state.graph.promote_ready();

        if let Some(phase) = self.evaluate() {
            self.finish(phase).await;
        } else if self.dirty {
            self.persist().await;
        }
    }

    fn evaluate(&mut self) -> Option<RunPhase> {
        if self.state.phase != RunPhase::Running {
            return None;
        }
        let graph = &self.state.graph;

        if graph.is_settled() {
            let stopped_early =
                self.stopping.is_some() && graph.count(TaskStatus::Cancelled) > 0;
            return Some(if stopped_early {
                RunPhase::Failed
            } else {
                RunPhase::Completed
            });
        }

        let running = graph.count(TaskStatus::Running);
        let ready = graph.get_ready_tasks().len();
        if running == 0 && ready == 0 {
            self.cancel_blocked();
            return Some(RunPhase::Failed);
        }

        if ready > 0 && self.state.pool.live_count() == 0 {
            if self.starved_since.is_none() {
                mlog_warn!("{} ready task(s) and no live worker", ready);
                self.starved_since = Some(Instant::now());
            }
        } else {
            self.starved_since = None;
        }
        None
    }

    /// Cancel tasks stuck behind failed dependencies, upstream first.
    fn cancel_blocked(&mut self) {
        let order: Vec<TaskId> = match self.state.graph.topological_sort() {
            Ok(tasks) => tasks
                .into_iter()
                .filter(|t| t.is_waiting())
                .map(|t| t.id.clone())
                .collect(),
            Err(_) => self
                .state
                .graph
                .tasks()
                .filter(|t| t.is_waiting())
                .map(|t| t.id.clone())
                .collect(),
        };
        let blocked = order.len();

        for task_id in order {
            let reason = match self.state.graph.blocked_by_failure(&task_id) {
                Some(dep) => {
                    let status = self
                        .state
                        .graph
                        .get_task(&dep)
                        .map(|t| t.status.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    format!("blocked by {} dependency {}", status, dep)
                }
                None => "cannot progress".to_string(),
            };
            mlog_warn!("Cancelling {}: {}", task_id, reason);
            if self
                .state
                .graph
                .mark_cancelled(&task_id, TaskError::new(ErrorKind::Deadlock, reason))
                .is_ok()
            {
                self.state.counters.cancelled += 1;
            }
        }

        let err = Error::Deadlock(format!(
            "{} task(s) blocked behind failed dependencies",
            blocked
        ));
        mlog_error!("{}", err);
        self.state.record_error(None, None, &err);
    }

    /// Teardown: flush, terminate workers, release sessions, close channel.
    async fn finish(&mut self, phase: RunPhase) {
        if self.state.phase.is_terminal() {
            return;
        }
        self.state.set_phase(phase);
        self.deadlines.clear();
        self.starved_since = None;
        self.persist().await;

        let reason = format!("run {}", phase);
        for conn in self.channel.connections() {
            let _ = self.channel.send(
                conn,
                CoordinatorCommand::WorkerTerminate {
                    reason: reason.clone(),
                },
            );
        }
        if let Err(e) = self.provisioner.release_all() {
            mlog_warn!("Releasing workers failed: {}", e);
        }
        self.sessions.clear();
        self.channel.close();

        mlog!(
            "Run {} {}: {} completed, {} failed, {} cancelled",
            self.state.run_id,
            phase,
            self.state.graph.count(TaskStatus::Completed),
            self.state.graph.count(TaskStatus::Failed),
            self.state.graph.count(TaskStatus::Cancelled)
        );
    }

    async fn persist(&mut self) {
        self.dirty = false;
        self.state.touch();
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&self.state).await {
            mlog_error!("Persisting state failed: {}", e);
        }
    }
}
