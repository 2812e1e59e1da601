//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Scripted coding agents
//! - A fake branch-isolation provider and worker provisioner
//! - An orchestrator harness driven one event at a time

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use git2::{Repository, RepositoryInitOptions};
use tempfile::TempDir;

use maestro::agent::{AgentEvent, AgentOutcome, AgentRequest, AgentStream, CodingAgent};
use maestro::channel::{Assignment, CommunicationChannel, CoordinatorCommand, WorkerLink, WorkerMessage};
use maestro::core::{Task, TaskGraph, TaskId, TaskStatus, Usage, Workspace};
use maestro::git::{BranchIsolation, GitOps, SyncOutcome};
use maestro::orchestration::{ConflictGate, ConflictRules, Orchestrator, OrchestratorConfig, Step};
use maestro::provision::WorkerProvisioner;
use maestro::state::SystemState;
use maestro::Result;

// ========== Git Repositories ==========

/// A git repository on `main` with one commit, plus a worktree directory.
pub struct TestRepo {
    pub dir: TempDir,
    pub worktrees: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let worktrees = TempDir::new().expect("Failed to create worktree directory");
        let path = dir.path().to_path_buf();

        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(&path, &opts).expect("Failed to init git");
        let mut config = repo.config().expect("Failed to open git config");
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();

        std::fs::write(path.join("README.md"), "# Test Repository\n").unwrap();
        GitOps::commit_all(&path, "Initial commit").expect("Failed to commit");

        Self {
            dir,
            worktrees,
            path,
        }
    }

    pub fn git(&self) -> GitOps {
        GitOps::new(&self.path, self.worktrees.path()).expect("Failed to open repository")
    }

    /// Write a file on the checked-out branch and commit it.
    pub fn commit_file(&self, name: &str, content: &str, message: &str) {
        write_file(&self.path, name, content);
        GitOps::commit_all(&self.path, message).expect("Failed to commit");
    }

    /// Content of `file` at the tip of `branch`.
    pub fn read_on(&self, branch: &str, file: &str) -> Option<String> {
        let repo = Repository::open(&self.path).ok()?;
        let object = repo.revparse_single(&format!("{}:{}", branch, file)).ok()?;
        let blob = object.peel_to_blob().ok()?;
        Some(String::from_utf8_lossy(blob.content()).into_owned())
    }
}

pub fn write_file(root: &Path, name: &str, content: &str) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

// ========== Agents ==========

fn success(output: &str) -> AgentStream {
    AgentStream::from_events(vec![
        AgentEvent::ToolCall {
            name: "Write".to_string(),
            input: serde_json::json!({}),
        },
        AgentEvent::Result(AgentOutcome {
            success: true,
            output: output.to_string(),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 20,
                cost_usd: Some(0.01),
            },
        }),
    ])
}

/// Writes `<first line of the prompt>.txt` into the workdir.
pub struct FileAgent;

impl CodingAgent for FileAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentStream> {
        let title = request.prompt.lines().next().unwrap_or("task").trim();
        let name = format!("{}.txt", title.replace(' ', "_"));
        std::fs::write(request.workdir.join(&name), &request.prompt)?;
        Ok(success(&format!("wrote {}", name)))
    }
}

/// Counts invocations and optionally writes a fixed resolution to one file.
#[derive(Default)]
pub struct CountingAgent {
    calls: AtomicUsize,
    resolution: Option<(PathBuf, String)>,
}

impl CountingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolving(file: &str, content: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            resolution: Some((PathBuf::from(file), content.to_string())),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CodingAgent for CountingAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((file, content)) = &self.resolution {
            std::fs::write(request.workdir.join(file), content)?;
        }
        Ok(success("done"))
    }
}

// ========== Isolation ==========

/// Plain directories instead of worktrees. Records integrations.
pub struct FakeIsolation {
    root: TempDir,
    conflicts: Mutex<Vec<PathBuf>>,
    integrated: Mutex<Vec<String>>,
}

impl FakeIsolation {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
            conflicts: Mutex::new(Vec::new()),
            integrated: Mutex::new(Vec::new()),
        }
    }

    /// Report `files` as conflicted once, on the next reconcile.
    pub fn with_conflicts(self, files: &[&str]) -> Self {
        *self.conflicts.lock().unwrap() = files.iter().map(PathBuf::from).collect();
        self
    }

    pub fn integrated(&self) -> Vec<String> {
        self.integrated.lock().unwrap().clone()
    }
}

impl BranchIsolation for FakeIsolation {
    fn create(&self, task_id: &TaskId, _base: &str) -> Result<Workspace> {
        let path = self.root.path().join(task_id.slug());
        std::fs::create_dir_all(&path)?;
        Ok(Workspace {
            path,
            branch: format!("maestro/{}", task_id.slug()),
        })
    }

    fn remove(&self, task_id: &TaskId) -> Result<()> {
        let path = self.root.path().join(task_id.slug());
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn list_conflicts(&self, _path: &Path) -> Result<Vec<PathBuf>> {
        Ok(std::mem::take(&mut *self.conflicts.lock().unwrap()))
    }

    fn sync(&self, _workspace: &Workspace, _base: &str) -> Result<SyncOutcome> {
        Ok(SyncOutcome::UpToDate)
    }

    fn integrate(&self, workspace: &Workspace, _base: &str) -> Result<()> {
        self.integrated.lock().unwrap().push(workspace.branch.clone());
        Ok(())
    }
}

// ========== Provisioning ==========

/// Records provision/release calls; workers are registered by the test.
pub struct RecordingProvisioner {
    log: Arc<Mutex<Vec<String>>>,
    active: Vec<String>,
}

impl RecordingProvisioner {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                log: Arc::clone(&log),
                active: Vec::new(),
            },
            log,
        )
    }
}

impl WorkerProvisioner for RecordingProvisioner {
    fn provision(&mut self, name: &str) -> Result<Option<String>> {
        self.log.lock().unwrap().push(format!("provision {}", name));
        self.active.push(name.to_string());
        Ok(None)
    }

    fn release(&mut self, name: &str) -> Result<()> {
        if self.active.iter().any(|n| n == name) {
            self.log.lock().unwrap().push(format!("release {}", name));
            self.active.retain(|n| n != name);
        }
        Ok(())
    }

    fn capture(&self, name: &str) -> Option<String> {
        Some(format!("last output of {}", name))
    }

    fn active(&self) -> Vec<String> {
        self.active.clone()
    }
}

// ========== Orchestrator Harness ==========

pub struct Harness {
    pub orch: Orchestrator,
    pub isolation: Arc<FakeIsolation>,
    pub provisions: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    pub fn status(&self, id: &str) -> TaskStatus {
        self.orch
            .state()
            .graph
            .get_task(&TaskId::from(id))
            .map(|t| t.status)
            .expect("unknown task")
    }

    pub fn provisions(&self) -> Vec<String> {
        self.provisions.lock().unwrap().clone()
    }

    /// Open a connection, register as `name` and let the loop handle it.
    pub async fn register(&mut self, name: &str) -> WorkerLink {
        let link = self.orch.connector().connect();
        link.send(WorkerMessage::Register {
            name: name.to_string(),
        })
        .unwrap();
        assert_eq!(self.orch.step().await.unwrap(), Step::Continue);
        link
    }

    /// Send a report and handle it.
    pub async fn report(&mut self, link: &WorkerLink, message: WorkerMessage) -> Step {
        link.send(message).unwrap();
        self.orch.step().await.unwrap()
    }
}

pub fn config(workers: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        workers,
        ..Default::default()
    }
}

pub fn harness(tasks: Vec<Task>, config: OrchestratorConfig) -> Harness {
    let state = SystemState::new(TaskGraph::load(tasks).unwrap()).with_base_branch("main");
    harness_with(state, config, FakeIsolation::new(), Arc::new(CountingAgent::new()))
}

pub fn harness_with(
    state: SystemState,
    config: OrchestratorConfig,
    isolation: FakeIsolation,
    agent: Arc<dyn CodingAgent>,
) -> Harness {
    let isolation = Arc::new(isolation);
    let (provisioner, provisions) = RecordingProvisioner::new();
    let orch = Orchestrator::new(
        config,
        state,
        CommunicationChannel::new(),
        isolation.clone(),
        ConflictGate::new(agent, ConflictRules::default()),
        Box::new(provisioner),
    );
    Harness {
        orch,
        isolation,
        provisions,
    }
}

pub fn assignment(link: &mut WorkerLink) -> Assignment {
    match link.try_recv() {
        Some(CoordinatorCommand::TaskAssign { task }) => task,
        other => panic!("expected task_assign, got {:?}", other),
    }
}

pub fn completed(task: &Assignment) -> WorkerMessage {
    WorkerMessage::TaskCompleted {
        task_id: task.id.clone(),
        generation: task.generation,
        output: format!("{} done", task.id),
        usage: Usage::default(),
    }
}

pub fn failed(task: &Assignment, error: &str) -> WorkerMessage {
    WorkerMessage::TaskFailed {
        task_id: task.id.clone(),
        generation: task.generation,
        error: error.to_string(),
    }
}

// ========== Task Sets ==========

/// `1 -> {2, 3} -> 4`.
pub fn diamond() -> Vec<Task> {
    vec![
        Task::new("1", "schema"),
        Task::new("2", "api").with_dependencies(["1"]),
        Task::new("3", "ui").with_dependencies(["1"]),
        Task::new("4", "docs").with_dependencies(["2", "3"]),
    ]
}

/// `a -> b -> c`.
pub fn chain() -> Vec<Task> {
    vec![
        Task::new("a", "first"),
        Task::new("b", "second").with_dependencies(["a"]),
        Task::new("c", "third").with_dependencies(["b"]),
    ]
}

pub fn independent(ids: &[&str]) -> Vec<Task> {
    ids.iter().map(|id| Task::new(*id, id)).collect()
}
