use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use maestro::agent::{ClaudeHeadless, CodingAgent};
use maestro::channel::transport::{connect_unix, send_operator, serve_unix};
use maestro::channel::{CommunicationChannel, OperatorRequest};
use maestro::config::Config;
use maestro::core::task::load_task_file;
use maestro::core::TaskGraph;
use maestro::git::GitOps;
use maestro::orchestration::{
    ConflictGate, Orchestrator, OrchestratorConfig, ReportFormat, RunReport, SchedulePolicy,
};
use maestro::provision::{InProcessProvisioner, SessionProvisioner, WorkerProvisioner};
use maestro::session::TmuxHost;
use maestro::state::{RunPhase, StateStore, SystemState};
use maestro::worker::WorkerRunner;
use maestro::{mlog, mlog_error, mlog_warn, Error, Result};

/// maestro - run a graph of coding tasks across parallel agent workers
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.maestro/maestro.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a task file to completion
    Run {
        /// JSON task-definition file
        #[arg(long, required_unless_present = "resume")]
        tasks: Option<PathBuf>,

        /// Number of workers to start
        #[arg(long, short = 'w')]
        workers: Option<usize>,

        /// Ordering of ready tasks
        #[arg(long, value_enum)]
        policy: Option<SchedulePolicy>,

        /// Branch tasks start from and merge into (defaults to HEAD)
        #[arg(long)]
        base: Option<String>,

        /// Run workers as tasks in this process instead of tmux sessions
        #[arg(long)]
        in_process: bool,

        /// Continue the run recorded in the state snapshot
        #[arg(long, conflicts_with = "tasks")]
        resume: bool,
    },

    /// Show the state of the current or last run
    Status,

    /// Ask a running coordinator to stop
    Stop {
        /// Cancel running tasks instead of letting them finish
        #[arg(long)]
        force: bool,
    },

    /// Print the report of the current or last run
    Report {
        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },

    /// Serve tasks as a worker (started by the coordinator)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        socket: PathBuf,

        #[arg(long)]
        name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Worker { name, .. } => maestro::log::init_worker(name, cli.debug),
        _ => maestro::log::init_with_debug(cli.debug),
    }

    // One thread: the orchestrator's event loop is single-threaded by
    // construction. Blocking git and tmux calls go to the blocking pool.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(dispatch(cli));
    if let Err(e) = &result {
        mlog_error!("{}", e);
        if let Some(path) = maestro::log::path() {
            eprintln!("maestro: details in {}", path.display());
        }
    }
    result
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            tasks,
            workers,
            policy,
            base,
            in_process,
            resume,
        } => {
            let options = RunOptions {
                tasks,
                workers,
                policy,
                base,
                in_process,
                resume,
                debug: cli.debug,
            };
            let phase = run_tasks(options).await?;
            if phase == RunPhase::Failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Status => run_status(),
        Command::Stop { force } => run_stop(force).await,
        Command::Report { format } => run_report(format),
        Command::Worker { socket, name } => run_worker(&socket, &name).await,
    }
}

struct RunOptions {
    tasks: Option<PathBuf>,
    workers: Option<usize>,
    policy: Option<SchedulePolicy>,
    base: Option<String>,
    in_process: bool,
    resume: bool,
    debug: bool,
}

async fn run_tasks(options: RunOptions) -> Result<RunPhase> {
    let mut config = Config::load()?;
    if let Some(workers) = options.workers {
        config.workers = workers;
    }
    if let Some(policy) = options.policy {
        config.policy = policy;
    }
    if options.base.is_some() {
        config.base_branch = options.base.clone();
    }
    config.validate()?;
    config.ensure_dirs()?;

    let repo = std::env::current_dir()?;
    let git = GitOps::new(&repo, &config.worktrees_dir()?)?;
    let store = StateStore::new(&config.state_path()?);
    let socket = config.socket_path()?;

    let state = if options.resume {
        resume_state(&store, config.base_branch.as_deref())?
    } else {
        let path = options
            .tasks
            .as_deref()
            .ok_or_else(|| Error::Validation("--tasks is required".to_string()))?;
        fresh_state(&store, path, &git, config.base_branch.as_deref())?
    };

    println!("Run:        {}", state.run_id);
    println!("Repository: {}", git.repo_path().display());
    println!(
        "Base:       {}",
        state.base_branch.as_deref().unwrap_or("-")
    );
    println!("Tasks:      {}", state.graph.task_count());
    println!("Workers:    {}", config.workers);
    println!();

    let agent: Arc<dyn CodingAgent> = Arc::new(ClaudeHeadless::from_command(&config.agent_command)?);
    let gate = ConflictGate::new(Arc::clone(&agent), config.conflicts.rules()?);
    let channel = CommunicationChannel::new();
    let connector = channel.connector();

    let server_cancel = CancellationToken::new();
    let server = {
        let socket = socket.clone();
        let connector = connector.clone();
        let cancel = server_cancel.clone();
        tokio::spawn(async move { serve_unix(&socket, connector, cancel).await })
    };

    let provisioner: Box<dyn WorkerProvisioner> = if options.in_process {
        Box::new(InProcessProvisioner::new(
            connector,
            Arc::clone(&agent),
            config.health().heartbeat_interval,
        ))
    } else {
        which::which("tmux").map_err(|_| {
            Error::Tmux("tmux not found in PATH; pass --in-process to run without it".to_string())
        })?;
        let host = Arc::new(TmuxHost::new(&config.session_prefix));
        let program = std::env::current_exe()?;
        let sessions =
            SessionProvisioner::new(host, &program, &socket, &repo).with_debug(options.debug);
        let reaped = sessions.reap_stale()?;
        if reaped > 0 {
            mlog_warn!("Killed {} stale worker session(s)", reaped);
        }
        Box::new(sessions)
    };

    let mut orchestrator = Orchestrator::new(
        OrchestratorConfig::from(&config),
        state,
        channel,
        Arc::new(git),
        gate,
        provisioner,
    )
    .with_store(store);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                mlog!("Interrupted; stopping after running tasks finish");
                eprintln!("Stopping after running tasks finish (use `maestro stop --force` to cancel them)");
                cancel.cancel();
            }
        });
    }

    let result = orchestrator.run(cancel).await;
    server_cancel.cancel();
    if let Ok(Err(e)) = server.await {
        mlog_warn!("Socket server exited with error: {}", e);
    }

    let phase = result?;
    println!("{}", RunReport::from_state(orchestrator.state()).render_text());
    Ok(phase)
}

fn fresh_state(
    store: &StateStore,
    tasks: &Path,
    git: &GitOps,
    base: Option<&str>,
) -> Result<SystemState> {
    if let Some(previous) = store.load()? {
        if !previous.phase.is_terminal() {
            mlog_warn!(
                "Replacing unfinished run {} ({}); use --resume to continue it",
                previous.run_id,
                previous.phase
            );
        }
    }
    let graph = TaskGraph::load(load_task_file(tasks)?)?;
    let base = match base {
        Some(base) => base.to_string(),
        None => git.current_head()?,
    };
    Ok(SystemState::new(graph).with_base_branch(&base))
}

fn resume_state(store: &StateStore, base: Option<&str>) -> Result<SystemState> {
    let mut state = store.load()?.ok_or_else(|| {
        Error::Validation(format!(
            "no snapshot to resume at {}",
            store.path().display()
        ))
    })?;
    if state.phase.is_terminal() {
        return Err(Error::Validation(format!(
            "run {} already {}",
            state.run_id, state.phase
        )));
    }
    if let Some(base) = base {
        state.base_branch = Some(base.to_string());
    }
    let requeued = state.recover()?;
    println!(
        "Resuming run {} ({} task(s) returned to pending)",
        state.run_id,
        requeued.len()
    );
    Ok(state)
}

fn load_snapshot() -> Result<SystemState> {
    let config = Config::load()?;
    let store = StateStore::new(&config.state_path()?);
    store.load()?.ok_or_else(|| {
        Error::Validation(format!("no run recorded at {}", store.path().display()))
    })
}

fn run_status() -> Result<()> {
    let state = load_snapshot()?;
    let report = RunReport::from_state(&state);
    let t = &report.totals;

    println!("Run:      {}", state.run_id);
    println!("Phase:    {}", state.phase);
    println!(
        "Updated:  {}",
        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "Tasks:    {} completed, {} running, {} waiting, {} failed, {} cancelled",
        t.completed,
        t.running,
        t.pending + t.ready,
        t.failed,
        t.cancelled
    );

    if state.pool.is_empty() {
        return Ok(());
    }
    println!();
    println!(
        "  {:<6} {:<16} {:<8} {:<12} {:>4} {:>4}",
        "ID", "NAME", "STATUS", "TASK", "OK", "FAIL"
    );
    for worker in state.pool.workers() {
        let task = worker
            .current_task
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<6} {:<16} {:<8} {:<12} {:>4} {:>4}",
            worker.id.to_string(),
            worker.name,
            worker.status.to_string(),
            task,
            worker.completed,
            worker.failed
        );
    }
    Ok(())
}

async fn run_stop(force: bool) -> Result<()> {
    let config = Config::load()?;
    let socket = config.socket_path()?;
    send_operator(&socket, OperatorRequest::Stop { force })
        .await
        .map_err(|e| {
            Error::Channel(format!(
                "no coordinator listening on {}: {}",
                socket.display(),
                e
            ))
        })?;
    if force {
        println!("Stop requested: cancelling running tasks");
    } else {
        println!("Stop requested: running tasks will finish first");
    }
    Ok(())
}

fn run_report(format: ReportFormat) -> Result<()> {
    let state = load_snapshot()?;
    println!("{}", RunReport::from_state(&state).render(format)?);
    Ok(())
}

async fn run_worker(socket: &Path, name: &str) -> Result<()> {
    let config = Config::load()?;
    let agent: Arc<dyn CodingAgent> = Arc::new(ClaudeHeadless::from_command(&config.agent_command)?);
    let link = connect_unix(socket).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    mlog!("Worker {} connecting to {}", name, socket.display());
    WorkerRunner::new(name, agent, config.health().heartbeat_interval)
        .run(link, cancel)
        .await
}
