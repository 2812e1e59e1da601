//! Starting and releasing workers.
//!
//! The orchestrator asks a [`WorkerProvisioner`] for workers by name; the
//! workers then register over the channel like any other. In-process
//! workers are tokio tasks on the in-memory transport. Session workers are
//! `maestro worker` processes in tmux sessions talking over the Unix socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::CodingAgent;
use crate::channel::Connector;
use crate::session::{shell_escape, SessionHost};
use crate::worker::WorkerRunner;
use crate::{mlog, mlog_debug, mlog_warn, Result};

pub trait WorkerProvisioner: Send {
    /// Start a worker that will register as `name`. Returns its session
    /// handle, if it runs in one.
    fn provision(&mut self, name: &str) -> Result<Option<String>>;

    /// Stop the worker started as `name`. Unknown names are ignored.
    fn release(&mut self, name: &str) -> Result<()>;

    /// Recent output of the worker, for diagnostics.
    fn capture(&self, name: &str) -> Option<String>;

    /// Names of workers started and not yet released.
    fn active(&self) -> Vec<String>;

    fn release_all(&mut self) -> Result<()> {
        for name in self.active() {
            self.release(&name)?;
        }
        Ok(())
    }
}

/// Runs workers as tokio tasks over in-memory links.
pub struct InProcessProvisioner {
    connector: Connector,
    agent: Arc<dyn CodingAgent>,
    heartbeat_interval: Duration,
    workers: HashMap<String, (CancellationToken, JoinHandle<Result<()>>)>,
}

impl InProcessProvisioner {
    pub fn new(connector: Connector, agent: Arc<dyn CodingAgent>, heartbeat_interval: Duration) -> Self {
        Self {
            connector,
            agent,
            heartbeat_interval,
            workers: HashMap::new(),
        }
    }
}

impl WorkerProvisioner for InProcessProvisioner {
    fn provision(&mut self, name: &str) -> Result<Option<String>> {
        mlog_debug!("InProcessProvisioner::provision name={}", name);
        let link = self.connector.connect();
        let cancel = CancellationToken::new();
        let runner = WorkerRunner::new(name, Arc::clone(&self.agent), self.heartbeat_interval);
        let handle = tokio::spawn(runner.run(link, cancel.clone()));
        self.workers.insert(name.to_string(), (cancel, handle));
        Ok(None)
    }

    fn release(&mut self, name: &str) -> Result<()> {
        if let Some((cancel, _handle)) = self.workers.remove(name) {
            mlog_debug!("InProcessProvisioner::release name={}", name);
            cancel.cancel();
        }
        Ok(())
    }

    fn capture(&self, _name: &str) -> Option<String> {
        None
    }

    fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Runs `maestro worker` in one terminal session per worker.
pub struct SessionProvisioner {
    host: Arc<dyn SessionHost>,
    /// Binary to run, normally the current executable.
    program: PathBuf,
    socket: PathBuf,
    workdir: PathBuf,
    debug: bool,
    sessions: HashMap<String, String>,
}

impl SessionProvisioner {
    pub fn new(host: Arc<dyn SessionHost>, program: &Path, socket: &Path, workdir: &Path) -> Self {
        Self {
            host,
            program: program.to_path_buf(),
            socket: socket.to_path_buf(),
            workdir: workdir.to_path_buf(),
            debug: false,
            sessions: HashMap::new(),
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Shell line that starts the worker process.
    pub fn worker_command(&self, name: &str) -> String {
        let mut args = vec![
            self.program.display().to_string(),
            "worker".to_string(),
            "--socket".to_string(),
            self.socket.display().to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        if self.debug {
            args.push("--debug".to_string());
        }
        args.iter()
            .map(|a| shell_escape(a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Kill sessions with this host's prefix left over from an earlier run.
    pub fn reap_stale(&self) -> Result<usize> {
        let stale = self.host.list_sessions()?;
        for session in &stale {
            mlog_warn!("Killing stale worker session {}", session);
            self.host.kill_session(session)?;
        }
        Ok(stale.len())
    }
}

impl WorkerProvisioner for SessionProvisioner {
    fn provision(&mut self, name: &str) -> Result<Option<String>> {
        let session = self.host.create_session(name, &self.workdir)?;
        let command = self.worker_command(name);
        if let Err(e) = self.host.send_command(&session, &command) {
            let _ = self.host.kill_session(&session);
            return Err(e);
        }
        mlog!("Worker {} started in session {}", name, session);
        self.sessions.insert(name.to_string(), session.clone());
        Ok(Some(session))
    }

    fn release(&mut self, name: &str) -> Result<()> {
        if let Some(session) = self.sessions.remove(name) {
            mlog_debug!("SessionProvisioner::release name={} session={}", name, session);
            self.host.kill_session(&session)?;
        }
        Ok(())
    }

    fn capture(&self, name: &str) -> Option<String> {
        let session = self.sessions.get(name)?;
        self.host.capture_output(session).ok()
    }

    fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort();
        names
    }
}
