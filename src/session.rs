//! Terminal session hosting for out-of-process workers.
//!
//! The orchestrator never talks to tmux directly. It goes through
//! [`SessionHost`], whose stock implementation is [`TmuxHost`]. All methods
//! block; callers on the event loop wrap them in `util::blocking_with_timeout`.

use std::path::Path;
use std::process::{Command, Output};

use crate::{mlog_debug, mlog_trace, mlog_warn, Error, Result};

/// Lines of pane output kept for diagnostics.
pub const CAPTURE_LINES: u16 = 200;

pub trait SessionHost: Send + Sync {
    /// Start a detached session named after `id`, running a shell in
    /// `workdir`. Returns the session handle.
    fn create_session(&self, id: &str, workdir: &Path) -> Result<String>;

    /// Type `text` into the session followed by Enter.
    fn send_command(&self, session: &str, text: &str) -> Result<()>;

    /// Recent output of the session.
    fn capture_output(&self, session: &str) -> Result<String>;

    fn session_exists(&self, session: &str) -> bool;

    /// Kill the session. Killing a session that is already gone succeeds.
    fn kill_session(&self, session: &str) -> Result<()>;

    /// Sessions this host created, including ones left by an earlier run.
    fn list_sessions(&self) -> Result<Vec<String>>;
}

/// [`SessionHost`] backed by tmux. Session names are `<prefix>_<id>`.
#[derive(Debug, Clone)]
pub struct TmuxHost {
    prefix: String,
}

impl TmuxHost {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn session_name(&self, id: &str) -> String {
        let id: String = id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{}_{}", self.prefix, id)
    }
}

fn tmux(args: &[&str]) -> Result<Output> {
    mlog_trace!("tmux {}", args.join(" "));
    Ok(Command::new("tmux").args(args).output()?)
}

/// Run a tmux command that must succeed; `what` names it in the error.
fn tmux_ok(what: &str, session: &str, args: &[&str]) -> Result<Output> {
    let output = tmux(args)?;
    if output.status.success() {
        return Ok(output);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    mlog_warn!("tmux {} failed for '{}': {}", what, session, stderr);
    Err(Error::Tmux(format!("{} '{}': {}", what, session, stderr)))
}

fn is_missing_session(stderr: &str) -> bool {
    stderr.contains("session not found") || stderr.contains("can't find session")
}

impl SessionHost for TmuxHost {
    fn create_session(&self, id: &str, workdir: &Path) -> Result<String> {
        let name = self.session_name(id);
        if self.session_exists(&name) {
            mlog_debug!("replacing stale session {}", name);
            self.kill_session(&name)?;
        }
        let cwd = workdir.display().to_string();
        tmux_ok(
            "new-session",
            &name,
            &["new-session", "-d", "-s", &name, "-c", &cwd],
        )?;
        // The pane outlives the worker so its last output can still be captured.
        let _ = tmux(&["set-option", "-t", &name, "remain-on-exit", "on"]);
        mlog_debug!("session {} started in {}", name, cwd);
        Ok(name)
    }

    fn send_command(&self, session: &str, text: &str) -> Result<()> {
        mlog_debug!("session {} <- {}", session, text);
        tmux_ok("send-keys", session, &["send-keys", "-t", session, "-l", text])?;
        tmux_ok("send-keys", session, &["send-keys", "-t", session, "Enter"])?;
        Ok(())
    }

    fn capture_output(&self, session: &str) -> Result<String> {
        let start = format!("-{}", CAPTURE_LINES);
        let output = tmux_ok(
            "capture-pane",
            session,
            &["capture-pane", "-t", session, "-p", "-S", &start],
        )?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn session_exists(&self, session: &str) -> bool {
        tmux(&["has-session", "-t", session])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn kill_session(&self, session: &str) -> Result<()> {
        let output = tmux(&["kill-session", "-t", session])?;
        if output.status.success() {
            mlog_debug!("session {} killed", session);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_session(&stderr) {
            mlog_debug!("session {} already gone", session);
            return Ok(());
        }
        Err(Error::Tmux(format!("kill-session '{}': {}", session, stderr.trim())))
    }

    fn list_sessions(&self) -> Result<Vec<String>> {
        let output = tmux(&["list-sessions", "-F", "#{session_name}"])?;
        // No server running means no sessions.
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let marker = format!("{}_", self.prefix);
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|s| s.starts_with(&marker))
            .map(String::from)
            .collect())
    }
}

/// Quote `s` for a POSIX shell unless it is plainly safe.
pub(crate) fn shell_escape(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '='));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r#"'"'"'"#))
    }
}
