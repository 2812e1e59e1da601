//! Coding-agent capability.
//!
//! A [`CodingAgent`] turns a prompt and a working directory into a stream of
//! [`AgentEvent`]s ending in a single [`AgentEvent::Result`]. The stock
//! implementation drives the Claude Code CLI in headless mode
//! (`-p ... --output-format stream-json --verbose`) and parses its output
//! line by line.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::task::Usage;
use crate::error::{Error, Result};
use crate::{mlog_debug, mlog_trace};

/// Default timeout for one agent invocation (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Upper bound on events consumed from one stream.
pub const MAX_STREAM_EVENTS: usize = 10_000;

/// Limits passed through to the agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentConstraints {
    /// Tools the agent may use. Empty means the agent's own default.
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub constraints: AgentConstraints,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, workdir: &Path) -> Self {
        Self {
            prompt: prompt.into(),
            workdir: workdir.to_path_buf(),
            constraints: AgentConstraints::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: AgentConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Terminal result of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub success: bool,
    /// Final text output, or the failure description.
    pub output: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    AssistantText(String),
    ToolCall {
        name: String,
        input: serde_json::Value,
    },
    Result(AgentOutcome),
}

/// Events from one agent invocation.
///
/// Owns the agent process, if any; dropping the stream kills it.
pub struct AgentStream {
    rx: mpsc::Receiver<AgentEvent>,
    child: Option<Child>,
}

impl AgentStream {
    /// Stream fed by an arbitrary producer. The stream ends when every
    /// sender is dropped.
    pub fn new(rx: mpsc::Receiver<AgentEvent>) -> Self {
        Self { rx, child: None }
    }

    /// Stream over a fixed list of events.
    pub fn from_events(events: Vec<AgentEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.try_send(event);
        }
        Self::new(rx)
    }

    fn with_child(rx: mpsc::Receiver<AgentEvent>, child: Child) -> Self {
        Self {
            rx,
            child: Some(child),
        }
    }

    /// Kill the backing process, if there is one.
    pub async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill().await;
        }
    }
}

impl Stream for AgentStream {
    type Item = AgentEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// A coding agent that can be handed a prompt and a working directory.
pub trait CodingAgent: Send + Sync {
    /// Start an invocation. Must be called from within a tokio runtime.
    fn invoke(&self, request: &AgentRequest) -> Result<AgentStream>;
}

/// Consume a stream until its terminal result.
///
/// `on_event` sees every event, including the result. Exits early on
/// cancellation (`Error::Cancelled`, the process is killed), on a stream
/// that ends without a result, or after [`MAX_STREAM_EVENTS`] events.
pub async fn drain<F>(
    stream: &mut AgentStream,
    cancel: &CancellationToken,
    mut on_event: F,
) -> Result<AgentOutcome>
where
    F: FnMut(&AgentEvent),
{
    for _ in 0..MAX_STREAM_EVENTS {
        tokio::select! {
            _ = cancel.cancelled() => {
                stream.kill().await;
                return Err(Error::Cancelled);
            }
            next = stream.next() => match next {
                Some(event) => {
                    on_event(&event);
                    if let AgentEvent::Result(outcome) = event {
                        return Ok(outcome);
                    }
                }
                None => {
                    return Err(Error::Agent("agent exited without a result".to_string()));
                }
            }
        }
    }

    stream.kill().await;
    Err(Error::Agent(format!(
        "agent produced more than {} events",
        MAX_STREAM_EVENTS
    )))
}

/// Claude Code in headless `stream-json` mode.
///
/// # Example
///
/// ```ignore
/// use maestro::agent::{AgentRequest, ClaudeHeadless, CodingAgent};
///
/// let claude = ClaudeHeadless::new()?;
/// let mut stream = claude.invoke(&AgentRequest::new("Fix the failing test", &workdir))?;
/// let outcome = maestro::agent::drain(&mut stream, &cancel, |_| {}).await?;
/// ```
#[derive(Debug, Clone)]
pub struct ClaudeHeadless {
    /// Path to the Claude binary.
    binary: PathBuf,
}

impl ClaudeHeadless {
    /// Locate `claude` on PATH.
    pub fn new() -> Result<Self> {
        Self::from_command("claude")
    }

    /// Locate an arbitrary command on PATH (or take it as a path).
    pub fn from_command(command: &str) -> Result<Self> {
        let binary = which::which(command).map_err(|_| Error::AgentBinaryNotFound)?;
        Ok(Self { binary })
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if !request.constraints.allowed_tools.is_empty() {
            cmd.arg("--allowedTools")
                .arg(request.constraints.allowed_tools.join(","));
        }
        if let Some(turns) = request.constraints.max_turns {
            cmd.arg("--max-turns").arg(turns.to_string());
        }
        cmd.current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl CodingAgent for ClaudeHeadless {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentStream> {
        let mut child = self.command(request).spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Agent("agent stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                for event in parse_stream_line(&line) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    mlog_debug!("agent stderr: {}", line);
                }
            });
        }

        Ok(AgentStream::with_child(rx, child))
    }
}

// ========== stream-json parsing ==========

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawStreamLine {
    Assistant {
        message: RawMessage,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<RawUsage>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawContent {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Events carried by one line of `stream-json` output.
///
/// System, user and unknown lines produce nothing; so do lines that are not
/// JSON at all.
pub fn parse_stream_line(line: &str) -> Vec<AgentEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let raw: RawStreamLine = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            mlog_trace!("agent: skipping unparseable line ({}): {}", e, line);
            return Vec::new();
        }
    };

    match raw {
        RawStreamLine::Assistant { message } => message
            .content
            .into_iter()
            .filter_map(|item| match item {
                RawContent::Text { text } => Some(AgentEvent::AssistantText(text)),
                RawContent::ToolUse { name, input } => Some(AgentEvent::ToolCall { name, input }),
                RawContent::Other => None,
            })
            .collect(),
        RawStreamLine::Result {
            subtype,
            result,
            is_error,
            total_cost_usd,
            usage,
        } => {
            let success = !is_error && subtype.as_deref() == Some("success");
            let output = match result {
                Some(text) => text,
                None => subtype.unwrap_or_else(|| "no result".to_string()),
            };
            let usage = usage.unwrap_or_default();
            vec![AgentEvent::Result(AgentOutcome {
                success,
                output,
                usage: Usage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cost_usd: total_cost_usd,
                },
            })]
        }
        RawStreamLine::Other => Vec::new(),
    }
}
