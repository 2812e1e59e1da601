//! Tiered conflict gate.
//!
//! After a worker reports completion, the base branch is merged into the
//! task branch and every conflicted file passes through the gate before the
//! task branch may be integrated:
//!
//! - Level 1 (auto): lock and generated artifacts, and files whose conflict
//!   hunks differ only in whitespace. Resolved by keeping the task side.
//! - Level 2 (assisted): other text files with well-formed markers. Handed to
//!   the coding agent; accepted only when no markers remain afterwards.
//! - Level 3 (manual): binary content, modify/delete, malformed markers,
//!   manual-only paths, too many hunks. Never resolved automatically.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::Repository;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::{drain, AgentConstraints, AgentEvent, AgentRequest, CodingAgent};
use crate::util::blocking;
use crate::{mlog, mlog_debug, mlog_trace, mlog_warn, Error, Result};

/// Lock files and build output that are safe to take from the task side.
pub const DEFAULT_GENERATED_PATTERNS: &[&str] = &[
    r"(^|/)Cargo\.lock$",
    r"(^|/)package-lock\.json$",
    r"(^|/)npm-shrinkwrap\.json$",
    r"(^|/)yarn\.lock$",
    r"(^|/)pnpm-lock\.yaml$",
    r"(^|/)go\.sum$",
    r"(^|/)poetry\.lock$",
    r"(^|/)Gemfile\.lock$",
    r"(^|/)composer\.lock$",
    r"\.min\.(js|css)$",
    r"(^|/)dist/",
];

/// Paths that always need a human.
pub const DEFAULT_MANUAL_PATTERNS: &[&str] = &[r"(^|/)\.gitmodules$", r"(^|/)migrations/"];

pub const DEFAULT_MAX_ASSISTED_HUNKS: usize = 10;

/// Reason recorded when any file needs a human.
pub const MANUAL_CONFLICT: &str = "manual conflict";

const START_MARKER: &str = "<<<<<<<";
const BASE_MARKER: &str = "|||||||";
const SEPARATOR: &str = "=======";
const END_MARKER: &str = ">>>>>>>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictLevel {
    Auto = 1,
    Assisted = 2,
    Manual = 3,
}

impl ConflictLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ConflictLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictLevel::Auto => "auto",
            ConflictLevel::Assisted => "assisted",
            ConflictLevel::Manual => "manual",
        };
        write!(f, "{} ({})", self.as_u8(), s)
    }
}

/// Classification of one conflicted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Path relative to the workspace root.
    pub file: PathBuf,
    pub level: ConflictLevel,
    /// Raw marker text of every hunk, empty when the file has none.
    pub markers: String,
    pub reason: String,
}

/// Result of running the gate over a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GateOutcome {
    pub resolved: bool,
    /// Highest level seen. `None` when there was nothing to resolve.
    pub level: Option<ConflictLevel>,
    pub records: Vec<ConflictRecord>,
    pub agent_invocations: usize,
    /// Why the gate refused, when it did.
    pub reason: Option<String>,
}

impl GateOutcome {
    fn passed(records: Vec<ConflictRecord>, agent_invocations: usize) -> Self {
        let level = records.iter().map(|r| r.level).max();
        Self {
            resolved: true,
            level,
            records,
            agent_invocations,
            reason: None,
        }
    }

    fn refused(
        level: ConflictLevel,
        records: Vec<ConflictRecord>,
        agent_invocations: usize,
        reason: String,
    ) -> Self {
        Self {
            resolved: false,
            level: Some(level),
            records,
            agent_invocations,
            reason: Some(reason),
        }
    }

    /// The error a refused outcome fails its task with.
    pub fn error(&self) -> Option<Error> {
        if self.resolved {
            return None;
        }
        Some(Error::ConflictUnresolved {
            level: self.level.map(ConflictLevel::as_u8).unwrap_or(3),
            reason: self
                .reason
                .clone()
                .unwrap_or_else(|| MANUAL_CONFLICT.to_string()),
        })
    }
}

/// Path rules feeding classification.
#[derive(Debug, Clone)]
pub struct ConflictRules {
    generated: Vec<Regex>,
    manual_only: Vec<Regex>,
    max_assisted_hunks: usize,
}

impl Default for ConflictRules {
    fn default() -> Self {
        Self {
            generated: compile_builtin(DEFAULT_GENERATED_PATTERNS),
            manual_only: compile_builtin(DEFAULT_MANUAL_PATTERNS),
            max_assisted_hunks: DEFAULT_MAX_ASSISTED_HUNKS,
        }
    }
}

fn compile_builtin(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map_err(|e| Error::Validation(format!("invalid conflict pattern '{}': {}", p, e)))
        })
        .collect()
}

impl ConflictRules {
    /// Rules from user-supplied regex lists.
    ///
    /// # Errors
    /// Returns `Error::Validation` for a pattern that does not compile.
    pub fn from_patterns(
        generated: &[String],
        manual_only: &[String],
        max_assisted_hunks: usize,
    ) -> Result<Self> {
        Ok(Self {
            generated: compile(generated)?,
            manual_only: compile(manual_only)?,
            max_assisted_hunks,
        })
    }

    pub fn max_assisted_hunks(&self) -> usize {
        self.max_assisted_hunks
    }

    pub fn is_generated(&self, file: &Path) -> bool {
        let path = normalize(file);
        self.generated.iter().any(|re| re.is_match(&path))
    }

    pub fn is_manual_only(&self, file: &Path) -> bool {
        let path = normalize(file);
        self.manual_only.iter().any(|re| re.is_match(&path))
    }
}

fn normalize(file: &Path) -> String {
    file.to_string_lossy().replace('\\', "/")
}

// ========== Marker parsing ==========

/// One conflict hunk in diff3 (or plain merge) style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub ours: String,
    pub base: Option<String>,
    pub theirs: String,
    /// The hunk exactly as written, markers included.
    pub raw: String,
}

impl Hunk {
    /// Both sides are equal once whitespace is ignored.
    pub fn is_whitespace_only(&self) -> bool {
        let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        strip(&self.ours) == strip(&self.theirs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Conflict(Hunk),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Start,
    Base,
    Separator,
    End,
}

fn marker(line: &str) -> Option<Marker> {
    let line = line.trim_end_matches(['\n', '\r']);
    let labelled = |prefix: &str| {
        line.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(' '))
    };
    if labelled(START_MARKER) {
        Some(Marker::Start)
    } else if labelled(BASE_MARKER) {
        Some(Marker::Base)
    } else if line == SEPARATOR {
        Some(Marker::Separator)
    } else if labelled(END_MARKER) {
        Some(Marker::End)
    } else {
        None
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Outside,
    Ours,
    Base,
    Theirs,
}

fn parse_segments(content: &str) -> std::result::Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut hunk: Option<Hunk> = None;
    let mut section = Section::Outside;

    for (idx, line) in content.split_inclusive('\n').enumerate() {
        let lineno = idx + 1;
        let found = marker(line);

        match (section, found) {
            (Section::Outside, Some(Marker::Start)) => {
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                hunk = Some(Hunk {
                    ours: String::new(),
                    base: None,
                    theirs: String::new(),
                    raw: line.to_string(),
                });
                section = Section::Ours;
                continue;
            }
            (Section::Outside, Some(Marker::Base | Marker::End)) => {
                return Err(format!("marker outside a conflict at line {}", lineno));
            }
            (Section::Outside, _) => {
                text.push_str(line);
                continue;
            }
            (_, Some(Marker::Start)) => {
                return Err(format!("nested conflict start at line {}", lineno));
            }
            _ => {}
        }

        let Some(current) = hunk.as_mut() else {
            return Err(format!("lost conflict state at line {}", lineno));
        };
        current.raw.push_str(line);

        match (section, found) {
            (Section::Ours, Some(Marker::Base)) => {
                current.base = Some(String::new());
                section = Section::Base;
            }
            (Section::Ours | Section::Base, Some(Marker::Separator)) => {
                section = Section::Theirs;
            }
            (Section::Theirs, Some(Marker::End)) => {
                if let Some(done) = hunk.take() {
                    segments.push(Segment::Conflict(done));
                }
                section = Section::Outside;
            }
            (_, Some(m)) => {
                return Err(format!("unexpected {:?} marker at line {}", m, lineno));
            }
            (Section::Ours, None) => current.ours.push_str(line),
            (Section::Base, None) => {
                if let Some(base) = current.base.as_mut() {
                    base.push_str(line);
                }
            }
            (Section::Theirs, None) => current.theirs.push_str(line),
            (Section::Outside, None) => {}
        }
    }

    if section != Section::Outside {
        return Err("unterminated conflict at end of file".to_string());
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

/// Conflict hunks of `content`, or why the markers are malformed.
pub fn parse_hunks(content: &str) -> std::result::Result<Vec<Hunk>, String> {
    Ok(parse_segments(content)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Conflict(h) => Some(h),
            Segment::Text(_) => None,
        })
        .collect())
}

/// Whether any conflict start, base or end marker remains.
pub fn has_markers(content: &str) -> bool {
    content
        .split_inclusive('\n')
        .any(|line| matches!(marker(line), Some(Marker::Start | Marker::Base | Marker::End)))
}

fn keep_ours(segments: Vec<Segment>) -> String {
    segments
        .into_iter()
        .map(|s| match s {
            Segment::Text(t) => t,
            Segment::Conflict(h) => h.ours,
        })
        .collect()
}

// ========== Classification ==========

/// What the gate will do with one file.
#[derive(Debug)]
enum Plan {
    /// Level 1: write these bytes, or delete the file when `None`.
    Auto(Option<Vec<u8>>),
    Assisted { content: String, hunks: Vec<Hunk> },
    Manual,
}

enum OursSide {
    Blob(Vec<u8>),
    Deleted,
    Unknown,
}

/// The task side of a conflicted path, read from the index.
fn ours_from_index(workdir: &Path, file: &Path) -> OursSide {
    let Ok(repo) = Repository::open(workdir) else {
        return OursSide::Unknown;
    };
    let Ok(index) = repo.index() else {
        return OursSide::Unknown;
    };
    let Ok(conflicts) = index.conflicts() else {
        return OursSide::Unknown;
    };
    let wanted = normalize(file);
    for conflict in conflicts.flatten() {
        let entry_path = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
            .map(|e| String::from_utf8_lossy(&e.path).into_owned());
        if entry_path.as_deref() != Some(wanted.as_str()) {
            continue;
        }
        return match conflict.our {
            Some(entry) => match repo.find_blob(entry.id) {
                Ok(blob) => OursSide::Blob(blob.content().to_vec()),
                Err(_) => OursSide::Unknown,
            },
            None => OursSide::Deleted,
        };
    }
    OursSide::Unknown
}

fn classify(rules: &ConflictRules, workdir: &Path, file: &Path) -> (ConflictRecord, Plan) {
    let record = |level, markers: String, reason: &str| ConflictRecord {
        file: file.to_path_buf(),
        level,
        markers,
        reason: reason.to_string(),
    };

    if rules.is_manual_only(file) {
        return (
            record(ConflictLevel::Manual, String::new(), "path is manual-only"),
            Plan::Manual,
        );
    }

    let full = workdir.join(file);
    let bytes = std::fs::read(&full).ok();

    if rules.is_generated(file) {
        match ours_from_index(workdir, file) {
            OursSide::Blob(ours) => {
                return (
                    record(ConflictLevel::Auto, String::new(), "generated artifact"),
                    Plan::Auto(Some(ours)),
                );
            }
            OursSide::Deleted => {
                return (
                    record(ConflictLevel::Auto, String::new(), "generated artifact removed"),
                    Plan::Auto(None),
                );
            }
            OursSide::Unknown => {
                // Not in the index; fall back to the markers in the file.
                if let Some(text) = bytes.as_deref().and_then(|b| std::str::from_utf8(b).ok()) {
                    if let Ok(segments) = parse_segments(text) {
                        return (
                            record(ConflictLevel::Auto, raw_markers(&segments), "generated artifact"),
                            Plan::Auto(Some(keep_ours(segments).into_bytes())),
                        );
                    }
                }
            }
        }
    }

    let Some(bytes) = bytes else {
        return (
            record(ConflictLevel::Manual, String::new(), "file deleted on one side"),
            Plan::Manual,
        );
    };
    if bytes.contains(&0) {
        return (
            record(ConflictLevel::Manual, String::new(), "binary content"),
            Plan::Manual,
        );
    }
    let Ok(content) = String::from_utf8(bytes) else {
        return (
            record(ConflictLevel::Manual, String::new(), "content is not UTF-8"),
            Plan::Manual,
        );
    };

    let segments = match parse_segments(&content) {
        Ok(segments) => segments,
        Err(reason) => {
            return (
                record(ConflictLevel::Manual, String::new(), &format!("malformed markers: {}", reason)),
                Plan::Manual,
            );
        }
    };
    let markers = raw_markers(&segments);
    let hunks: Vec<Hunk> = segments
        .iter()
        .filter_map(|s| match s {
            Segment::Conflict(h) => Some(h.clone()),
            Segment::Text(_) => None,
        })
        .collect();

    if hunks.is_empty() {
        return (
            record(ConflictLevel::Manual, markers, "conflicted but no markers in file"),
            Plan::Manual,
        );
    }
    if hunks.iter().all(Hunk::is_whitespace_only) {
        return (
            record(ConflictLevel::Auto, markers, "whitespace-only changes"),
            Plan::Auto(Some(keep_ours(segments).into_bytes())),
        );
    }
    if hunks.len() > rules.max_assisted_hunks() {
        let reason = format!(
            "{} hunks exceed the assisted limit of {}",
            hunks.len(),
            rules.max_assisted_hunks()
        );
        return (record(ConflictLevel::Manual, markers, &reason), Plan::Manual);
    }

    (
        record(ConflictLevel::Assisted, markers, "source conflict"),
        Plan::Assisted { content, hunks },
    )
}

fn raw_markers(segments: &[Segment]) -> String {
    segments
        .iter()
        .filter_map(|s| match s {
            Segment::Conflict(h) => Some(h.raw.as_str()),
            Segment::Text(_) => None,
        })
        .collect()
}

fn apply_auto(workdir: &Path, file: &Path, content: Option<&[u8]>) -> Result<()> {
    let full = workdir.join(file);
    match content {
        Some(bytes) => std::fs::write(&full, bytes)?,
        None => {
            if full.exists() {
                std::fs::remove_file(&full)?;
            }
        }
    }
    Ok(())
}

/// Prompt for an assisted resolution of one file.
fn assisted_prompt(file: &Path, content: &str, hunks: &[Hunk]) -> String {
    let mut prompt = format!(
        "You are resolving a git merge conflict in `{}`.\n\n\
         \"Ours\" is the task branch, \"theirs\" is the base branch it is being merged with. \
         Keep the intent of both sides where they are compatible.\n\n",
        file.display()
    );

    for (i, hunk) in hunks.iter().enumerate() {
        prompt.push_str(&format!("## Hunk {}\n\n### Ours\n```\n{}```\n\n", i + 1, hunk.ours));
        if let Some(base) = &hunk.base {
            prompt.push_str(&format!("### Common ancestor\n```\n{}```\n\n", base));
        }
        prompt.push_str(&format!("### Theirs\n```\n{}```\n\n", hunk.theirs));
    }

    prompt.push_str(&format!(
        "## Current file with conflict markers\n```\n{}\n```\n\n\
         ## Instructions\n\n\
         1. Edit `{}` in place so it contains the merged result\n\
         2. Remove every conflict marker line (`<<<<<<<`, `|||||||`, `=======`, `>>>>>>>`)\n\
         3. Do not touch any other file and do not commit\n",
        content,
        file.display()
    ));
    prompt
}

// ========== Gate ==========

/// Decides whether a workspace's conflicts can be resolved without a human.
pub struct ConflictGate {
    agent: Arc<dyn CodingAgent>,
    rules: ConflictRules,
}

impl ConflictGate {
    /// Create a gate that hands level-2 conflicts to `agent`.
    ///
    /// # Example
    /// ```ignore
    /// let gate = ConflictGate::new(Arc::new(ClaudeHeadless::new()?), ConflictRules::default());
    /// let outcome = gate.run(&workspace.path, &conflicts, &cancel).await?;
    /// ```
    pub fn new(agent: Arc<dyn CodingAgent>, rules: ConflictRules) -> Self {
        Self { agent, rules }
    }

    pub fn rules(&self) -> &ConflictRules {
        &self.rules
    }

    /// Classify and resolve `conflicts` (paths relative to `workdir`).
    ///
    /// Every file is classified before anything is written. If any file is
    /// level 3 the gate refuses at once, without touching the tree or
    /// invoking the agent. Otherwise level-1 files are rewritten in place and
    /// each level-2 file gets one agent invocation.
    ///
    /// # Returns
    /// * `resolved: true` - every conflict is gone from the working tree
    /// * `resolved: false` - the task must not be merged; see `reason`
    ///
    /// # Errors
    /// `Error::Cancelled` if `cancel` fires during an agent invocation, and
    /// I/O errors from rewriting files.
    pub async fn run(
        &self,
        workdir: &Path,
        conflicts: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<GateOutcome> {
        if conflicts.is_empty() {
            mlog_debug!("ConflictGate: no conflicts in {}", workdir.display());
            return Ok(GateOutcome::passed(Vec::new(), 0));
        }

        let rules = self.rules.clone();
        let dir = workdir.to_path_buf();
        let files = conflicts.to_vec();
        let classified = blocking(move || {
            Ok(files
                .iter()
                .map(|f| classify(&rules, &dir, f))
                .collect::<Vec<_>>())
        })
        .await?;

        let records: Vec<ConflictRecord> = classified.iter().map(|(r, _)| r.clone()).collect();
        for record in &records {
            mlog!(
                "ConflictGate: {} -> level {} ({})",
                record.file.display(),
                record.level,
                record.reason
            );
        }

        if records.iter().any(|r| r.level == ConflictLevel::Manual) {
            mlog_warn!(
                "ConflictGate: {} needs manual resolution",
                workdir.display()
            );
            return Ok(GateOutcome::refused(
                ConflictLevel::Manual,
                records,
                0,
                MANUAL_CONFLICT.to_string(),
            ));
        }

        let mut assisted = Vec::new();
        for (record, plan) in classified {
            match plan {
                Plan::Auto(content) => apply_auto(workdir, &record.file, content.as_deref())?,
                Plan::Assisted { content, hunks } => assisted.push((record.file, content, hunks)),
                Plan::Manual => {}
            }
        }

        let mut invocations = 0;
        for (file, content, hunks) in assisted {
            invocations += 1;
            if let Err(reason) = self.assist(workdir, &file, &content, &hunks, cancel).await? {
                mlog_warn!("ConflictGate: assisted resolution of {} failed: {}", file.display(), reason);
                return Ok(GateOutcome::refused(
                    ConflictLevel::Assisted,
                    records,
                    invocations,
                    reason,
                ));
            }
        }

        mlog!(
            "ConflictGate: resolved {} file(s) in {} ({} agent call(s))",
            records.len(),
            workdir.display(),
            invocations
        );
        Ok(GateOutcome::passed(records, invocations))
    }

    /// One agent pass over one file. The inner `Err` is a refusal reason.
    async fn assist(
        &self,
        workdir: &Path,
        file: &Path,
        content: &str,
        hunks: &[Hunk],
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<(), String>> {
        let request = AgentRequest::new(assisted_prompt(file, content, hunks), workdir)
            .with_constraints(AgentConstraints {
                allowed_tools: vec!["Read".to_string(), "Edit".to_string(), "Write".to_string()],
                max_turns: Some(20),
            });

        let mut stream = match self.agent.invoke(&request) {
            Ok(stream) => stream,
            Err(e) => return Ok(Err(format!("agent could not start: {}", e))),
        };
        let outcome = match drain(&mut stream, cancel, |event| {
            if let AgentEvent::ToolCall { name, .. } = event {
                mlog_trace!("ConflictGate: agent tool call {} on {}", name, file.display());
            }
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => return Ok(Err(e.to_string())),
        };

        if !outcome.success {
            return Ok(Err(format!("agent reported failure: {}", outcome.output)));
        }

        let after = match tokio::fs::read_to_string(workdir.join(file)).await {
            Ok(after) => after,
            Err(e) => return Ok(Err(format!("cannot re-read {}: {}", file.display(), e))),
        };
        if has_markers(&after) {
            return Ok(Err(format!(
                "conflict markers remain in {}",
                file.display()
            )));
        }
        Ok(Ok(()))
    }
}
