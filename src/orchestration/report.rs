//! End-of-run summary built from a [`SystemState`] snapshot.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::task::{TaskId, TaskStatus};
use crate::core::worker::WorkerId;
use crate::error::{ErrorKind, Result};
use crate::state::{Counters, RunPhase, SystemState};
use crate::util::truncate;

const TITLE_WIDTH: usize = 40;
const MESSAGE_WIDTH: usize = 72;

/// How `maestro report` prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusTotals {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusTotals {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.running + self.completed + self.failed + self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRow {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_worker: Option<WorkerId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRow {
    pub task_id: Option<TaskId>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub base_branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub totals: StatusTotals,
    pub counters: Counters,
    /// Rows in topological order when the graph allows it.
    pub tasks: Vec<TaskRow>,
    pub errors: Vec<ErrorRow>,
}

impl RunReport {
    pub fn from_state(state: &SystemState) -> Self {
        let mut totals = StatusTotals::default();
        for task in state.graph.tasks() {
            match task.status {
                TaskStatus::Pending => totals.pending += 1,
                TaskStatus::Ready => totals.ready += 1,
                TaskStatus::Running => totals.running += 1,
                TaskStatus::Completed => totals.completed += 1,
                TaskStatus::Failed => totals.failed += 1,
                TaskStatus::Cancelled => totals.cancelled += 1,
            }
        }

        let ordered = state
            .graph
            .topological_sort()
            .unwrap_or_else(|_| state.graph.tasks().collect());
        let tasks = ordered
            .into_iter()
            .map(|t| TaskRow {
                id: t.id.clone(),
                title: t.title.clone(),
                status: t.status,
                attempts: t.attempts,
                last_worker: t.last_worker,
                error: t.error.as_ref().map(|e| format!("{}: {}", e.kind, e.message)),
            })
            .collect();

        let errors = state
            .errors
            .iter()
            .map(|e| ErrorRow {
                task_id: e.task_id.clone(),
                kind: e.kind,
                message: e.message.clone(),
            })
            .collect();

        Self {
            run_id: state.run_id,
            phase: state.phase,
            base_branch: state.base_branch.clone(),
            created_at: state.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
            totals,
            counters: state.counters.clone(),
            tasks,
            errors,
        }
    }

    /// Wall time between start and finish, if both happened.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    pub fn render(&self, format: ReportFormat) -> Result<String> {
        match format {
            ReportFormat::Text => Ok(self.render_text()),
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let t = &self.totals;

        let _ = writeln!(out, "╔════════════════════════════════════════════════════════════╗");
        let _ = writeln!(out, "║                        Run Report                          ║");
        let _ = writeln!(out, "╚════════════════════════════════════════════════════════════╝");
        let _ = writeln!(out);
        let _ = writeln!(out, "  Run:         {}", self.run_id);
        let _ = writeln!(out, "  Phase:       {}", self.phase);
        if let Some(base) = &self.base_branch {
            let _ = writeln!(out, "  Base:        {}", base);
        }
        let _ = writeln!(out, "  Created:     {}", format_time(self.created_at));
        if let Some(started) = self.started_at {
            let _ = writeln!(out, "  Started:     {}", format_time(started));
        }
        if let Some(finished) = self.finished_at {
            let _ = writeln!(out, "  Finished:    {}", format_time(finished));
        }
        if let Some(duration) = self.duration() {
            let _ = writeln!(out, "  Duration:    {}s", duration.num_seconds());
        }
        let _ = writeln!(
            out,
            "  Tasks:       {} total, {} completed, {} failed, {} cancelled, {} running, {} waiting",
            t.total(),
            t.completed,
            t.failed,
            t.cancelled,
            t.running,
            t.pending + t.ready
        );
        let c = &self.counters;
        let _ = writeln!(
            out,
            "  Dispatches:  {} ({} requeued, {} late reports discarded)",
            c.dispatched, c.requeued, c.late_reports
        );
        let _ = writeln!(
            out,
            "  Conflicts:   {} auto, {} assisted, {} manual",
            c.conflicts_auto, c.conflicts_assisted, c.conflicts_manual
        );
        let _ = writeln!(
            out,
            "  Workers:     {} registered, {} retired",
            c.workers_registered, c.workers_retired
        );

        if !self.tasks.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "─────────────────────────────────────────────────────────────");
            let _ = writeln!(
                out,
                "  {:<12} {:<width$} {:<10} {:>3}  WORKER",
                "ID",
                "TITLE",
                "STATUS",
                "TRY",
                width = TITLE_WIDTH
            );
            for row in &self.tasks {
                let worker = row
                    .last_worker
                    .map(|w| w.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let _ = writeln!(
                    out,
                    "  {:<12} {:<width$} {:<10} {:>3}  {}",
                    row.id.to_string(),
                    truncate(&row.title, TITLE_WIDTH),
                    row.status.to_string(),
                    row.attempts,
                    worker,
                    width = TITLE_WIDTH
                );
            }
        }

        if !self.errors.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "─────────────────────────────────────────────────────────────");
            let _ = writeln!(out, "  Errors ({}):", self.errors.len());
            for e in &self.errors {
                let task = e
                    .task_id
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let _ = writeln!(
                    out,
                    "    [{}] {}: {}",
                    task,
                    e.kind,
                    truncate(&e.message, MESSAGE_WIDTH)
                );
            }
        }
        out
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
