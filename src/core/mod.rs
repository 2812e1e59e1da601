//! Core domain models for orchestration.
//!
//! Tasks, workers, and the dependency graph that relates tasks. Nothing in
//! here performs I/O.

pub mod graph;
pub mod task;
pub mod worker;

pub use graph::TaskGraph;
pub use task::{Progress, Task, TaskError, TaskId, TaskSpec, TaskStatus, Usage};
pub use worker::{Worker, WorkerId, WorkerStatus, Workspace};
