//! maestro: a coordinator that runs a dependency graph of coding tasks
//! across a pool of agent workers.
//!
//! Tasks are read from a task file into a [`core::TaskGraph`]. The
//! [`orchestration::Orchestrator`] dispatches ready tasks to workers over a
//! [`channel::CommunicationChannel`], gives each task an isolated git
//! worktree, and merges finished work into the base branch only after the
//! [`orchestration::ConflictGate`] approves it. Run state is snapshotted to
//! disk after every transition so a crashed coordinator can resume.

pub mod agent;
pub mod channel;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod provision;
pub mod session;
pub mod state;
pub mod util;
pub mod worker;

pub use error::{Error, ErrorKind, Result};
