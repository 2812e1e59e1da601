//! Integration test suite for maestro.
//!
//! These tests drive the coordinator end to end: the orchestrator's event
//! loop with in-memory workers, the merge gate on real git repositories, and
//! recovery from persisted snapshots.
//!
//! # Test Categories
//!
//! - `scheduling`: graph and scheduler scenarios
//! - `orchestrator`: dispatch, timeouts, liveness, stop and teardown
//! - `gate`: conflict gating on real merges
//! - `recovery`: snapshot persistence and resume
//!
//! # CI Compatibility
//!
//! Coding agents are scripted fakes; no test starts a real agent or tmux.

mod fixtures;

mod orchestrator;
mod recovery;
mod scheduling;
