//! Worker health tracking.
//!
//! Workers heartbeat on a fixed interval. A worker that misses
//! `missed_heartbeats` consecutive beats is declared offline. A worker whose
//! tasks keep failing is retired after `retire_after_failures` in a row.
//!
//! The monitor never sleeps on its own. It answers two questions from the
//! pool snapshot: which workers are past their deadline right now, and when
//! the next deadline falls. The Orchestrator arms a single timer from the
//! latter.

use std::time::Duration;

use tokio::time::Instant;

use crate::core::worker::WorkerId;
use crate::orchestration::pool::WorkerPool;

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Consecutive missed beats before a worker goes offline.
pub const DEFAULT_MISSED_HEARTBEATS: u32 = 3;

/// Consecutive task failures before a worker is retired.
pub const DEFAULT_RETIRE_AFTER: u32 = 3;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often workers send `heartbeat`.
    pub heartbeat_interval: Duration,
    /// Beats a worker may miss before it is declared offline.
    pub missed_heartbeats: u32,
    /// Consecutive failures before retirement. Zero disables retirement.
    pub retire_after_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            missed_heartbeats: DEFAULT_MISSED_HEARTBEATS,
            retire_after_failures: DEFAULT_RETIRE_AFTER,
        }
    }
}

impl HealthConfig {
    /// Silence longer than this means the worker is gone (90s by default).
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Live workers whose heartbeat deadline is at or before `now`.
    pub fn expired(&self, pool: &WorkerPool, now: Instant) -> Vec<WorkerId> {
        let timeout = self.config.heartbeat_timeout();
        pool.workers()
            .filter(|w| w.is_live() && w.last_seen + timeout <= now)
            .map(|w| w.id)
            .collect()
    }

    /// Earliest heartbeat deadline across live workers.
    pub fn next_deadline(&self, pool: &WorkerPool) -> Option<Instant> {
        let timeout = self.config.heartbeat_timeout();
        pool.workers()
            .filter(|w| w.is_live())
            .map(|w| w.last_seen + timeout)
            .min()
    }

    /// Whether a failure streak of `consecutive` should retire the worker.
    pub fn should_retire(&self, consecutive: u32) -> bool {
        self.config.retire_after_failures > 0 && consecutive >= self.config.retire_after_failures
    }
}
