//! Orchestration layer: the coordinator's event loop and the policies it
//! consults.
//!
//! The [`Orchestrator`] owns all run state. The [`Scheduler`] orders ready
//! tasks, the [`WorkerPool`] tracks worker slots, the [`HealthMonitor`]
//! computes liveness deadlines and the [`ConflictGate`] decides whether a
//! finished task may be merged.

pub mod gate;
pub mod health;
mod orchestrator;
pub mod pool;
mod report;
pub mod scheduler;

pub use gate::{ConflictGate, ConflictLevel, ConflictRules, GateOutcome};
pub use health::{HealthConfig, HealthMonitor};
pub use orchestrator::{Orchestrator, OrchestratorConfig, Step, StopMode};
pub use pool::WorkerPool;
pub use report::{ErrorRow, ReportFormat, RunReport, StatusTotals, TaskRow};
pub use scheduler::{SchedulePolicy, Scheduler};
