//! Phase-partitioned task dispatch for fleets of coding agents.
//!
//! Tasks are scored for urgency, claimed atomically by idle agents, and
//! recovered when their agent stops heartbeating. A single cooperative loop
//! composes the pieces: health pass first, then assignment per phase.
//!
//! # Main types
//!
//! - [`Orchestrator`] — The dispatch loop and the caller-facing API.
//! - [`TaskQueue`] — Task lifecycle, dependency checks, score-ordered selection.
//! - [`AgentStatusManager`] — Agent lifecycle and heartbeat bookkeeping.
//! - [`HealthMonitor`] — Turns stale agents into requeued tasks.
//! - [`PriorityScorer`] — Pure urgency scoring.
//! - [`MemoryStore`] / `SqliteStore` — Persistence backends.

/// Agent state machine and heartbeats.
pub mod agent_status;
/// Runtime configuration.
pub mod config;
/// Dispatch loop.
pub mod engine;
/// Stale-agent and stuck-task recovery.
pub mod health;
/// Urgency scoring.
pub mod scorer;
/// Persistence contract and backends.
pub mod store;
/// Task queue and lifecycle.
pub mod task_queue;
/// Shared domain types (Task, Agent, statuses).
pub mod types;

pub use agent_status::{
    AgentStatistics, AgentStatusManager, Escalation, HealthReport, HeartbeatAck, MissedHeartbeat,
};
pub use config::{ForemanConfig, HealthConfig, LoopConfig, ScoringConfig};
pub use engine::{Assignment, Deregistration, Orchestrator, PhaseFailure, TickReport};
pub use health::{HealthMonitor, HealthPassReport};
pub use scorer::{PriorityScorer, ScoreBreakdown};
pub use store::{AgentStore, MemoryStore, TaskStore};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use task_queue::{is_permanent_error, FailOutcome, TaskCounts, TaskQueue};
pub use types::{
    Agent, AgentId, AgentStatus, HealthStatus, Priority, Task, TaskId, TaskStatus, TaskStatusView,
};
