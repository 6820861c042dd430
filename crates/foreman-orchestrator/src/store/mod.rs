//! Persistence contract for tasks and agents.
//!
//! Writes that change state go through `compare_and_swap_*`: the write lands
//! only if the stored `version` still equals the version the caller read, and
//! the stored version is then bumped by one. This is the single atomicity
//! primitive the queue and the agent manager rely on.

use crate::types::{Agent, AgentId, Task, TaskId, TaskStatus};
use async_trait::async_trait;
use foreman_core::ForemanResult;

/// In-memory store for tests and ephemeral runs.
pub mod memory;
/// SQLite-backed store.
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Stores a new task. Fails if the id already exists.
    async fn insert_task(&self, task: &Task) -> ForemanResult<()>;

    async fn load_task(&self, id: TaskId) -> ForemanResult<Option<Task>>;

    /// All tasks, optionally restricted to one phase.
    async fn load_tasks(&self, phase_id: Option<&str>) -> ForemanResult<Vec<Task>>;

    /// PENDING tasks of a phase.
    async fn load_pending_tasks(&self, phase_id: &str) -> ForemanResult<Vec<Task>>;

    /// Tasks in any of the given statuses, across phases.
    async fn load_tasks_by_status(&self, statuses: &[TaskStatus]) -> ForemanResult<Vec<Task>>;

    /// Writes `task` iff the stored version equals `expected_version`.
    ///
    /// Returns `Ok(false)` when the version moved on (someone else wrote first)
    /// or the task no longer exists.
    async fn compare_and_swap_task(&self, task: &Task, expected_version: u64)
        -> ForemanResult<bool>;
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Stores a new agent. Fails if the id already exists.
    async fn insert_agent(&self, agent: &Agent) -> ForemanResult<()>;

    async fn load_agent(&self, id: AgentId) -> ForemanResult<Option<Agent>>;

    /// All agents, optionally restricted to one phase.
    async fn list_agents(&self, phase_id: Option<&str>) -> ForemanResult<Vec<Agent>>;

    /// Writes `agent` iff the stored version equals `expected_version`.
    async fn compare_and_swap_agent(
        &self,
        agent: &Agent,
        expected_version: u64,
    ) -> ForemanResult<bool>;
}
