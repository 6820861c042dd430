use super::{AgentStore, TaskStore};
use crate::types::{Agent, AgentId, Task, TaskId, TaskStatus};
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Keeps tasks and agents in process memory. Each CAS runs under the write
/// lock, so concurrent callers in the same process are serialized.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    agents: RwLock<HashMap<AgentId, Agent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_creation(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by_key(|t| (t.created_at, t.id));
    tasks
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> ForemanResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(ForemanError::Duplicate(format!("task {}", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_task(&self, id: TaskId) -> ForemanResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn load_tasks(&self, phase_id: Option<&str>) -> ForemanResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(sorted_by_creation(
            tasks
                .values()
                .filter(|t| phase_id.map_or(true, |p| t.phase_id == p))
                .cloned()
                .collect(),
        ))
    }

    async fn load_pending_tasks(&self, phase_id: &str) -> ForemanResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(sorted_by_creation(
            tasks
                .values()
                .filter(|t| t.phase_id == phase_id && t.status == TaskStatus::Pending)
                .cloned()
                .collect(),
        ))
    }

    async fn load_tasks_by_status(&self, statuses: &[TaskStatus]) -> ForemanResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(sorted_by_creation(
            tasks
                .values()
                .filter(|t| statuses.contains(&t.status))
                .cloned()
                .collect(),
        ))
    }

    async fn compare_and_swap_task(
        &self,
        task: &Task,
        expected_version: u64,
    ) -> ForemanResult<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(stored) if stored.version == expected_version => {
                let mut next = task.clone();
                next.version = expected_version + 1;
                *stored = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn insert_agent(&self, agent: &Agent) -> ForemanResult<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent.id) {
            return Err(ForemanError::Duplicate(format!("agent {}", agent.id)));
        }
        agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn load_agent(&self, id: AgentId) -> ForemanResult<Option<Agent>> {
        Ok(self.agents.read().await.get(&id).cloned())
    }

    async fn list_agents(&self, phase_id: Option<&str>) -> ForemanResult<Vec<Agent>> {
        let agents = self.agents.read().await;
        let mut list: Vec<Agent> = agents
            .values()
            .filter(|a| phase_id.map_or(true, |p| a.phase_id == p))
            .cloned()
            .collect();
        list.sort_by_key(|a| (a.registered_at, a.id));
        Ok(list)
    }

    async fn compare_and_swap_agent(
        &self,
        agent: &Agent,
        expected_version: u64,
    ) -> ForemanResult<bool> {
        let mut agents = self.agents.write().await;
        match agents.get_mut(&agent.id) {
            Some(stored) if stored.version == expected_version => {
                let mut next = agent.clone();
                next.version = expected_version + 1;
                *stored = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
