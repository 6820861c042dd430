//! Bridges agent liveness to task recovery.

use crate::agent_status::{AgentStatusManager, MissedHeartbeat};
use crate::config::HealthConfig;
use crate::task_queue::TaskQueue;
use crate::types::{seconds_between, Agent, AgentId, AgentStatus, Task, TaskId};
use chrono::{DateTime, Utc};
use foreman_core::{Event, EventBus, EventKind, ForemanError, ForemanResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one health pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthPassReport {
    pub stale_agents: Vec<AgentId>,
    /// Agents whose missed-heartbeat count went up, with the rung reached.
    pub missed_heartbeats: Vec<MissedHeartbeat>,
    /// In-flight tasks returned to PENDING because their owner is gone.
    pub requeued_tasks: Vec<TaskId>,
    pub timed_out_tasks: Vec<TaskId>,
    /// ASSIGNED tasks that were never started in time.
    pub reclaimed_assignments: Vec<TaskId>,
    /// BUSY agents freed from a reservation whose claim never landed.
    pub released_agents: Vec<AgentId>,
}

impl HealthPassReport {
    pub fn is_empty(&self) -> bool {
        self.stale_agents.is_empty()
            && self.missed_heartbeats.is_empty()
            && self.requeued_tasks.is_empty()
            && self.timed_out_tasks.is_empty()
            && self.reclaimed_assignments.is_empty()
            && self.released_agents.is_empty()
    }
}

/// Runs before every assignment pass so no orphaned task stays stuck in flight.
pub struct HealthMonitor {
    agents: Arc<AgentStatusManager>,
    queue: Arc<TaskQueue>,
    events: EventBus,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        agents: Arc<AgentStatusManager>,
        queue: Arc<TaskQueue>,
        events: EventBus,
        config: HealthConfig,
    ) -> Self {
        Self {
            agents,
            queue,
            events,
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// One idempotent pass. Safe to run every tick.
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> ForemanResult<HealthPassReport> {
        let mut report = HealthPassReport::default();
        let timeout = self.config.heartbeat_timeout_seconds;

        for agent in self.agents.detect_stale_at(timeout, now).await? {
            self.events
                .publish(
                    Event::new(EventKind::AgentStale, agent.id)
                        .with("agent_id", agent.id.to_string())
                        .with(
                            "last_heartbeat",
                            agent.last_heartbeat.map(|hb| hb.to_rfc3339()),
                        ),
                )
                .await;
            report.stale_agents.push(agent.id);
        }

        report.requeued_tasks = self.requeue_orphans().await?;

        report.missed_heartbeats = self
            .agents
            .check_missed_heartbeats_at(&self.config, now)
            .await?;

        report.timed_out_tasks = self.fail_timed_out(now).await?;
        report.reclaimed_assignments = self.reclaim_unstarted(now).await?;
        report.released_agents = self.release_dangling(now).await?;

        if !report.is_empty() {
            info!(
                stale = report.stale_agents.len(),
                missed = report.missed_heartbeats.len(),
                requeued = report.requeued_tasks.len(),
                timed_out = report.timed_out_tasks.len(),
                reclaimed = report.reclaimed_assignments.len(),
                released = report.released_agents.len(),
                "Health pass"
            );
        }
        Ok(report)
    }

    /// Requeues every in-flight task whose owner no longer holds it.
    async fn requeue_orphans(&self) -> ForemanResult<Vec<TaskId>> {
        let in_flight = self.queue.in_flight_tasks().await?;
        self.requeue_unheld(in_flight).await
    }

    /// Requeues those of `tasks` that their owner does not hold any more.
    ///
    /// `tasks` must be read before this call: agents are reserved before a
    /// claim is written, so an owner read afterwards still points at its task
    /// unless it lost it (STALE, TERMINATED, unknown, or recovered empty-handed).
    pub async fn requeue_unheld(&self, tasks: Vec<Task>) -> ForemanResult<Vec<TaskId>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let owners: HashMap<AgentId, Agent> = self
            .agents
            .list(None)
            .await?
            .into_iter()
            .map(|a| (a.id, a))
            .collect();

        let mut requeued = Vec::new();
        for task in tasks {
            let Some(agent_id) = task.assigned_agent_id else {
                continue;
            };
            let Some(reason) = orphan_reason(owners.get(&agent_id), task.id) else {
                continue;
            };
            if let Some(task) = self.queue.requeue_orphan_if_unchanged(&task, reason).await? {
                requeued.push(task.id);
            }
        }
        Ok(requeued)
    }

    /// Fails RUNNING tasks past their timeout through the normal retry path.
    async fn fail_timed_out(&self, now: DateTime<Utc>) -> ForemanResult<Vec<TaskId>> {
        let mut failed = Vec::new();
        for task in self.queue.timed_out_tasks(now).await? {
            let owner = task.assigned_agent_id;
            match self.queue.fail(task.id, "timeout").await {
                Ok(outcome) => {
                    warn!(
                        task_id = %task.id,
                        timeout_seconds = ?task.timeout_seconds,
                        dead = outcome.is_dead(),
                        "Task timed out"
                    );
                    self.events
                        .publish(
                            Event::new(EventKind::TaskTimedOut, task.id)
                                .with("task_id", task.id.to_string())
                                .with("timeout_seconds", task.timeout_seconds),
                        )
                        .await;
                    if let Some(agent_id) = owner {
                        self.release(agent_id, task.id).await?;
                    }
                    failed.push(task.id);
                }
                // The agent reported in between the scan and the write.
                Err(ForemanError::InvalidTransition { .. }) => {
                    debug!(task_id = %task.id, "Timed-out task already moved on");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }

    async fn reclaim_unstarted(&self, now: DateTime<Utc>) -> ForemanResult<Vec<TaskId>> {
        let mut reclaimed = Vec::new();
        for task in self
            .queue
            .stale_assignments(now, self.config.assignment_timeout_seconds)
            .await?
        {
            let Some(agent_id) = task.assigned_agent_id else {
                continue;
            };
            if self
                .queue
                .requeue_orphan_if_owned(task.id, agent_id, "assignment not started")
                .await?
                .is_some()
            {
                self.release(agent_id, task.id).await?;
                reclaimed.push(task.id);
            }
        }
        Ok(reclaimed)
    }

    /// Frees BUSY agents reserved longer than the assignment timeout for a task
    /// that never became theirs (a claim interrupted between its two writes).
    async fn release_dangling(&self, now: DateTime<Utc>) -> ForemanResult<Vec<AgentId>> {
        let grace = self.config.assignment_timeout_seconds as f64;
        let mut released = Vec::new();
        for agent in self.agents.list(None).await? {
            let (AgentStatus::Busy, Some(task_id), Some(since)) =
                (agent.status, agent.current_task_id, agent.busy_since)
            else {
                continue;
            };
            if seconds_between(since, now) <= grace {
                continue;
            }
            let held = match self.queue.get(task_id).await {
                Ok(task) => task.status.is_in_flight() && task.assigned_agent_id == Some(agent.id),
                Err(ForemanError::TaskNotFound(_)) => false,
                Err(e) => return Err(e),
            };
            if !held && self.agents.release_task(agent.id, task_id).await?.is_some() {
                warn!(agent_id = %agent.id, task_id = %task_id, "Released agent from a claim that never landed");
                released.push(agent.id);
            }
        }
        Ok(released)
    }

    async fn release(&self, agent_id: AgentId, task_id: TaskId) -> ForemanResult<()> {
        match self.agents.release_task(agent_id, task_id).await {
            Ok(_) | Err(ForemanError::AgentNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Why an in-flight task counts as orphaned, or `None` if its owner still holds it.
fn orphan_reason(owner: Option<&Agent>, task_id: TaskId) -> Option<&'static str> {
    match owner {
        None => Some("agent unknown"),
        Some(agent) if agent.status == AgentStatus::Stale => Some("agent stale"),
        Some(agent) if agent.status == AgentStatus::Terminated => Some("agent terminated"),
        Some(agent) if agent.current_task_id != Some(task_id) => Some("agent no longer holds task"),
        Some(_) => None,
    }
}
