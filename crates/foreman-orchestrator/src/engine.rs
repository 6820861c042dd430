use crate::agent_status::{AgentStatusManager, HeartbeatAck};
use crate::config::{ForemanConfig, HealthConfig, LoopConfig};
use crate::health::{HealthMonitor, HealthPassReport};
use crate::scorer::PriorityScorer;
use crate::store::{AgentStore, TaskStore};
use crate::task_queue::{FailOutcome, TaskQueue};
use crate::types::{Agent, AgentId, AgentStatus, Task, TaskId, TaskStatusView};
use chrono::{DateTime, Utc};
use foreman_core::{Event, EventBus, EventKind, ForemanError, ForemanResult};
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// One successful claim made by the loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub phase_id: String,
    pub score: f64,
}

/// A phase whose processing failed during a tick. Other phases still ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseFailure {
    pub phase_id: String,
    pub error: String,
}

/// Summary of one orchestrator tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub health: HealthPassReport,
    /// Set when the health pass failed for a reason other than storage.
    pub health_error: Option<String>,
    pub assignments: Vec<Assignment>,
    /// Claims lost to a concurrent writer and re-selected.
    pub conflicts: usize,
    pub scores_refreshed: usize,
    pub failed_phases: Vec<PhaseFailure>,
}

#[derive(Default)]
struct PhaseOutcome {
    assignments: Vec<Assignment>,
    conflicts: usize,
    scores_refreshed: usize,
}

/// Result of [`Orchestrator::deregister_agent`].
#[derive(Debug, Clone, Serialize)]
pub struct Deregistration {
    pub agent: Agent,
    pub requeued_tasks: Vec<TaskId>,
}

/// The dispatch loop and the caller-facing API around it.
///
/// Each tick runs the health pass and then, phase by phase, hands the best
/// ready task to each available agent. A failing or panicking phase is
/// logged and skipped; the loop itself never stops on a single failure.
pub struct Orchestrator {
    queue: Arc<TaskQueue>,
    agents: Arc<AgentStatusManager>,
    health: HealthMonitor,
    events: EventBus,
    health_config: HealthConfig,
    loop_config: LoopConfig,
    ticks: AtomicU64,
}

impl Orchestrator {
    /// Wires every component on top of one store.
    pub fn new<S>(store: Arc<S>, config: &ForemanConfig, events: EventBus) -> Self
    where
        S: TaskStore + AgentStore + 'static,
    {
        let task_store: Arc<dyn TaskStore> = store.clone();
        let agent_store: Arc<dyn AgentStore> = store;
        let queue = Arc::new(TaskQueue::new(
            task_store,
            PriorityScorer::new(config.scoring.clone()),
            events.clone(),
        ));
        let agents = Arc::new(AgentStatusManager::new(agent_store, events.clone()));
        Self::from_parts(queue, agents, events, config)
    }

    /// Builds the orchestrator around already constructed components.
    pub fn from_parts(
        queue: Arc<TaskQueue>,
        agents: Arc<AgentStatusManager>,
        events: EventBus,
        config: &ForemanConfig,
    ) -> Self {
        let health = HealthMonitor::new(
            agents.clone(),
            queue.clone(),
            events.clone(),
            config.health.clone(),
        );
        Self {
            queue,
            agents,
            health,
            events,
            health_config: config.health.clone(),
            loop_config: config.orchestrator.clone(),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn agents(&self) -> &Arc<AgentStatusManager> {
        &self.agents
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Configured phases plus every phase with a live agent, sorted.
    pub async fn phases(&self) -> ForemanResult<Vec<String>> {
        let mut phases = self.loop_config.phases.clone();
        phases.extend(self.agents.active_phases().await?);
        phases.sort();
        phases.dedup();
        Ok(phases)
    }

    // --- Loop ---

    pub async fn tick(&self) -> ForemanResult<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Runs one cycle: health pass first, then assignment per phase.
    ///
    /// Returns `Err` only for storage failures that make the whole tick
    /// pointless; per-phase failures are recorded in the report.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> ForemanResult<TickReport> {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };

        match AssertUnwindSafe(self.health.run_pass_at(now))
            .catch_unwind()
            .await
        {
            Ok(Ok(health)) => report.health = health,
            Ok(Err(e)) if e.is_persistence() => return Err(e),
            Ok(Err(e)) => {
                error!(tick, error = %e, "Health pass failed");
                report.health_error = Some(e.to_string());
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(tick, panic = %message, "Health pass panicked");
                report.health_error = Some(message);
            }
        }

        let every = self.loop_config.score_refresh_every_ticks;
        let refresh_scores = every > 0 && tick % every == 0;

        for phase in self.phases().await? {
            let outcome = AssertUnwindSafe(self.process_phase(&phase, now, refresh_scores))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(outcome)) => {
                    report.assignments.extend(outcome.assignments);
                    report.conflicts += outcome.conflicts;
                    report.scores_refreshed += outcome.scores_refreshed;
                }
                Ok(Err(e)) => {
                    error!(tick, phase = %phase, error = %e, "Phase processing failed");
                    report.failed_phases.push(PhaseFailure {
                        phase_id: phase,
                        error: e.to_string(),
                    });
                }
                Err(panic) => {
                    let message = panic_message(&*panic);
                    error!(tick, phase = %phase, panic = %message, "Phase processing panicked");
                    report.failed_phases.push(PhaseFailure {
                        phase_id: phase,
                        error: format!("panic: {message}"),
                    });
                }
            }
        }

        if !report.assignments.is_empty() || !report.failed_phases.is_empty() {
            info!(
                tick,
                assigned = report.assignments.len(),
                conflicts = report.conflicts,
                failed_phases = report.failed_phases.len(),
                "Tick complete"
            );
        } else {
            debug!(tick, "Tick complete, nothing to dispatch");
        }
        Ok(report)
    }

    async fn process_phase(
        &self,
        phase_id: &str,
        now: DateTime<Utc>,
        refresh_scores: bool,
    ) -> ForemanResult<PhaseOutcome> {
        let mut outcome = PhaseOutcome::default();
        if refresh_scores {
            outcome.scores_refreshed = self.queue.refresh_phase_scores(phase_id, now).await?;
        }

        let available = self
            .agents
            .available_agents_at(phase_id, self.health_config.heartbeat_timeout_seconds, now)
            .await?;

        for agent in available {
            let mut conflicts = 0u32;
            while let Some(task) = self
                .queue
                .get_next_ready_for(phase_id, &agent.capabilities, now)
                .await?
            {
                match self.claim(&task, &agent).await {
                    Ok(Some(assignment)) => {
                        outcome.assignments.push(assignment);
                        break;
                    }
                    // The agent itself became unavailable; move on to the next one.
                    Ok(None) => break,
                    Err(e) if e.is_transient() => {
                        conflicts += 1;
                        outcome.conflicts += 1;
                        debug!(task_id = %task.id, agent_id = %agent.id, "Claim conflict, re-selecting");
                        if conflicts >= self.loop_config.max_conflicts_per_agent {
                            warn!(
                                agent_id = %agent.id,
                                phase = phase_id,
                                conflicts,
                                "Too many claim conflicts, skipping agent this tick"
                            );
                            break;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(outcome)
    }

    /// Marks `agent` BUSY with `task`, then claims the task. Returns `None` if
    /// the agent cannot take work any more; a lost claim releases the agent
    /// and surfaces as a transient conflict.
    async fn claim(&self, task: &Task, agent: &Agent) -> ForemanResult<Option<Assignment>> {
        // The agent is reserved first so an in-flight task always has a holder.
        if let Err(e) = self.agents.mark_busy(agent.id, task.id).await {
            if !e.is_caller_error() {
                return Err(e);
            }
            debug!(agent_id = %agent.id, error = %e, "Agent no longer available");
            return Ok(None);
        }
        let task = match self.queue.assign(task.id, agent.id).await {
            Ok(task) => task,
            Err(e) => {
                self.agents.release_task(agent.id, task.id).await?;
                return Err(e);
            }
        };

        info!(
            task_id = %task.id,
            agent_id = %agent.id,
            phase = %task.phase_id,
            score = task.score,
            "Task dispatched"
        );
        self.publish_assigned(&task, agent.id).await;
        Ok(Some(Assignment {
            task_id: task.id,
            agent_id: agent.id,
            phase_id: task.phase_id.clone(),
            score: task.score,
        }))
    }

    async fn publish_assigned(&self, task: &Task, agent_id: AgentId) {
        self.events
            .publish(
                Event::new(EventKind::TaskAssigned, task.id)
                    .with("task_id", task.id.to_string())
                    .with("agent_id", agent_id.to_string())
                    .with("phase_id", task.phase_id.clone()),
            )
            .await;
    }

    /// Drives ticks until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Storage failures back the loop off exponentially (poll interval × 2^n,
    /// capped); the backoff resets after the next successful tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ForemanResult<()> {
        let poll = Duration::from_secs(self.loop_config.poll_interval_seconds.max(1));
        let max_backoff = Duration::from_secs(self.loop_config.max_backoff_seconds);
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut storage_failures: u32 = 0;

        info!(poll_secs = poll.as_secs(), "Orchestrator loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match AssertUnwindSafe(self.tick_at(Utc::now())).catch_unwind().await {
                Ok(Ok(_)) => storage_failures = 0,
                Ok(Err(e)) if e.is_persistence() => {
                    storage_failures += 1;
                    let delay = backoff_delay(poll, storage_failures, max_backoff);
                    error!(
                        error = %e,
                        failures = storage_failures,
                        backoff_secs = delay.as_secs(),
                        "Storage unavailable, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                    ticker.reset();
                }
                Ok(Err(e)) => error!(error = %e, "Tick failed"),
                Err(panic) => error!(panic = %panic_message(&*panic), "Tick panicked"),
            }
        }
        info!("Orchestrator loop stopped");
        Ok(())
    }

    // --- Caller surface ---

    pub async fn enqueue(&self, task: Task) -> ForemanResult<Task> {
        self.queue.enqueue(task).await
    }

    pub async fn register_agent(&self, agent: Agent) -> ForemanResult<Agent> {
        self.agents.register(agent).await
    }

    /// Terminates the agent and requeues whatever it still held.
    pub async fn deregister_agent(&self, agent_id: AgentId) -> ForemanResult<Deregistration> {
        let agent = self.agents.deregister(agent_id).await?;
        let mut requeued_tasks = Vec::new();
        for task in self.queue.in_flight_for_agent(agent_id).await? {
            if let Some(task) = self
                .queue
                .requeue_orphan_if_owned(task.id, agent_id, "agent terminated")
                .await?
            {
                requeued_tasks.push(task.id);
            }
        }
        Ok(Deregistration {
            agent,
            requeued_tasks,
        })
    }

    pub async fn emit_heartbeat(&self, agent_id: AgentId) -> ForemanResult<bool> {
        Ok(self.record_heartbeat(agent_id, None).await?.received)
    }

    /// Records a heartbeat. An agent back from STALE holds nothing, so any
    /// task still assigned to it is requeued right away.
    pub async fn record_heartbeat(
        &self,
        agent_id: AgentId,
        sequence: Option<u64>,
    ) -> ForemanResult<HeartbeatAck> {
        let mut ack = self
            .agents
            .record_heartbeat_at(agent_id, sequence, Utc::now())
            .await?;
        if ack.recovered_from == Some(AgentStatus::Stale) {
            let leftovers = self.queue.in_flight_for_agent(agent_id).await?;
            ack.requeued_tasks = self.health.requeue_unheld(leftovers).await?;
        }
        Ok(ack)
    }

    /// Manual claim on behalf of an agent. The agent must be IDLE; it is
    /// released again if the task cannot be claimed.
    pub async fn assign(&self, task_id: TaskId, agent_id: AgentId) -> ForemanResult<Task> {
        self.agents.mark_busy(agent_id, task_id).await?;
        match self.queue.assign(task_id, agent_id).await {
            Ok(task) => {
                self.publish_assigned(&task, agent_id).await;
                Ok(task)
            }
            Err(e) => {
                self.agents.release_task(agent_id, task_id).await?;
                Err(e)
            }
        }
    }

    pub async fn start(&self, task_id: TaskId) -> ForemanResult<Task> {
        self.queue.start(task_id).await
    }

    /// Completes the task and frees its agent.
    pub async fn complete(&self, task_id: TaskId) -> ForemanResult<Task> {
        let task = self.queue.complete(task_id).await?;
        self.release_owner(&task).await?;
        Ok(task)
    }

    /// Records a failed attempt and frees the agent.
    pub async fn fail(&self, task_id: TaskId, error: &str) -> ForemanResult<FailOutcome> {
        let outcome = self.queue.fail(task_id, error).await?;
        self.release_owner(outcome.task()).await?;
        Ok(outcome)
    }

    pub async fn cancel(&self, task_id: TaskId, reason: &str) -> ForemanResult<Task> {
        let task = self.queue.cancel(task_id, reason).await?;
        self.release_owner(&task).await?;
        Ok(task)
    }

    pub async fn get_status(&self, task_id: TaskId) -> ForemanResult<TaskStatusView> {
        self.queue.get_status(task_id).await
    }

    async fn release_owner(&self, task: &Task) -> ForemanResult<()> {
        let Some(agent_id) = task.last_agent_id else {
            return Ok(());
        };
        match self.agents.release_task(agent_id, task.id).await {
            Ok(_) => Ok(()),
            Err(ForemanError::AgentNotFound(_)) => {
                debug!(agent_id = %agent_id, "Owner of finished task no longer registered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// `poll × 2^failures`, capped at `max`.
pub fn backoff_delay(poll: Duration, failures: u32, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(16));
    poll.saturating_mul(factor).min(max.max(poll))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
