//! Agent lifecycle and heartbeat bookkeeping.

use crate::config::HealthConfig;
use crate::store::AgentStore;
use crate::types::{Agent, AgentId, AgentStatus, HealthStatus, TaskId};
use chrono::{DateTime, Utc};
use foreman_core::{Event, EventBus, EventKind, ForemanError, ForemanResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_WRITE_ATTEMPTS: usize = 8;
/// Upper bound on the sequence numbers listed in one [`HeartbeatAck`].
const MAX_REPORTED_GAPS: u64 = 64;

/// Reply to a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatAck {
    pub agent_id: AgentId,
    /// `false` for unknown or terminated agents.
    pub received: bool,
    pub sequence_number: Option<u64>,
    /// Sequence numbers skipped since the previous heartbeat (first 64 at most).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_sequences: Vec<u64>,
    /// Set when the heartbeat brought the agent back from STALE or DEGRADED.
    pub recovered_from: Option<AgentStatus>,
    /// Tasks the recovered agent no longer holds that went back to PENDING.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requeued_tasks: Vec<TaskId>,
}

impl HeartbeatAck {
    fn rejected(agent_id: AgentId, sequence_number: Option<u64>) -> Self {
        Self {
            agent_id,
            received: false,
            sequence_number,
            missing_sequences: Vec::new(),
            recovered_from: None,
            requeued_tasks: Vec::new(),
        }
    }
}

/// Rung of the missed-heartbeat ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    Warn,
    Degraded,
    Unresponsive,
}

impl Escalation {
    pub fn for_count(missed: u32, config: &HealthConfig) -> Self {
        if missed >= config.unresponsive_after_missed {
            Escalation::Unresponsive
        } else if missed >= config.degraded_after_missed {
            Escalation::Degraded
        } else {
            Escalation::Warn
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Escalation::Warn => "warn",
            Escalation::Degraded => "degraded",
            Escalation::Unresponsive => "unresponsive",
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Escalation::Warn => "monitoring",
            Escalation::Degraded => "no new work until a heartbeat arrives",
            Escalation::Unresponsive => "task recovered at heartbeat timeout",
        }
    }
}

/// One agent whose missed-heartbeat count went up during a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissedHeartbeat {
    pub agent_id: AgentId,
    pub missed_count: u32,
    pub escalation: Escalation,
}

/// Point-in-time health of one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    /// Last heartbeat within the timeout and not terminated.
    pub healthy: bool,
    pub health_status: HealthStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub seconds_since_heartbeat: Option<f64>,
    pub timeout_seconds: u64,
}

/// Heartbeat recency buckets for [`AgentStatistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecentHeartbeats {
    pub last_5_minutes: usize,
    pub last_hour: usize,
    pub last_24_hours: usize,
}

/// Fleet-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentStatistics {
    pub total_agents: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub by_phase: BTreeMap<String, usize>,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Agents that never sent a heartbeat.
    pub unknown: usize,
    pub recent_heartbeats: RecentHeartbeats,
}

/// Owns the agent state machine.
///
/// ```text
/// IDLE <-> BUSY
/// IDLE | BUSY | DEGRADED -> STALE  (heartbeat timeout)
/// STALE -> IDLE                   (heartbeat resumes)
/// IDLE | BUSY | STALE -> DEGRADED (missed heartbeats, external report)
/// DEGRADED -> IDLE | BUSY         (heartbeat resumes)
/// * -> TERMINATED                 (deregistration)
/// ```
pub struct AgentStatusManager {
    store: Arc<dyn AgentStore>,
    events: EventBus,
}

impl AgentStatusManager {
    pub fn new(store: Arc<dyn AgentStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Stores a new IDLE agent. Registration counts as its first heartbeat.
    pub async fn register(&self, mut agent: Agent) -> ForemanResult<Agent> {
        let now = Utc::now();
        agent.status = AgentStatus::Idle;
        agent.health_status = HealthStatus::Healthy;
        agent.last_heartbeat = Some(now);
        agent.current_task_id = None;
        agent.registered_at = now;
        agent.version = 0;
        self.store.insert_agent(&agent).await?;

        info!(
            agent_id = %agent.id,
            agent_type = %agent.agent_type,
            phase = %agent.phase_id,
            "Agent registered"
        );
        self.events
            .publish(
                agent_event(EventKind::AgentRegistered, agent.id)
                    .with("agent_type", agent.agent_type.clone())
                    .with("phase_id", agent.phase_id.clone()),
            )
            .await;
        Ok(agent)
    }

    /// Any state → TERMINATED. The caller requeues whatever the agent held.
    pub async fn deregister(&self, agent_id: AgentId) -> ForemanResult<Agent> {
        let agent = self
            .transition(agent_id, |agent| {
                require(agent, AgentStatus::Terminated)?;
                agent.status = AgentStatus::Terminated;
                agent.current_task_id = None;
                Ok(())
            })
            .await?;

        info!(agent_id = %agent_id, "Agent terminated");
        self.events
            .publish(agent_event(EventKind::AgentTerminated, agent_id))
            .await;
        Ok(agent)
    }

    pub async fn get(&self, agent_id: AgentId) -> ForemanResult<Agent> {
        self.store
            .load_agent(agent_id)
            .await?
            .ok_or_else(|| ForemanError::AgentNotFound(agent_id.to_string()))
    }

    pub async fn list(&self, phase_id: Option<&str>) -> ForemanResult<Vec<Agent>> {
        self.store.list_agents(phase_id).await
    }

    // --- Heartbeats ---

    /// Records a heartbeat. Returns `false` for unknown or terminated agents.
    ///
    /// A STALE agent comes back IDLE (its task was already requeued and is not
    /// handed back). A DEGRADED agent comes back IDLE, or BUSY if it still
    /// holds a task.
    pub async fn emit_heartbeat(&self, agent_id: AgentId) -> ForemanResult<bool> {
        self.emit_heartbeat_at(agent_id, Utc::now()).await
    }

    pub async fn emit_heartbeat_at(
        &self,
        agent_id: AgentId,
        now: DateTime<Utc>,
    ) -> ForemanResult<bool> {
        Ok(self.record_heartbeat_at(agent_id, None, now).await?.received)
    }

    /// Records a heartbeat carrying an optional sequence number and reports
    /// any sequence numbers skipped since the previous one.
    pub async fn record_heartbeat_at(
        &self,
        agent_id: AgentId,
        sequence: Option<u64>,
        now: DateTime<Utc>,
    ) -> ForemanResult<HeartbeatAck> {
        let mut previous = None;
        let mut expected = None;
        let result = self
            .transition(agent_id, |agent| {
                if agent.status.is_terminal() {
                    return Err(ForemanError::invalid_transition(
                        "agent",
                        agent.id,
                        agent.status,
                        "heartbeat",
                    ));
                }
                previous = Some(agent.status);
                expected = agent.sequence_number.map(|seq| seq.saturating_add(1));
                agent.last_heartbeat = Some(now);
                agent.health_status = HealthStatus::Healthy;
                agent.consecutive_missed_heartbeats = 0;
                if sequence.is_some() {
                    agent.sequence_number = sequence;
                }
                match agent.status {
                    AgentStatus::Stale => {
                        agent.status = AgentStatus::Idle;
                        agent.current_task_id = None;
                    }
                    AgentStatus::Degraded => {
                        agent.status = if agent.current_task_id.is_some() {
                            AgentStatus::Busy
                        } else {
                            AgentStatus::Idle
                        };
                    }
                    _ => {}
                }
                Ok(())
            })
            .await;

        let agent = match result {
            Ok(agent) => agent,
            Err(ForemanError::AgentNotFound(_)) => {
                debug!(agent_id = %agent_id, "Heartbeat from unknown agent");
                return Ok(HeartbeatAck::rejected(agent_id, sequence));
            }
            Err(ForemanError::InvalidTransition { .. }) => {
                warn!(agent_id = %agent_id, "Heartbeat from terminated agent ignored");
                return Ok(HeartbeatAck::rejected(agent_id, sequence));
            }
            Err(e) => return Err(e),
        };

        let missing_sequences = match (expected, sequence) {
            (Some(expected), Some(received)) if received > expected => {
                warn!(agent_id = %agent_id, expected, received, "Heartbeat sequence gap");
                self.events
                    .publish(
                        agent_event(EventKind::HeartbeatSequenceGap, agent_id)
                            .with("expected", expected)
                            .with("received", received)
                            .with("missing_count", received - expected),
                    )
                    .await;
                sequence_gap(expected, received)
            }
            _ => Vec::new(),
        };

        let recovered_from = match previous {
            Some(from @ (AgentStatus::Stale | AgentStatus::Degraded)) => Some(from),
            _ => None,
        };
        if let Some(from) = recovered_from {
            info!(agent_id = %agent_id, from = %from, to = %agent.status, "Agent recovered");
            self.events
                .publish(
                    agent_event(EventKind::AgentRecovered, agent_id)
                        .with("previous_status", from.as_str()),
                )
                .await;
        }

        Ok(HeartbeatAck {
            agent_id,
            received: true,
            sequence_number: sequence,
            missing_sequences,
            recovered_from,
            requeued_tasks: Vec::new(),
        })
    }

    /// Health of one agent against `timeout_seconds`. Read-only.
    pub async fn check_health(
        &self,
        agent_id: AgentId,
        timeout_seconds: u64,
    ) -> ForemanResult<HealthReport> {
        self.check_health_at(agent_id, timeout_seconds, Utc::now())
            .await
    }

    pub async fn check_health_at(
        &self,
        agent_id: AgentId,
        timeout_seconds: u64,
        now: DateTime<Utc>,
    ) -> ForemanResult<HealthReport> {
        let agent = self.get(agent_id).await?;
        Ok(health_report(&agent, timeout_seconds, now))
    }

    pub async fn all_health_at(
        &self,
        timeout_seconds: u64,
        now: DateTime<Utc>,
    ) -> ForemanResult<Vec<HealthReport>> {
        Ok(self
            .store
            .list_agents(None)
            .await?
            .iter()
            .map(|agent| health_report(agent, timeout_seconds, now))
            .collect())
    }

    // --- Batch scans ---

    /// Marks every live agent whose heartbeat is older than `timeout_seconds`
    /// (or missing) as STALE and returns the agents that changed.
    pub async fn detect_stale(&self, timeout_seconds: u64) -> ForemanResult<Vec<Agent>> {
        self.detect_stale_at(timeout_seconds, Utc::now()).await
    }

    pub async fn detect_stale_at(
        &self,
        timeout_seconds: u64,
        now: DateTime<Utc>,
    ) -> ForemanResult<Vec<Agent>> {
        let is_stale = |agent: &Agent| {
            matches!(
                agent.status,
                AgentStatus::Idle | AgentStatus::Busy | AgentStatus::Degraded
            ) && agent
                .seconds_since_heartbeat(now)
                .map_or(true, |age| age > timeout_seconds as f64)
        };

        let mut stale = Vec::new();
        for candidate in self.store.list_agents(None).await? {
            if !is_stale(&candidate) {
                continue;
            }
            let result = self
                .transition(candidate.id, |agent| {
                    if !is_stale(agent) {
                        return Err(not_applicable(agent, AgentStatus::Stale));
                    }
                    agent.status = AgentStatus::Stale;
                    agent.health_status = HealthStatus::Stale;
                    agent.current_task_id = None;
                    Ok(())
                })
                .await;
            match result {
                Ok(agent) => {
                    warn!(
                        agent_id = %agent.id,
                        last_heartbeat = ?agent.last_heartbeat,
                        "Agent stale"
                    );
                    stale.push(agent);
                }
                Err(ForemanError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(stale)
    }

    /// Applies the missed-heartbeat ladder to every live agent.
    ///
    /// An agent has missed `floor(age / ttl)` heartbeats, where the TTL depends
    /// on whether it holds a task. Each increase of that count is recorded and
    /// announced once with `HEARTBEAT_MISSED`; reaching `degraded_after_missed`
    /// moves the agent to DEGRADED and reaching `unresponsive_after_missed`
    /// flags it unresponsive. Agents past the heartbeat timeout are left to
    /// [`detect_stale_at`](Self::detect_stale_at).
    pub async fn check_missed_heartbeats_at(
        &self,
        config: &HealthConfig,
        now: DateTime<Utc>,
    ) -> ForemanResult<Vec<MissedHeartbeat>> {
        let missed_now = |agent: &Agent| -> Option<u32> {
            if !matches!(
                agent.status,
                AgentStatus::Idle | AgentStatus::Busy | AgentStatus::Degraded
            ) {
                return None;
            }
            let age = agent.seconds_since_heartbeat(now)?;
            if age > config.heartbeat_timeout_seconds as f64 {
                return None;
            }
            let ttl = config.heartbeat_ttl_seconds(agent.current_task_id.is_some()).max(1);
            let missed = (age / ttl as f64).floor().max(0.0) as u32;
            (missed > agent.consecutive_missed_heartbeats).then_some(missed)
        };

        let mut escalations = Vec::new();
        for candidate in self.store.list_agents(None).await? {
            if missed_now(&candidate).is_none() {
                continue;
            }
            let mut newly_degraded = false;
            let mut count = 0;
            let result = self
                .transition(candidate.id, |agent| {
                    let Some(missed) = missed_now(agent) else {
                        return Err(not_applicable(agent, AgentStatus::Degraded));
                    };
                    count = missed;
                    agent.consecutive_missed_heartbeats = missed;
                    newly_degraded = false;
                    if missed >= config.degraded_after_missed
                        && agent.status != AgentStatus::Degraded
                    {
                        agent.status = AgentStatus::Degraded;
                        newly_degraded = true;
                    }
                    agent.health_status = if missed >= config.unresponsive_after_missed {
                        HealthStatus::Unresponsive
                    } else {
                        HealthStatus::Timeout
                    };
                    Ok(())
                })
                .await;
            let agent = match result {
                Ok(agent) => agent,
                Err(ForemanError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            };

            let escalation = Escalation::for_count(count, config);
            warn!(
                agent_id = %agent.id,
                missed = count,
                escalation = escalation.as_str(),
                "Heartbeat missed"
            );
            self.events
                .publish(
                    agent_event(EventKind::HeartbeatMissed, agent.id)
                        .with("missed_count", count)
                        .with("escalation_level", escalation.as_str())
                        .with("action", escalation.action())
                        .with(
                            "ttl_seconds",
                            config.heartbeat_ttl_seconds(agent.current_task_id.is_some()),
                        ),
                )
                .await;
            if newly_degraded {
                self.announce_degraded(&agent, "missed heartbeats").await;
            }
            escalations.push(MissedHeartbeat {
                agent_id: agent.id,
                missed_count: count,
                escalation,
            });
        }
        Ok(escalations)
    }

    /// External health check says the agent is unhealthy: → DEGRADED.
    pub async fn report_degraded(&self, agent_id: AgentId, reason: &str) -> ForemanResult<Agent> {
        let agent = self
            .transition(agent_id, |agent| {
                require(agent, AgentStatus::Degraded)?;
                agent.status = AgentStatus::Degraded;
                Ok(())
            })
            .await?;
        self.announce_degraded(&agent, reason).await;
        Ok(agent)
    }

    async fn announce_degraded(&self, agent: &Agent, reason: &str) {
        warn!(agent_id = %agent.id, reason, "Agent degraded");
        self.events
            .publish(agent_event(EventKind::AgentDegraded, agent.id).with("reason", reason))
            .await;
    }

    // --- Assignment bookkeeping ---

    /// IDLE → BUSY holding `task_id`.
    pub async fn mark_busy(&self, agent_id: AgentId, task_id: TaskId) -> ForemanResult<Agent> {
        self.transition(agent_id, |agent| {
            if agent.status != AgentStatus::Idle {
                return Err(ForemanError::invalid_transition(
                    "agent",
                    agent.id,
                    agent.status,
                    AgentStatus::Busy,
                ));
            }
            agent.status = AgentStatus::Busy;
            agent.current_task_id = Some(task_id);
            agent.busy_since = Some(Utc::now());
            Ok(())
        })
        .await
    }

    /// BUSY → IDLE.
    pub async fn mark_idle(&self, agent_id: AgentId) -> ForemanResult<Agent> {
        self.transition(agent_id, |agent| {
            if agent.status != AgentStatus::Busy {
                return Err(ForemanError::invalid_transition(
                    "agent",
                    agent.id,
                    agent.status,
                    AgentStatus::Idle,
                ));
            }
            agent.status = AgentStatus::Idle;
            agent.current_task_id = None;
            Ok(())
        })
        .await
    }

    /// Drops `task_id` from the agent if it still holds it; a BUSY agent goes
    /// IDLE, any other state is kept. Returns `None` if there was nothing to release.
    pub async fn release_task(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
    ) -> ForemanResult<Option<Agent>> {
        let result = self
            .transition(agent_id, |agent| {
                if agent.current_task_id != Some(task_id) {
                    return Err(not_applicable(agent, AgentStatus::Idle));
                }
                agent.current_task_id = None;
                if agent.status == AgentStatus::Busy {
                    agent.status = AgentStatus::Idle;
                }
                Ok(())
            })
            .await;
        match result {
            Ok(agent) => Ok(Some(agent)),
            Err(ForemanError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// IDLE agents of a phase with a heartbeat inside `timeout_seconds`, oldest registration first.
    pub async fn available_agents_at(
        &self,
        phase_id: &str,
        timeout_seconds: u64,
        now: DateTime<Utc>,
    ) -> ForemanResult<Vec<Agent>> {
        Ok(self
            .store
            .list_agents(Some(phase_id))
            .await?
            .into_iter()
            .filter(|a| {
                a.status == AgentStatus::Idle
                    && a.seconds_since_heartbeat(now)
                        .is_some_and(|age| age <= timeout_seconds as f64)
            })
            .collect())
    }

    /// Phases that have at least one non-terminated agent.
    pub async fn active_phases(&self) -> ForemanResult<Vec<String>> {
        let mut phases: Vec<String> = self
            .store
            .list_agents(None)
            .await?
            .into_iter()
            .filter(|a| !a.status.is_terminal())
            .map(|a| a.phase_id)
            .collect();
        phases.sort();
        phases.dedup();
        Ok(phases)
    }

    pub async fn statistics_at(
        &self,
        timeout_seconds: u64,
        now: DateTime<Utc>,
    ) -> ForemanResult<AgentStatistics> {
        let agents = self.store.list_agents(None).await?;
        let mut stats = AgentStatistics {
            total_agents: agents.len(),
            ..AgentStatistics::default()
        };

        for agent in &agents {
            *stats
                .by_status
                .entry(agent.status.as_str().to_string())
                .or_insert(0) += 1;
            *stats.by_type.entry(agent.agent_type.clone()).or_insert(0) += 1;
            *stats.by_phase.entry(agent.phase_id.clone()).or_insert(0) += 1;

            match agent.seconds_since_heartbeat(now) {
                None => stats.unknown += 1,
                Some(age) => {
                    if health_report(agent, timeout_seconds, now).healthy {
                        stats.healthy += 1;
                    } else {
                        stats.unhealthy += 1;
                    }
                    if age <= 300.0 {
                        stats.recent_heartbeats.last_5_minutes += 1;
                    }
                    if age <= 3600.0 {
                        stats.recent_heartbeats.last_hour += 1;
                    }
                    if age <= 86_400.0 {
                        stats.recent_heartbeats.last_24_hours += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    async fn transition<F>(&self, agent_id: AgentId, mut apply: F) -> ForemanResult<Agent>
    where
        F: FnMut(&mut Agent) -> ForemanResult<()> + Send,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut agent = self.get(agent_id).await?;
            let expected = agent.version;
            apply(&mut agent)?;
            if self.store.compare_and_swap_agent(&agent, expected).await? {
                agent.version = expected + 1;
                return Ok(agent);
            }
            debug!(agent_id = %agent_id, attempt, "Concurrent agent write, retrying");
        }
        Err(ForemanError::Orchestrator(format!(
            "agent {agent_id}: gave up after {MAX_WRITE_ATTEMPTS} conflicting writes"
        )))
    }
}

fn health_report(agent: &Agent, timeout_seconds: u64, now: DateTime<Utc>) -> HealthReport {
    let since = agent.seconds_since_heartbeat(now);
    let fresh = since.is_some_and(|age| age <= timeout_seconds as f64);
    let health_status = match since {
        None => HealthStatus::Unknown,
        Some(_) if fresh => HealthStatus::Healthy,
        Some(_) => HealthStatus::Stale,
    };
    HealthReport {
        agent_id: agent.id,
        status: agent.status,
        healthy: fresh && !agent.status.is_terminal(),
        health_status,
        last_heartbeat: agent.last_heartbeat,
        seconds_since_heartbeat: since,
        timeout_seconds,
    }
}

/// Sequence numbers in `expected..received`, capped at [`MAX_REPORTED_GAPS`].
fn sequence_gap(expected: u64, received: u64) -> Vec<u64> {
    if received <= expected {
        return Vec::new();
    }
    let end = received.min(expected.saturating_add(MAX_REPORTED_GAPS));
    (expected..end).collect()
}

fn agent_event(kind: EventKind, agent_id: AgentId) -> Event {
    Event::new(kind, agent_id).with("agent_id", agent_id.to_string())
}

fn require(agent: &Agent, to: AgentStatus) -> ForemanResult<()> {
    if agent.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(ForemanError::invalid_transition(
            "agent",
            agent.id,
            agent.status,
            to,
        ))
    }
}

/// The condition that made a scan pick this agent no longer holds.
fn not_applicable(agent: &Agent, to: AgentStatus) -> ForemanError {
    ForemanError::invalid_transition("agent", agent.id, agent.status, to)
}
