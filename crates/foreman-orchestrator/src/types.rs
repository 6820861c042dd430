use chrono::{DateTime, Duration, Utc};
use foreman_core::ForemanError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque task identifier.
pub type TaskId = Uuid;
/// Opaque agent identifier.
pub type AgentId = Uuid;

/// Dispatch priority of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Discrete score contribution of the priority (before weighting).
    pub fn weight(&self) -> f64 {
        match self {
            Priority::Critical => 1.0,
            Priority::High => 0.75,
            Priority::Medium => 0.5,
            Priority::Low => 0.25,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Priority::Critical),
            "HIGH" => Ok(Priority::High),
            "MEDIUM" => Ok(Priority::Medium),
            "LOW" => Ok(Priority::Low),
            other => Err(ForemanError::Config(format!("unknown priority '{other}'"))),
        }
    }
}

/// Lifecycle state of a task.
///
/// BLOCKED is never stored: a PENDING task whose dependencies are not all
/// COMPLETED is simply skipped during candidate selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    /// Cancelled by request; terminal, never retried.
    Failed,
    /// Retries exhausted or permanent failure; terminal, escalated.
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Dead => "DEAD",
        }
    }

    /// ASSIGNED or RUNNING: the task is held by an agent.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Dead
        )
    }

    /// All statuses, in lifecycle order.
    pub fn all() -> [TaskStatus; 6] {
        [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Dead,
        ]
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::all()
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ForemanError::Config(format!("unknown task status '{s}'")))
    }
}

/// A unit of work in a phase backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub phase_id: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deadline_at: Option<DateTime<Utc>>,
    /// Tasks that must be COMPLETED before this one is eligible.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Capabilities an agent must have to be given this task.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Set iff the task is ASSIGNED or RUNNING.
    #[serde(default)]
    pub assigned_agent_id: Option<AgentId>,
    /// The most recent agent the task was assigned to. Survives release.
    #[serde(default)]
    pub last_agent_id: Option<AgentId>,
    /// Last computed dispatch score. Advisory.
    pub score: f64,
    #[serde(default)]
    pub score_computed_at: Option<DateTime<Utc>>,
    /// Maximum RUNNING time before the task is failed as timed out.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Optimistic concurrency version, bumped by every successful write.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    pub fn new(phase_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            phase_id: phase_id.into(),
            status: TaskStatus::Pending,
            priority: Priority::Medium,
            created_at: Utc::now(),
            deadline_at: None,
            dependencies: BTreeSet::new(),
            required_capabilities: BTreeSet::new(),
            retry_count: 0,
            max_retries: 3,
            assigned_agent_id: None,
            last_agent_id: None,
            score: 0.0,
            score_computed_at: None,
            timeout_seconds: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            version: 0,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline_at: DateTime<Utc>) -> Self {
        self.deadline_at = Some(deadline_at);
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Backdates (or postdates) creation; used when importing existing backlogs.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// PENDING with every dependency in `completed`.
    pub fn is_ready(&self, completed: &HashSet<TaskId>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Seconds since creation, fractional.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.created_at, now)
    }

    /// True when the cached score is missing or older than `ttl_seconds`.
    pub fn score_is_stale(&self, now: DateTime<Utc>, ttl_seconds: u64) -> bool {
        match self.score_computed_at {
            None => true,
            Some(at) => now - at > Duration::seconds(ttl_seconds as i64),
        }
    }

    /// True if the task has run past its timeout.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.timeout_seconds, self.started_at) {
            (TaskStatus::Running, Some(timeout), Some(started)) => {
                seconds_between(started, now) > timeout as f64
            }
            _ => false,
        }
    }

    /// Read-only view exposed to callers.
    pub fn status_view(&self) -> TaskStatusView {
        TaskStatusView {
            task_id: self.id,
            status: self.status,
            score: self.score,
            assigned_agent_id: self.assigned_agent_id,
            retry_count: self.retry_count,
        }
    }
}

/// What `get_status` returns: the externally visible state of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub score: f64,
    pub assigned_agent_id: Option<AgentId>,
    pub retry_count: u32,
}

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Idle,
    Busy,
    Stale,
    Degraded,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "IDLE",
            AgentStatus::Busy => "BUSY",
            AgentStatus::Stale => "STALE",
            AgentStatus::Degraded => "DEGRADED",
            AgentStatus::Terminated => "TERMINATED",
        }
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(&self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        match (self, to) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Idle, Busy) | (Busy, Idle) => true,
            (Idle | Busy | Degraded, Stale) => true,
            (Idle | Busy | Stale, Degraded) => true,
            (Stale, Idle) => true,
            (Degraded, Idle | Busy) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == AgentStatus::Terminated
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health classification derived from heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Stale,
    /// Never heartbeat.
    Unknown,
    /// Heartbeat overdue, not yet stale.
    Timeout,
    /// Missed enough consecutive heartbeats to be written off; the
    /// heartbeat timeout will mark it STALE.
    Unresponsive,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Stale => "stale",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Timeout => "timeout",
            HealthStatus::Unresponsive => "unresponsive",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub agent_type: String,
    pub phase_id: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    /// The single ASSIGNED/RUNNING task held while BUSY.
    #[serde(default)]
    pub current_task_id: Option<TaskId>,
    /// When the agent was last reserved for a task.
    #[serde(default)]
    pub busy_since: Option<DateTime<Utc>>,
    /// Heartbeat intervals missed since the last heartbeat.
    #[serde(default)]
    pub consecutive_missed_heartbeats: u32,
    /// Last sequence number the agent sent, if it numbers its heartbeats.
    #[serde(default)]
    pub sequence_number: Option<u64>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Agent {
    pub fn new(agent_type: impl Into<String>, phase_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_type: agent_type.into(),
            phase_id: phase_id.into(),
            status: AgentStatus::Idle,
            capabilities: BTreeSet::new(),
            last_heartbeat: None,
            health_status: HealthStatus::Unknown,
            current_task_id: None,
            busy_since: None,
            consecutive_missed_heartbeats: 0,
            sequence_number: None,
            registered_at: Utc::now(),
            version: 0,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// True if the agent has every capability the task requires.
    pub fn can_take(&self, task: &Task) -> bool {
        task.required_capabilities.is_subset(&self.capabilities)
    }

    /// Seconds since the last heartbeat, or `None` if it never sent one.
    pub fn seconds_since_heartbeat(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_heartbeat.map(|hb| seconds_between(hb, now))
    }
}

/// Signed seconds from `from` to `to`, with sub-second precision.
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
