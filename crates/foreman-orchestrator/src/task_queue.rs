//! Persistent task queue: lifecycle transitions, dependency validation and
//! score-ordered candidate selection.
//!
//! Every state change is a read, a local mutation and a version-checked write
//! ([`TaskStore::compare_and_swap_task`]). `assign` treats a lost write as an
//! [`ForemanError::AssignmentConflict`]; other transitions reload and retry.

use crate::scorer::PriorityScorer;
use crate::store::TaskStore;
use crate::types::{seconds_between, AgentId, Task, TaskId, TaskStatus, TaskStatusView};
use chrono::{DateTime, Utc};
use foreman_core::{Event, EventBus, EventKind, ForemanError, ForemanResult};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reload-and-retry bound for non-claim transitions that keep losing the CAS.
const MAX_WRITE_ATTEMPTS: usize = 8;

/// Substrings of error messages that no amount of retrying will fix.
const PERMANENT_ERROR_PATTERNS: &[&str] = &[
    "permission denied",
    "access denied",
    "authentication failed",
    "authorization failed",
    "syntax error",
    "invalid argument",
    "not found",
    "does not exist",
    "already exists",
    "duplicate key",
    "constraint violation",
    "immutable",
    "read-only",
    "quota exceeded",
    "rate limit exceeded",
];

/// True if `error` describes a failure that retrying cannot fix.
pub fn is_permanent_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    PERMANENT_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Result of [`TaskQueue::fail`].
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Back to PENDING with `retry_count` incremented.
    Retrying(Task),
    /// Retries exhausted or the error was permanent.
    Dead(Task),
}

impl FailOutcome {
    pub fn task(&self) -> &Task {
        match self {
            FailOutcome::Retrying(task) | FailOutcome::Dead(task) => task,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, FailOutcome::Dead(_))
    }
}

/// Per-status task counts. `blocked` is the subset of `pending` waiting on dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub blocked: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
    pub total: usize,
}

/// The task lifecycle owner.
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    scorer: PriorityScorer,
    events: EventBus,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, scorer: PriorityScorer, events: EventBus) -> Self {
        Self {
            store,
            scorer,
            events,
        }
    }

    pub fn scorer(&self) -> &PriorityScorer {
        &self.scorer
    }

    // --- Creation ---

    /// Validates and stores a new PENDING task with its initial score.
    ///
    /// Rejects unknown dependency ids with [`ForemanError::TaskNotFound`] and
    /// dependency loops (including self-dependencies) with
    /// [`ForemanError::DependencyCycle`].
    pub async fn enqueue(&self, mut task: Task) -> ForemanResult<Task> {
        if task.status != TaskStatus::Pending || task.assigned_agent_id.is_some() {
            return Err(ForemanError::invalid_transition(
                "task",
                task.id,
                task.status,
                TaskStatus::Pending,
            ));
        }

        let stored = self.store.load_tasks(None).await?;
        let mut graph: HashMap<TaskId, BTreeSet<TaskId>> = stored
            .iter()
            .map(|t| (t.id, t.dependencies.clone()))
            .collect();
        if graph.contains_key(&task.id) {
            return Err(ForemanError::Duplicate(format!("task {}", task.id)));
        }
        for dep in &task.dependencies {
            if *dep != task.id && !graph.contains_key(dep) {
                return Err(ForemanError::TaskNotFound(dep.to_string()));
            }
        }
        graph.insert(task.id, task.dependencies.clone());

        let mut state = HashMap::new();
        let mut path = Vec::new();
        if let Some(cycle) = find_cycle(task.id, &graph, &mut state, &mut path) {
            return Err(ForemanError::DependencyCycle(
                cycle.iter().map(ToString::to_string).collect(),
            ));
        }

        let blockers = stored
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.dependencies.contains(&task.id))
            .count();
        let now = Utc::now();
        task.score = self.scorer.compute_score(&task, blockers, now);
        task.score_computed_at = Some(now);
        task.version = 0;

        self.store.insert_task(&task).await?;
        info!(
            task_id = %task.id,
            phase = %task.phase_id,
            priority = %task.priority,
            score = task.score,
            "Task enqueued"
        );
        Ok(task)
    }

    // --- Queries ---

    /// Loads a task or fails with [`ForemanError::TaskNotFound`].
    pub async fn get(&self, task_id: TaskId) -> ForemanResult<Task> {
        self.store
            .load_task(task_id)
            .await?
            .ok_or_else(|| ForemanError::TaskNotFound(task_id.to_string()))
    }

    /// Read-only status view.
    pub async fn get_status(&self, task_id: TaskId) -> ForemanResult<TaskStatusView> {
        Ok(self.get(task_id).await?.status_view())
    }

    /// All tasks, optionally restricted to one phase, oldest first.
    pub async fn list(&self, phase_id: Option<&str>) -> ForemanResult<Vec<Task>> {
        self.store.load_tasks(phase_id).await
    }

    /// Number of PENDING tasks that list `task_id` as a dependency.
    pub async fn blocker_count(&self, task_id: TaskId) -> ForemanResult<usize> {
        Ok(self
            .blocker_counts()
            .await?
            .get(&task_id)
            .copied()
            .unwrap_or(0))
    }

    async fn blocker_counts(&self) -> ForemanResult<HashMap<TaskId, usize>> {
        let pending = self
            .store
            .load_tasks_by_status(&[TaskStatus::Pending])
            .await?;
        let mut counts = HashMap::new();
        for task in &pending {
            for dep in &task.dependencies {
                *counts.entry(*dep).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// The subset of `ids` whose tasks are COMPLETED.
    async fn completed_among(
        &self,
        ids: impl IntoIterator<Item = TaskId>,
    ) -> ForemanResult<HashSet<TaskId>> {
        let mut completed = HashSet::new();
        for id in ids {
            if let Some(task) = self.store.load_task(id).await? {
                if task.status == TaskStatus::Completed {
                    completed.insert(id);
                }
            }
        }
        Ok(completed)
    }

    /// Ready tasks of a phase, best first.
    ///
    /// Stale cached scores are recomputed in memory for ordering; persisting
    /// them is left to [`TaskQueue::update_scores`]. Ties go to the oldest task.
    pub async fn ready_candidates(
        &self,
        phase_id: &str,
        now: DateTime<Utc>,
    ) -> ForemanResult<Vec<Task>> {
        let pending = self.store.load_pending_tasks(phase_id).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let deps: HashSet<TaskId> = pending
            .iter()
            .flat_map(|t| t.dependencies.iter().copied())
            .collect();
        let completed = self.completed_among(deps).await?;
        let mut ready: Vec<Task> = pending
            .into_iter()
            .filter(|t| t.is_ready(&completed))
            .collect();
        if ready.is_empty() {
            return Ok(ready);
        }

        let ttl = self.scorer.config().score_ttl_seconds;
        if ready.iter().any(|t| t.score_is_stale(now, ttl)) {
            let blockers = self.blocker_counts().await?;
            for task in ready.iter_mut().filter(|t| t.score_is_stale(now, ttl)) {
                let count = blockers.get(&task.id).copied().unwrap_or(0);
                task.score = self.scorer.compute_score(task, count, now);
            }
        }

        ready.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(ready)
    }

    /// Highest-scoring ready task of the phase.
    pub async fn get_next_ready(&self, phase_id: &str) -> ForemanResult<Option<Task>> {
        self.get_next_ready_at(phase_id, Utc::now()).await
    }

    pub async fn get_next_ready_at(
        &self,
        phase_id: &str,
        now: DateTime<Utc>,
    ) -> ForemanResult<Option<Task>> {
        Ok(self.ready_candidates(phase_id, now).await?.into_iter().next())
    }

    /// Highest-scoring ready task of the phase whose required capabilities
    /// are all in `capabilities`.
    pub async fn get_next_ready_for(
        &self,
        phase_id: &str,
        capabilities: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> ForemanResult<Option<Task>> {
        Ok(self
            .ready_candidates(phase_id, now)
            .await?
            .into_iter()
            .find(|t| t.required_capabilities.is_subset(capabilities)))
    }

    /// RUNNING tasks past their `timeout_seconds`.
    pub async fn timed_out_tasks(&self, now: DateTime<Utc>) -> ForemanResult<Vec<Task>> {
        Ok(self
            .store
            .load_tasks_by_status(&[TaskStatus::Running])
            .await?
            .into_iter()
            .filter(|t| t.is_timed_out(now))
            .collect())
    }

    /// ASSIGNED tasks claimed more than `timeout_seconds` ago and never started.
    pub async fn stale_assignments(
        &self,
        now: DateTime<Utc>,
        timeout_seconds: u64,
    ) -> ForemanResult<Vec<Task>> {
        Ok(self
            .store
            .load_tasks_by_status(&[TaskStatus::Assigned])
            .await?
            .into_iter()
            .filter(|t| {
                t.assigned_at
                    .is_some_and(|at| seconds_between(at, now) > timeout_seconds as f64)
            })
            .collect())
    }

    /// Every ASSIGNED/RUNNING task, across phases.
    pub async fn in_flight_tasks(&self) -> ForemanResult<Vec<Task>> {
        self.store
            .load_tasks_by_status(&[TaskStatus::Assigned, TaskStatus::Running])
            .await
    }

    /// ASSIGNED/RUNNING tasks currently held by `agent_id`.
    pub async fn in_flight_for_agent(&self, agent_id: AgentId) -> ForemanResult<Vec<Task>> {
        Ok(self
            .in_flight_tasks()
            .await?
            .into_iter()
            .filter(|t| t.assigned_agent_id == Some(agent_id))
            .collect())
    }

    /// Per-status counts, optionally restricted to one phase.
    pub async fn counts(&self, phase_id: Option<&str>) -> ForemanResult<TaskCounts> {
        let all = self.store.load_tasks(None).await?;
        let completed: HashSet<TaskId> = all
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect();

        let mut counts = TaskCounts::default();
        for task in all
            .iter()
            .filter(|t| phase_id.map_or(true, |p| t.phase_id == p))
        {
            counts.total += 1;
            match task.status {
                TaskStatus::Pending => {
                    counts.pending += 1;
                    if !task.is_ready(&completed) {
                        counts.blocked += 1;
                    }
                }
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Dead => counts.dead += 1,
            }
        }
        Ok(counts)
    }

    // --- Transitions ---

    /// Claims a PENDING, unassigned, ready task for `agent_id`.
    ///
    /// Fails with [`ForemanError::AssignmentConflict`] if the task is no longer
    /// PENDING or another writer got there first. The caller is responsible
    /// for marking the agent BUSY.
    pub async fn assign(&self, task_id: TaskId, agent_id: AgentId) -> ForemanResult<Task> {
        let mut task = self.get(task_id).await?;
        let conflict = || ForemanError::AssignmentConflict {
            task_id: task_id.to_string(),
        };
        if task.status != TaskStatus::Pending || task.assigned_agent_id.is_some() {
            return Err(conflict());
        }
        let completed = self.completed_among(task.dependencies.iter().copied()).await?;
        if !task.is_ready(&completed) {
            return Err(ForemanError::invalid_transition(
                "task",
                task_id,
                "PENDING (blocked)",
                TaskStatus::Assigned,
            ));
        }

        let expected = task.version;
        task.status = TaskStatus::Assigned;
        task.assigned_agent_id = Some(agent_id);
        task.last_agent_id = Some(agent_id);
        task.assigned_at = Some(Utc::now());
        if !self.store.compare_and_swap_task(&task, expected).await? {
            debug!(task_id = %task_id, agent_id = %agent_id, "Lost assignment race");
            return Err(conflict());
        }
        task.version = expected + 1;

        info!(task_id = %task_id, agent_id = %agent_id, "Task assigned");
        Ok(task)
    }

    /// ASSIGNED → RUNNING.
    pub async fn start(&self, task_id: TaskId) -> ForemanResult<Task> {
        let task = self
            .transition(task_id, |task| {
                require(task, &[TaskStatus::Assigned], TaskStatus::Running)?;
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        info!(task_id = %task_id, "Task started");
        self.publish_task(EventKind::TaskStarted, &task).await;
        Ok(task)
    }

    /// RUNNING → COMPLETED. The releasing agent stays in `last_agent_id`.
    pub async fn complete(&self, task_id: TaskId) -> ForemanResult<Task> {
        let task = self
            .transition(task_id, |task| {
                require(task, &[TaskStatus::Running], TaskStatus::Completed)?;
                task.status = TaskStatus::Completed;
                task.assigned_agent_id = None;
                task.completed_at = Some(Utc::now());
                task.error_message = None;
                Ok(())
            })
            .await?;

        info!(task_id = %task_id, "Task completed");
        self.publish_task(EventKind::TaskCompleted, &task).await;
        Ok(task)
    }

    /// Records a failed attempt.
    ///
    /// Increments `retry_count`; the task goes back to PENDING while
    /// `retry_count < max_retries` and the error is not permanent, otherwise
    /// it goes DEAD and a `TASK_DEAD` event is emitted.
    pub async fn fail(&self, task_id: TaskId, error: &str) -> ForemanResult<FailOutcome> {
        let permanent = is_permanent_error(error);
        let task = self
            .transition(task_id, |task| {
                require(
                    task,
                    &[TaskStatus::Assigned, TaskStatus::Running],
                    TaskStatus::Pending,
                )?;
                task.retry_count += 1;
                task.error_message = Some(error.to_string());
                task.assigned_agent_id = None;
                task.assigned_at = None;
                task.started_at = None;
                if !permanent && task.retry_count < task.max_retries {
                    task.status = TaskStatus::Pending;
                } else {
                    task.status = TaskStatus::Dead;
                    task.completed_at = Some(Utc::now());
                }
                Ok(())
            })
            .await?;

        if task.status == TaskStatus::Dead {
            warn!(
                task_id = %task_id,
                retry_count = task.retry_count,
                permanent,
                error,
                "Task dead"
            );
            self.events
                .publish(
                    task_event(EventKind::TaskDead, &task)
                        .with("retry_count", task.retry_count)
                        .with("error", error)
                        .with("permanent", permanent),
                )
                .await;
            Ok(FailOutcome::Dead(task))
        } else {
            info!(
                task_id = %task_id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                "Task failed, retry scheduled"
            );
            self.events
                .publish(
                    task_event(EventKind::TaskRetryScheduled, &task)
                        .with("retry_count", task.retry_count)
                        .with("error", error),
                )
                .await;
            Ok(FailOutcome::Retrying(task))
        }
    }

    /// Forced ASSIGNED/RUNNING → PENDING without consuming a retry.
    pub async fn requeue_orphan(&self, task_id: TaskId, reason: &str) -> ForemanResult<Task> {
        let task = self
            .transition(task_id, |task| {
                require(
                    task,
                    &[TaskStatus::Assigned, TaskStatus::Running],
                    TaskStatus::Pending,
                )?;
                release_to_pending(task);
                Ok(())
            })
            .await?;
        self.after_requeue(&task, reason).await;
        Ok(task)
    }

    /// Like [`TaskQueue::requeue_orphan`], but only while `agent_id` still holds
    /// the task. Returns `None` if the task moved on in the meantime.
    pub async fn requeue_orphan_if_owned(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        reason: &str,
    ) -> ForemanResult<Option<Task>> {
        self.requeue_orphan_when(task_id, reason, |task| {
            task.status.is_in_flight() && task.assigned_agent_id == Some(agent_id)
        })
        .await
    }

    /// Requeues `seen` only if the stored task is still exactly that version,
    /// so a task released and claimed again since the read is left alone.
    pub async fn requeue_orphan_if_unchanged(
        &self,
        seen: &Task,
        reason: &str,
    ) -> ForemanResult<Option<Task>> {
        self.requeue_orphan_when(seen.id, reason, |task| {
            task.status.is_in_flight() && task.version == seen.version
        })
        .await
    }

    async fn requeue_orphan_when<P>(
        &self,
        task_id: TaskId,
        reason: &str,
        still_orphaned: P,
    ) -> ForemanResult<Option<Task>>
    where
        P: Fn(&Task) -> bool + Send + Sync,
    {
        let result = self
            .transition(task_id, |task| {
                if !still_orphaned(task) {
                    return Err(ForemanError::AssignmentConflict {
                        task_id: task_id.to_string(),
                    });
                }
                release_to_pending(task);
                Ok(())
            })
            .await;

        match result {
            Ok(task) => {
                self.after_requeue(&task, reason).await;
                Ok(Some(task))
            }
            Err(ForemanError::AssignmentConflict { .. }) => {
                debug!(task_id = %task_id, "Task moved on, skipping requeue");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn after_requeue(&self, task: &Task, reason: &str) {
        warn!(task_id = %task.id, reason, "Orphaned task requeued");
        self.events
            .publish(task_event(EventKind::TaskRequeued, task).with("reason", reason))
            .await;
    }

    /// Cancels a non-terminal task: → FAILED. Terminal, never retried.
    pub async fn cancel(&self, task_id: TaskId, reason: &str) -> ForemanResult<Task> {
        let task = self
            .transition(task_id, |task| {
                if task.status.is_terminal() {
                    return Err(ForemanError::invalid_transition(
                        "task",
                        task.id,
                        task.status,
                        TaskStatus::Failed,
                    ));
                }
                task.status = TaskStatus::Failed;
                task.assigned_agent_id = None;
                task.error_message = Some(reason.to_string());
                task.completed_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        info!(task_id = %task_id, reason, "Task cancelled");
        self.events
            .publish(task_event(EventKind::TaskCancelled, &task).with("reason", reason))
            .await;
        Ok(task)
    }

    // --- Scoring ---

    /// Recomputes and persists the score of one task.
    pub async fn update_score(&self, task_id: TaskId, now: DateTime<Utc>) -> ForemanResult<f64> {
        let blockers = self.blocker_count(task_id).await?;
        let scorer = &self.scorer;
        let task = self
            .transition(task_id, |task| {
                task.score = scorer.compute_score(task, blockers, now);
                task.score_computed_at = Some(now);
                Ok(())
            })
            .await?;
        Ok(task.score)
    }

    /// Recomputes and persists scores for a batch. Unknown ids are skipped.
    pub async fn update_scores(
        &self,
        task_ids: &[TaskId],
        now: DateTime<Utc>,
    ) -> ForemanResult<HashMap<TaskId, f64>> {
        let blockers = self.blocker_counts().await?;
        let scorer = &self.scorer;
        let mut scores = HashMap::with_capacity(task_ids.len());

        for &task_id in task_ids {
            let count = blockers.get(&task_id).copied().unwrap_or(0);
            let result = self
                .transition(task_id, |task| {
                    task.score = scorer.compute_score(task, count, now);
                    task.score_computed_at = Some(now);
                    Ok(())
                })
                .await;
            match result {
                Ok(task) => {
                    scores.insert(task_id, task.score);
                }
                Err(ForemanError::TaskNotFound(_)) => {
                    debug!(task_id = %task_id, "Skipping score update for unknown task");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(scores)
    }

    /// Refreshes the persisted score of every PENDING task of a phase.
    pub async fn refresh_phase_scores(
        &self,
        phase_id: &str,
        now: DateTime<Utc>,
    ) -> ForemanResult<usize> {
        let ids: Vec<TaskId> = self
            .store
            .load_pending_tasks(phase_id)
            .await?
            .iter()
            .map(|t| t.id)
            .collect();
        let updated = self.update_scores(&ids, now).await?.len();
        debug!(phase = phase_id, updated, "Scores refreshed");
        Ok(updated)
    }

    // --- Internals ---

    /// Reload, mutate, version-checked write; retried on lost races.
    async fn transition<F>(&self, task_id: TaskId, mut apply: F) -> ForemanResult<Task>
    where
        F: FnMut(&mut Task) -> ForemanResult<()> + Send,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut task = self.get(task_id).await?;
            let expected = task.version;
            apply(&mut task)?;
            if self.store.compare_and_swap_task(&task, expected).await? {
                task.version = expected + 1;
                return Ok(task);
            }
            debug!(task_id = %task_id, attempt, "Concurrent task write, retrying");
        }
        Err(ForemanError::Orchestrator(format!(
            "task {task_id}: gave up after {MAX_WRITE_ATTEMPTS} conflicting writes"
        )))
    }

    async fn publish_task(&self, kind: EventKind, task: &Task) {
        self.events.publish(task_event(kind, task)).await;
    }
}

fn task_event(kind: EventKind, task: &Task) -> Event {
    let event = Event::new(kind, task.id).with("task_id", task.id.to_string());
    match task.last_agent_id {
        Some(agent_id) => event.with("agent_id", agent_id.to_string()),
        None => event,
    }
}

fn require(task: &Task, allowed: &[TaskStatus], to: TaskStatus) -> ForemanResult<()> {
    if allowed.contains(&task.status) {
        Ok(())
    } else {
        Err(ForemanError::invalid_transition(
            "task",
            task.id,
            task.status,
            to,
        ))
    }
}

fn release_to_pending(task: &mut Task) {
    task.status = TaskStatus::Pending;
    task.assigned_agent_id = None;
    task.assigned_at = None;
    task.started_at = None;
}

/// Depth-first search for a cycle reachable from `id`. Returns the loop as a
/// path that starts and ends on the same task.
fn find_cycle(
    id: TaskId,
    graph: &HashMap<TaskId, BTreeSet<TaskId>>,
    state: &mut HashMap<TaskId, u8>,
    path: &mut Vec<TaskId>,
) -> Option<Vec<TaskId>> {
    match state.get(&id) {
        Some(1) => {
            let start = path.iter().position(|p| *p == id).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(id);
            return Some(cycle);
        }
        Some(2) => return None,
        _ => {}
    }
    state.insert(id, 1);
    path.push(id);
    if let Some(deps) = graph.get(&id) {
        for dep in deps {
            if let Some(cycle) = find_cycle(*dep, graph, state, path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    state.insert(id, 2);
    None
}
