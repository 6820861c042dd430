//! End-to-end dispatch tests.
//!
//! Drives the orchestrator against in-memory (and, with the `sqlite` feature,
//! on-disk) stores: assignment ordering, atomic claims under concurrency,
//! heartbeat recovery, the missed-heartbeat ladder, orphan requeue, escalation
//! events, conflict re-selection inside one tick, phase isolation on panics,
//! and loop backoff through a storage outage.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use foreman_core::{ChannelSink, Event, EventBus, EventKind, ForemanError, ForemanResult};
use foreman_orchestrator::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn config_with_phases(phases: &[&str]) -> ForemanConfig {
    let mut config = ForemanConfig::default();
    config.orchestrator.phases = phases.iter().map(|p| p.to_string()).collect();
    config
}

fn orchestrator_on<S>(store: Arc<S>, config: &ForemanConfig) -> (Orchestrator, UnboundedReceiver<Event>)
where
    S: TaskStore + AgentStore + 'static,
{
    let (sink, rx) = ChannelSink::new();
    let events = EventBus::new().with_sink(Arc::new(sink));
    (Orchestrator::new(store, config, events), rx)
}

fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// Wraps a `MemoryStore` and injects faults on demand.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    /// The next ASSIGNED write is beaten by a competing claim.
    race_next_claim: AtomicBool,
    /// Every call fails as if the database were down.
    offline: AtomicBool,
    /// Listing pending tasks for this phase panics.
    panic_phase: Option<String>,
}

impl FaultyStore {
    fn check_online(&self) -> ForemanResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ForemanError::PersistenceUnavailable("database is down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TaskStore for FaultyStore {
    async fn insert_task(&self, task: &Task) -> ForemanResult<()> {
        self.check_online()?;
        self.inner.insert_task(task).await
    }

    async fn load_task(&self, id: TaskId) -> ForemanResult<Option<Task>> {
        self.check_online()?;
        self.inner.load_task(id).await
    }

    async fn load_tasks(&self, phase_id: Option<&str>) -> ForemanResult<Vec<Task>> {
        self.check_online()?;
        self.inner.load_tasks(phase_id).await
    }

    async fn load_pending_tasks(&self, phase_id: &str) -> ForemanResult<Vec<Task>> {
        self.check_online()?;
        if self.panic_phase.as_deref() == Some(phase_id) {
            panic!("corrupt backlog for phase {phase_id}");
        }
        self.inner.load_pending_tasks(phase_id).await
    }

    async fn load_tasks_by_status(&self, statuses: &[TaskStatus]) -> ForemanResult<Vec<Task>> {
        self.check_online()?;
        self.inner.load_tasks_by_status(statuses).await
    }

    async fn compare_and_swap_task(
        &self,
        task: &Task,
        expected_version: u64,
    ) -> ForemanResult<bool> {
        self.check_online()?;
        if task.status == TaskStatus::Assigned && self.race_next_claim.swap(false, Ordering::SeqCst)
        {
            if let Some(mut stolen) = self.inner.load_task(task.id).await? {
                stolen.status = TaskStatus::Assigned;
                stolen.assigned_agent_id = Some(Uuid::new_v4());
                let version = stolen.version;
                self.inner.compare_and_swap_task(&stolen, version).await?;
            }
        }
        self.inner.compare_and_swap_task(task, expected_version).await
    }
}

#[async_trait]
impl AgentStore for FaultyStore {
    async fn insert_agent(&self, agent: &Agent) -> ForemanResult<()> {
        self.check_online()?;
        self.inner.insert_agent(agent).await
    }

    async fn load_agent(&self, id: AgentId) -> ForemanResult<Option<Agent>> {
        self.check_online()?;
        self.inner.load_agent(id).await
    }

    async fn list_agents(&self, phase_id: Option<&str>) -> ForemanResult<Vec<Agent>> {
        self.check_online()?;
        self.inner.list_agents(phase_id).await
    }

    async fn compare_and_swap_agent(
        &self,
        agent: &Agent,
        expected_version: u64,
    ) -> ForemanResult<bool> {
        self.check_online()?;
        self.inner.compare_and_swap_agent(agent, expected_version).await
    }
}

// ---------------------------------------------------------------------------
// Dispatch flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dependency_chain_dispatches_in_order() {
    let (orch, mut rx) = orchestrator_on(Arc::new(MemoryStore::new()), &ForemanConfig::default());
    let agent = orch
        .register_agent(Agent::new("worker", "impl"))
        .await
        .unwrap();

    let design = orch.enqueue(Task::new("impl", "design")).await.unwrap();
    let build = orch
        .enqueue(
            Task::new("impl", "build")
                .with_priority(Priority::Critical)
                .with_dependencies([design.id]),
        )
        .await
        .unwrap();

    // The critical task is blocked, so the design task goes first.
    let report = orch.tick().await.unwrap();
    assert_eq!(report.assignments.len(), 1);
    assert_eq!(report.assignments[0].task_id, design.id);
    assert_eq!(report.assignments[0].agent_id, agent.id);

    // Agent is busy: nothing more to hand out.
    assert!(orch.tick().await.unwrap().assignments.is_empty());

    orch.start(design.id).await.unwrap();
    orch.complete(design.id).await.unwrap();

    let report = orch.tick().await.unwrap();
    assert_eq!(report.assignments[0].task_id, build.id);

    let assigned: Vec<Event> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.is(EventKind::TaskAssigned))
        .collect();
    assert_eq!(assigned.len(), 2);
    assert_eq!(assigned[0].payload["task_id"], design.id.to_string());
    assert_eq!(assigned[0].payload["agent_id"], agent.id.to_string());
    assert_eq!(assigned[0].entity_type, "task");
}

#[tokio::test]
async fn test_each_idle_agent_gets_one_task() {
    let (orch, _rx) = orchestrator_on(Arc::new(MemoryStore::new()), &ForemanConfig::default());
    for _ in 0..3 {
        orch.register_agent(Agent::new("worker", "impl")).await.unwrap();
    }
    for i in 0..5 {
        orch.enqueue(Task::new("impl", format!("task {i}"))).await.unwrap();
    }

    let report = orch.tick().await.unwrap();
    assert_eq!(report.assignments.len(), 3);
    let agents: HashSet<AgentId> = report.assignments.iter().map(|a| a.agent_id).collect();
    assert_eq!(agents.len(), 3);

    let counts = orch.queue().counts(Some("impl")).await.unwrap();
    assert_eq!(counts.assigned, 3);
    assert_eq!(counts.pending, 2);
}

#[tokio::test]
async fn test_capabilities_gate_assignment() {
    let (orch, _rx) = orchestrator_on(Arc::new(MemoryStore::new()), &ForemanConfig::default());
    let plain = orch
        .register_agent(Agent::new("worker", "impl").with_capabilities(["rust"]))
        .await
        .unwrap();
    let gpu_task = orch
        .enqueue(Task::new("impl", "train").with_capabilities(["gpu"]))
        .await
        .unwrap();

    assert!(orch.tick().await.unwrap().assignments.is_empty());

    let gpu = orch
        .register_agent(Agent::new("worker", "impl").with_capabilities(["gpu", "rust"]))
        .await
        .unwrap();
    let report = orch.tick().await.unwrap();
    assert_eq!(report.assignments.len(), 1);
    assert_eq!(report.assignments[0].task_id, gpu_task.id);
    assert_eq!(report.assignments[0].agent_id, gpu.id);
    assert_ne!(report.assignments[0].agent_id, plain.id);
}

#[tokio::test]
async fn test_degraded_agent_gets_no_work() {
    let (orch, _rx) = orchestrator_on(Arc::new(MemoryStore::new()), &ForemanConfig::default());
    let agent = orch
        .register_agent(Agent::new("worker", "impl"))
        .await
        .unwrap();
    orch.enqueue(Task::new("impl", "a")).await.unwrap();

    orch.agents()
        .report_degraded(agent.id, "health check failed")
        .await
        .unwrap();
    assert!(orch.tick().await.unwrap().assignments.is_empty());

    assert!(orch.emit_heartbeat(agent.id).await.unwrap());
    assert_eq!(orch.tick().await.unwrap().assignments.len(), 1);
}

// ---------------------------------------------------------------------------
// Atomic claims
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_assignment() {
    let store = Arc::new(MemoryStore::new());
    let (orch, _rx) = orchestrator_on(store, &ForemanConfig::default());
    let queue = orch.queue().clone();

    for _ in 0..50 {
        let task_id = queue
            .enqueue(Task::new("impl", "contested"))
            .await
            .unwrap()
            .id;
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.assign(task_id, a).await }
        });
        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.assign(task_id, b).await }
        });
        let results = [first.await.unwrap(), second.await.unwrap()];

        let winners: Vec<&Task> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1, "exactly one claim must win");
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(loser, ForemanError::AssignmentConflict { .. }));

        let stored = queue.get(task_id).await.unwrap();
        assert_eq!(stored.assigned_agent_id, winners[0].assigned_agent_id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_orchestrators_share_one_store() {
    let store = Arc::new(MemoryStore::new());
    let config = ForemanConfig::default();
    let (left, _l) = orchestrator_on(store.clone(), &config);
    let (right, _r) = orchestrator_on(store.clone(), &config);

    for _ in 0..4 {
        left.register_agent(Agent::new("worker", "impl")).await.unwrap();
    }
    for i in 0..10 {
        left.enqueue(Task::new("impl", format!("task {i}"))).await.unwrap();
    }

    let (a, b) = tokio::join!(left.tick(), right.tick());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.assignments.len() + b.assignments.len(), 4);

    // Every in-flight task is held by a distinct BUSY agent that points back at it.
    let in_flight = left.queue().in_flight_tasks().await.unwrap();
    assert_eq!(in_flight.len(), 4);
    let owners: HashSet<AgentId> = in_flight
        .iter()
        .map(|t| t.assigned_agent_id.unwrap())
        .collect();
    assert_eq!(owners.len(), 4);
    for task in &in_flight {
        let agent = left
            .agents()
            .get(task.assigned_agent_id.unwrap())
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(agent.current_task_id, Some(task.id));
    }
}

#[tokio::test]
async fn test_conflict_reselects_within_same_tick() {
    let store = Arc::new(FaultyStore::default());
    let (orch, _rx) = orchestrator_on(store.clone(), &ForemanConfig::default());
    orch.register_agent(Agent::new("worker", "impl")).await.unwrap();
    let first = orch
        .enqueue(Task::new("impl", "first").with_priority(Priority::High))
        .await
        .unwrap();
    let second = orch.enqueue(Task::new("impl", "second")).await.unwrap();

    store.race_next_claim.store(true, Ordering::SeqCst);
    let report = orch.tick().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.assignments.len(), 1);
    assert_eq!(report.assignments[0].task_id, second.id);
    let stolen = orch.queue().get(first.id).await.unwrap();
    assert_eq!(stolen.status, TaskStatus::Assigned);
    assert_ne!(stolen.assigned_agent_id, Some(report.assignments[0].agent_id));
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stale_agent_task_is_requeued_and_reassigned() {
    let (orch, mut rx) = orchestrator_on(Arc::new(MemoryStore::new()), &ForemanConfig::default());
    let crashed = orch
        .register_agent(Agent::new("worker", "impl"))
        .await
        .unwrap();
    let task = orch.enqueue(Task::new("impl", "a")).await.unwrap();
    orch.tick().await.unwrap();
    orch.start(task.id).await.unwrap();

    // A fresh agent joins and keeps heartbeating; the first one went silent.
    let later = Utc::now() + Duration::seconds(120);
    let survivor = orch
        .register_agent(Agent::new("worker", "impl"))
        .await
        .unwrap();
    orch.agents()
        .emit_heartbeat_at(survivor.id, later)
        .await
        .unwrap();

    let report = orch.tick_at(later).await.unwrap();
    assert_eq!(report.health.stale_agents, vec![crashed.id]);
    assert_eq!(report.health.requeued_tasks, vec![task.id]);
    // Requeued before the assignment pass, so it is handed out in the same tick.
    assert_eq!(report.assignments[0].task_id, task.id);
    assert_eq!(report.assignments[0].agent_id, survivor.id);

    let stored = orch.queue().get(task.id).await.unwrap();
    assert_eq!(stored.retry_count, 0);

    let events = drain(&mut rx);
    let stale = events.iter().find(|e| e.is(EventKind::AgentStale)).unwrap();
    assert_eq!(stale.payload["agent_id"], crashed.id.to_string());
}

#[tokio::test]
async fn test_orphan_requeue_without_replacement() {
    let (orch, _rx) = orchestrator_on(Arc::new(MemoryStore::new()), &ForemanConfig::default());
    orch.register_agent(Agent::new("worker", "impl")).await.unwrap();
    let task = orch.enqueue(Task::new("impl", "a")).await.unwrap();
    orch.tick().await.unwrap();
    orch.start(task.id).await.unwrap();

    orch.tick_at(Utc::now() + Duration::seconds(91)).await.unwrap();
    let status = orch.get_status(task.id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Pending);
    assert_eq!(status.retry_count, 0);
    assert_eq!(status.assigned_agent_id, None);
}

#[tokio::test]
async fn test_recovered_agent_does_not_get_old_task_back_automatically() {
    let (orch, mut rx) = orchestrator_on(Arc::new(MemoryStore::new()), &ForemanConfig::default());
    let agent = orch
        .register_agent(Agent::new("worker", "impl"))
        .await
        .unwrap();
    let task = orch.enqueue(Task::new("impl", "a")).await.unwrap();
    orch.tick().await.unwrap();

    let later = Utc::now() + Duration::seconds(200);
    orch.health().run_pass_at(later).await.unwrap();
    assert_eq!(
        orch.agents().get(agent.id).await.unwrap().status,
        AgentStatus::Stale
    );

    assert!(orch.agents().emit_heartbeat_at(agent.id, later).await.unwrap());
    let recovered = orch.agents().get(agent.id).await.unwrap();
    assert_eq!(recovered.status, AgentStatus::Idle);
    assert_eq!(recovered.health_status, HealthStatus::Healthy);
    assert_eq!(recovered.current_task_id, None);
    assert_eq!(
        orch.get_status(task.id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert!(drain(&mut rx).iter().any(|e| e.is(EventKind::AgentRecovered)));
}

#[tokio::test]
async fn test_task_of_agent_recovered_before_sweep_is_requeued() {
    let (orch, _rx) = orchestrator_on(Arc::new(MemoryStore::new()), &ForemanConfig::default());
    let agent = orch
        .register_agent(Agent::new("worker", "impl"))
        .await
        .unwrap();
    let first = orch.enqueue(Task::new("impl", "first")).await.unwrap();
    orch.tick().await.unwrap();
    orch.start(first.id).await.unwrap();
    orch.enqueue(Task::new("impl", "second")).await.unwrap();

    // Marked STALE, then heartbeats straight back to IDLE before any sweep.
    let later = Utc::now() + Duration::seconds(120);
    orch.agents().detect_stale_at(90, later).await.unwrap();
    assert!(orch.agents().emit_heartbeat_at(agent.id, later).await.unwrap());

    let report = orch.tick_at(later).await.unwrap();
    assert_eq!(report.health.requeued_tasks, vec![first.id]);
    assert_eq!(report.assignments.len(), 1);
    assert_eq!(orch.queue().get(first.id).await.unwrap().retry_count, 0);

    // The agent ends up holding exactly one in-flight task, and it points back at it.
    let held = orch.queue().in_flight_for_agent(agent.id).await.unwrap();
    assert_eq!(held.len(), 1);
    let agent = orch.agents().get(agent.id).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Busy);
    assert_eq!(agent.current_task_id, Some(held[0].id));
}

#[tokio::test]
async fn test_missed_heartbeats_degrade_then_stale() {
    let (orch, mut rx) = orchestrator_on(Arc::new(MemoryStore::new()), &ForemanConfig::default());
    let agent = orch
        .register_agent(Agent::new("worker", "impl"))
        .await
        .unwrap();
    let task = orch.enqueue(Task::new("impl", "a")).await.unwrap();
    orch.tick().await.unwrap();
    orch.start(task.id).await.unwrap();
    let registered = Utc::now();

    // Two busy intervals missed: DEGRADED, still holding its task.
    let report = orch
        .tick_at(registered + Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(report.health.missed_heartbeats[0].escalation, Escalation::Degraded);
    assert!(report.health.requeued_tasks.is_empty());
    let degraded = orch.agents().get(agent.id).await.unwrap();
    assert_eq!(degraded.status, AgentStatus::Degraded);
    assert_eq!(degraded.current_task_id, Some(task.id));

    let report = orch
        .tick_at(registered + Duration::seconds(50))
        .await
        .unwrap();
    assert_eq!(
        report.health.missed_heartbeats[0].escalation,
        Escalation::Unresponsive
    );

    // The heartbeat timeout still decides when the task is taken away.
    let report = orch
        .tick_at(registered + Duration::seconds(95))
        .await
        .unwrap();
    assert_eq!(report.health.stale_agents, vec![agent.id]);
    assert_eq!(report.health.requeued_tasks, vec![task.id]);

    let levels: Vec<String> = drain(&mut rx)
        .iter()
        .filter(|e| e.is(EventKind::HeartbeatMissed))
        .map(|e| e.payload["escalation_level"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(levels, vec!["degraded", "unresponsive"]);
}

#[tokio::test]
async fn test_exhausted_retries_emit_dead_event() {
    let (orch, mut rx) = orchestrator_on(Arc::new(MemoryStore::new()), &ForemanConfig::default());
    let agent = orch
        .register_agent(Agent::new("worker", "impl"))
        .await
        .unwrap();
    let task = orch
        .enqueue(Task::new("impl", "fragile").with_max_retries(1))
        .await
        .unwrap();
    orch.tick().await.unwrap();
    orch.start(task.id).await.unwrap();

    let outcome = orch.fail(task.id, "segfault").await.unwrap();
    assert!(outcome.is_dead());
    assert_eq!(
        orch.agents().get(agent.id).await.unwrap().status,
        AgentStatus::Idle
    );

    let dead = drain(&mut rx)
        .into_iter()
        .find(|e| e.is(EventKind::TaskDead))
        .unwrap();
    assert_eq!(dead.entity_id, task.id.to_string());
    assert_eq!(dead.payload["retry_count"], 1);

    // Dead tasks are never handed out again.
    assert!(orch.tick().await.unwrap().assignments.is_empty());
}

// ---------------------------------------------------------------------------
// Resilience
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_panicking_phase_does_not_stop_others() {
    let store = Arc::new(FaultyStore {
        panic_phase: Some("cursed".into()),
        ..FaultyStore::default()
    });
    let (orch, _rx) = orchestrator_on(store, &config_with_phases(&["cursed"]));
    orch.register_agent(Agent::new("worker", "cursed")).await.unwrap();
    orch.register_agent(Agent::new("worker", "impl")).await.unwrap();
    let task = orch.enqueue(Task::new("impl", "a")).await.unwrap();

    let report = orch.tick().await.unwrap();
    assert_eq!(report.failed_phases.len(), 1);
    assert_eq!(report.failed_phases[0].phase_id, "cursed");
    assert!(report.failed_phases[0].error.starts_with("panic:"));
    assert_eq!(report.assignments.len(), 1);
    assert_eq!(report.assignments[0].task_id, task.id);

    // The next tick runs normally.
    assert_eq!(orch.tick().await.unwrap().tick, 2);
}

#[tokio::test]
async fn test_storage_outage_surfaces_as_persistence_error() {
    let store = Arc::new(FaultyStore::default());
    let (orch, _rx) = orchestrator_on(store.clone(), &ForemanConfig::default());
    orch.register_agent(Agent::new("worker", "impl")).await.unwrap();

    store.offline.store(true, Ordering::SeqCst);
    let err = orch.tick().await.unwrap_err();
    assert!(err.is_persistence());

    store.offline.store(false, Ordering::SeqCst);
    assert!(orch.tick().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_run_backs_off_through_storage_outage() {
    let store = Arc::new(FaultyStore::default());
    let (orch, _rx) = orchestrator_on(store.clone(), &ForemanConfig::default());
    let orch = Arc::new(orch);
    orch.register_agent(Agent::new("worker", "impl")).await.unwrap();
    let task = orch.enqueue(Task::new("impl", "a")).await.unwrap();

    store.offline.store(true, Ordering::SeqCst);
    let (tx, shutdown) = watch::channel(false);
    let handle = tokio::spawn({
        let orch = orch.clone();
        async move { orch.run(shutdown).await }
    });

    // The first tick fails at t=0 and the loop backs off for 20s, then
    // waits a full poll interval: the next tick is at t=30, not t=10.
    tokio::time::sleep(StdDuration::from_secs(5)).await;
    store.offline.store(false, Ordering::SeqCst);
    tokio::time::sleep(StdDuration::from_secs(20)).await;
    let waiting = store.inner.load_task(task.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, TaskStatus::Pending);

    tokio::time::sleep(StdDuration::from_secs(10)).await;
    let claimed = store.inner.load_task(task.id).await.unwrap().unwrap();
    assert_eq!(claimed.status, TaskStatus::Assigned);

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_score_refresh_cadence() {
    let mut config = ForemanConfig::default();
    config.orchestrator.score_refresh_every_ticks = 2;
    let (orch, _rx) = orchestrator_on(Arc::new(MemoryStore::new()), &config);
    orch.register_agent(Agent::new("worker", "impl")).await.unwrap();
    let dep = orch.enqueue(Task::new("impl", "dep")).await.unwrap();
    orch.enqueue(Task::new("impl", "waiting").with_dependencies([dep.id]))
        .await
        .unwrap();

    assert_eq!(orch.tick().await.unwrap().scores_refreshed, 0);
    // Tick 2 refreshes every PENDING task of the phase; `dep` is already assigned.
    assert_eq!(orch.tick().await.unwrap().scores_refreshed, 1);
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

#[cfg(feature = "sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_no_double_assignment_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("foreman.db");
    let config = ForemanConfig::default();

    let task_id = {
        let store = Arc::new(SqliteStore::open(&path).await.unwrap());
        let (orch, _rx) = orchestrator_on(store, &config);
        let task_id = orch
            .enqueue(Task::new("impl", "contested"))
            .await
            .unwrap()
            .id;
        let queue = orch.queue().clone();

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.assign(task_id, Uuid::new_v4()).await }
        });
        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.assign(task_id, Uuid::new_v4()).await }
        });
        let ok = [first.await.unwrap(), second.await.unwrap()]
            .iter()
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(ok, 1);
        task_id
    };

    let store = Arc::new(SqliteStore::open(&path).await.unwrap());
    let (orch, _rx) = orchestrator_on(store, &config);
    assert_eq!(
        orch.get_status(task_id).await.unwrap().status,
        TaskStatus::Assigned
    );
}
