//! Command-line front end for the phase-partitioned task dispatcher.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use foreman_core::{EventBus, JsonlSink, LogSink};
use foreman_orchestrator::{
    Agent, AgentId, ForemanConfig, Orchestrator, Priority, SqliteStore, Task, TaskId,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "foreman", about = "Foreman: task dispatch for coding-agent fleets")]
struct Cli {
    /// Path to config file (missing file means built-in defaults)
    #[arg(short, long, default_value = "foreman.toml")]
    config: PathBuf,

    /// Directory for the database and event log (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch loop until Ctrl-C
    Run,
    /// Run exactly one dispatch cycle and print its report
    Tick,
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Manage agents
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Enqueue a new task
    Add {
        #[arg(long)]
        phase: String,
        #[arg(long)]
        title: String,
        /// CRITICAL, HIGH, MEDIUM or LOW
        #[arg(long, default_value = "MEDIUM")]
        priority: Priority,
        /// Deadline, in seconds from now
        #[arg(long)]
        deadline_in_secs: Option<i64>,
        /// Task that must complete first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<TaskId>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Maximum running time before the task is failed as timed out
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Capability the agent must have (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// Show a task's status
    Status { id: TaskId },
    /// Hand a pending task to a specific agent
    Assign {
        id: TaskId,
        #[arg(long)]
        agent: AgentId,
    },
    /// Mark an assigned task as running
    Start { id: TaskId },
    /// Mark a running task as completed
    Complete { id: TaskId },
    /// Report a failure (retried unless permanent or out of retries)
    Fail {
        id: TaskId,
        #[arg(long)]
        error: String,
    },
    /// Cancel a task; it will not be retried
    Cancel {
        id: TaskId,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Print the score breakdown of a task
    Score { id: TaskId },
    /// List tasks with per-status counts
    List {
        #[arg(long)]
        phase: Option<String>,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Register a new agent
    Register {
        #[arg(long)]
        phase: String,
        #[arg(long)]
        agent_type: String,
        /// Capability the agent offers (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// Record a heartbeat
    Heartbeat {
        id: AgentId,
        /// Heartbeat sequence number; gaps since the previous one are reported
        #[arg(long)]
        sequence: Option<u64>,
    },
    /// Terminate an agent and requeue its tasks
    Deregister { id: AgentId },
    /// Health report for every agent
    Health,
    /// Fleet statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config, cli.data_dir).await?;

    let (orchestrator, event_writer) = open_orchestrator(&config).await?;
    let result = execute(cli.command, &orchestrator, &config).await;

    // Every event bus clone lives inside the orchestrator; dropping it lets
    // the event log writer drain and exit.
    drop(orchestrator);
    if let Err(e) = event_writer.await {
        warn!(error = %e, "Event log writer did not shut down cleanly");
    }
    result
}

async fn load_config(path: &Path, data_dir: Option<PathBuf>) -> anyhow::Result<ForemanConfig> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(s) => Some(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No config file, using defaults");
            None
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        }
    };
    build_config(contents.as_deref(), std::env::vars(), data_dir)
}

/// Layers file contents, `FOREMAN_*` variables and the `--data-dir` flag.
fn build_config<I, K, V>(
    contents: Option<&str>,
    vars: I,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<ForemanConfig>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut config = match contents {
        Some(s) => ForemanConfig::from_toml_str(s)?,
        None => ForemanConfig::default(),
    };
    config.apply_overrides(vars)?;
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    config.validate()?;
    Ok(config)
}

async fn open_orchestrator(
    config: &ForemanConfig,
) -> anyhow::Result<(Orchestrator, JoinHandle<()>)> {
    let db_path = config.data_dir.join("foreman.db");
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .await
            .with_context(|| format!("Failed to open database '{}'", db_path.display()))?,
    );

    let (event_log, writer) = JsonlSink::spawn(config.data_dir.join("events.jsonl"));
    let events = EventBus::new()
        .with_sink(Arc::new(LogSink))
        .with_sink(Arc::new(event_log));

    Ok((Orchestrator::new(store, config, events), writer))
}

async fn execute(
    command: Commands,
    orchestrator: &Orchestrator,
    config: &ForemanConfig,
) -> anyhow::Result<()> {
    match command {
        Commands::Run => {
            let (tx, rx) = watch::channel(false);
            let signal = tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Ctrl-C handler unavailable");
                    std::future::pending::<()>().await;
                }
                info!("Shutdown requested");
                let _ = tx.send(true);
            });

            info!(data_dir = %config.data_dir.display(), "Starting foreman");
            orchestrator.run(rx).await?;
            signal.abort();
        }
        Commands::Tick => print_json(&orchestrator.tick().await?)?,
        Commands::Task { action } => run_task_action(action, orchestrator).await?,
        Commands::Agent { action } => run_agent_action(action, orchestrator, config).await?,
    }
    Ok(())
}

async fn run_task_action(action: TaskAction, orchestrator: &Orchestrator) -> anyhow::Result<()> {
    match action {
        TaskAction::Add {
            phase,
            title,
            priority,
            deadline_in_secs,
            depends_on,
            max_retries,
            timeout_secs,
            capabilities,
        } => {
            let mut task = Task::new(phase, title)
                .with_priority(priority)
                .with_dependencies(depends_on)
                .with_capabilities(capabilities);
            if let Some(secs) = deadline_in_secs {
                let offset = chrono::Duration::try_seconds(secs)
                    .ok_or_else(|| anyhow::anyhow!("--deadline-in-secs out of range: {secs}"))?;
                task = task.with_deadline(Utc::now() + offset);
            }
            if let Some(max) = max_retries {
                task = task.with_max_retries(max);
            }
            if let Some(secs) = timeout_secs {
                task = task.with_timeout(secs);
            }
            print_json(&orchestrator.enqueue(task).await?)?;
        }
        TaskAction::Status { id } => print_json(&orchestrator.get_status(id).await?)?,
        TaskAction::Assign { id, agent } => print_json(&orchestrator.assign(id, agent).await?)?,
        TaskAction::Start { id } => print_json(&orchestrator.start(id).await?)?,
        TaskAction::Complete { id } => print_json(&orchestrator.complete(id).await?)?,
        TaskAction::Fail { id, error } => {
            let outcome = orchestrator.fail(id, &error).await?;
            print_json(&serde_json::json!({
                "dead": outcome.is_dead(),
                "task": outcome.task(),
            }))?;
        }
        TaskAction::Cancel { id, reason } => {
            print_json(&orchestrator.cancel(id, &reason).await?)?;
        }
        TaskAction::Score { id } => {
            let queue = orchestrator.queue();
            let task = queue.get(id).await?;
            let blockers = queue.blocker_count(id).await?;
            let breakdown = queue.scorer().breakdown(&task, blockers, Utc::now());
            print_json(&serde_json::json!({
                "task_id": task.id,
                "stored_score": task.score,
                "score_computed_at": task.score_computed_at,
                "blockers": blockers,
                "breakdown": breakdown,
            }))?;
        }
        TaskAction::List { phase } => {
            let queue = orchestrator.queue();
            let tasks = queue.list(phase.as_deref()).await?;
            let counts = queue.counts(phase.as_deref()).await?;
            print_json(&serde_json::json!({
                "counts": counts,
                "tasks": tasks,
            }))?;
        }
    }
    Ok(())
}

async fn run_agent_action(
    action: AgentAction,
    orchestrator: &Orchestrator,
    config: &ForemanConfig,
) -> anyhow::Result<()> {
    let timeout = config.health.heartbeat_timeout_seconds;
    match action {
        AgentAction::Register {
            phase,
            agent_type,
            capabilities,
        } => {
            let agent = Agent::new(agent_type, phase).with_capabilities(capabilities);
            print_json(&orchestrator.register_agent(agent).await?)?;
        }
        AgentAction::Heartbeat { id, sequence } => {
            let ack = orchestrator.record_heartbeat(id, sequence).await?;
            if !ack.received {
                anyhow::bail!("Heartbeat rejected: agent {id} is terminated or unknown");
            }
            print_json(&ack)?;
        }
        AgentAction::Deregister { id } => print_json(&orchestrator.deregister_agent(id).await?)?,
        AgentAction::Health => {
            print_json(&orchestrator.agents().all_health_at(timeout, Utc::now()).await?)?;
        }
        AgentAction::Stats => {
            print_json(&orchestrator.agents().statistics_at(timeout, Utc::now()).await?)?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
