use super::{AgentStore, TaskStore};
use crate::types::{Agent, AgentId, Task, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::SecondsFormat;
use foreman_core::{ForemanError, ForemanResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    phase_id    TEXT NOT NULL,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    version     INTEGER NOT NULL,
    data        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_phase_status ON tasks (phase_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);

CREATE TABLE IF NOT EXISTS agents (
    id             TEXT PRIMARY KEY,
    phase_id       TEXT NOT NULL,
    registered_at  TEXT NOT NULL,
    version        INTEGER NOT NULL,
    data           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agents_phase ON agents (phase_id);
";

/// SQLite store. Rows keep the indexed columns next to a JSON document of the
/// full entity; CAS is one `UPDATE ... WHERE id = ? AND version = ?`.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn db_err(e: rusqlite::Error) -> ForemanError {
    ForemanError::PersistenceUnavailable(e.to_string())
}

/// `SELECT` over `idx_tasks_status` with one placeholder per wanted status.
fn status_query(count: usize) -> String {
    let placeholders = vec!["?"; count].join(", ");
    format!("SELECT data FROM tasks WHERE status IN ({placeholders}) ORDER BY created_at, id")
}

fn timestamp(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteStore {
    /// Opens (or creates) the database file and ensures the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> ForemanResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = tokio::task::spawn_blocking(move || -> ForemanResult<Connection> {
            let conn = Connection::open(&path).map_err(db_err)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))
                .map_err(db_err)?;
            conn.execute_batch(SCHEMA).map_err(db_err)?;
            Ok(conn)
        })
        .await
        .map_err(|e| ForemanError::PersistenceUnavailable(e.to_string()))??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> ForemanResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> ForemanResult<T>
    where
        F: FnOnce(&mut Connection) -> ForemanResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| ForemanError::PersistenceUnavailable(e.to_string()))?
    }

    async fn query_tasks(
        &self,
        sql: impl Into<String>,
        args: Vec<String>,
    ) -> ForemanResult<Vec<Task>> {
        let sql = sql.into();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                    row.get::<_, String>(0)
                })
                .map_err(db_err)?;
            let mut tasks = Vec::new();
            for data in rows {
                tasks.push(serde_json::from_str(&data.map_err(db_err)?)?);
            }
            Ok(tasks)
        })
        .await
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &Task) -> ForemanResult<()> {
        let task = task.clone();
        let data = serde_json::to_string(&task)?;
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO tasks (id, phase_id, status, created_at, version, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        task.id.to_string(),
                        task.phase_id,
                        task.status.as_str(),
                        timestamp(&task.created_at),
                        task.version as i64,
                        data,
                    ],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(ForemanError::Duplicate(format!("task {}", task.id)));
            }
            Ok(())
        })
        .await
    }

    async fn load_task(&self, id: TaskId) -> ForemanResult<Option<Task>> {
        let data = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT data FROM tasks WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(db_err)
            })
            .await?;
        data.map(|d| serde_json::from_str(&d).map_err(ForemanError::from))
            .transpose()
    }

    async fn load_tasks(&self, phase_id: Option<&str>) -> ForemanResult<Vec<Task>> {
        match phase_id {
            Some(phase) => {
                self.query_tasks(
                    "SELECT data FROM tasks WHERE phase_id = ?1 ORDER BY created_at, id",
                    vec![phase.to_string()],
                )
                .await
            }
            None => {
                self.query_tasks("SELECT data FROM tasks ORDER BY created_at, id", vec![])
                    .await
            }
        }
    }

    async fn load_pending_tasks(&self, phase_id: &str) -> ForemanResult<Vec<Task>> {
        self.query_tasks(
            "SELECT data FROM tasks WHERE phase_id = ?1 AND status = ?2 ORDER BY created_at, id",
            vec![
                phase_id.to_string(),
                TaskStatus::Pending.as_str().to_string(),
            ],
        )
        .await
    }

    async fn load_tasks_by_status(&self, statuses: &[TaskStatus]) -> ForemanResult<Vec<Task>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let args = statuses.iter().map(|s| s.as_str().to_string()).collect();
        self.query_tasks(status_query(statuses.len()), args).await
    }

    async fn compare_and_swap_task(
        &self,
        task: &Task,
        expected_version: u64,
    ) -> ForemanResult<bool> {
        let mut next = task.clone();
        next.version = expected_version + 1;
        let data = serde_json::to_string(&next)?;
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE tasks SET phase_id = ?1, status = ?2, version = ?3, data = ?4
                     WHERE id = ?5 AND version = ?6",
                    params![
                        next.phase_id,
                        next.status.as_str(),
                        next.version as i64,
                        data,
                        next.id.to_string(),
                        expected_version as i64,
                    ],
                )
                .map_err(db_err)?;
            Ok(updated == 1)
        })
        .await
    }
}

#[async_trait]
impl AgentStore for SqliteStore {
    async fn insert_agent(&self, agent: &Agent) -> ForemanResult<()> {
        let agent = agent.clone();
        let data = serde_json::to_string(&agent)?;
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO agents (id, phase_id, registered_at, version, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        agent.id.to_string(),
                        agent.phase_id,
                        timestamp(&agent.registered_at),
                        agent.version as i64,
                        data,
                    ],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(ForemanError::Duplicate(format!("agent {}", agent.id)));
            }
            Ok(())
        })
        .await
    }

    async fn load_agent(&self, id: AgentId) -> ForemanResult<Option<Agent>> {
        let data = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT data FROM agents WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(db_err)
            })
            .await?;
        data.map(|d| serde_json::from_str(&d).map_err(ForemanError::from))
            .transpose()
    }

    async fn list_agents(&self, phase_id: Option<&str>) -> ForemanResult<Vec<Agent>> {
        let phase = phase_id.map(str::to_string);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT data FROM agents WHERE (?1 IS NULL OR phase_id = ?1)
                     ORDER BY registered_at, id",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![phase], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            let mut agents = Vec::new();
            for data in rows {
                agents.push(serde_json::from_str(&data.map_err(db_err)?)?);
            }
            Ok(agents)
        })
        .await
    }

    async fn compare_and_swap_agent(
        &self,
        agent: &Agent,
        expected_version: u64,
    ) -> ForemanResult<bool> {
        let mut next = agent.clone();
        next.version = expected_version + 1;
        let data = serde_json::to_string(&next)?;
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE agents SET phase_id = ?1, version = ?2, data = ?3
                     WHERE id = ?4 AND version = ?5",
                    params![
                        next.phase_id,
                        next.version as i64,
                        data,
                        next.id.to_string(),
                        expected_version as i64,
                    ],
                )
                .map_err(db_err)?;
            Ok(updated == 1)
        })
        .await
    }
}
