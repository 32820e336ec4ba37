//! agentcron-storage: SQLite persistence for scheduled tasks and their
//! execution history.
//!
//! Timestamps are stored as Unix milliseconds, schedules as their tagged
//! JSON form.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use agentcron_types::{
    ExecutionRecord, ExecutionStatus, RunStatus, ScheduleSpec, ScheduledTask, TriggerKind,
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Schedule encoding error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS scheduled_tasks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        agent_id TEXT NOT NULL,
        project_path TEXT,
        schedule TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_run_at INTEGER,
        last_run_status TEXT NOT NULL DEFAULT 'idle',
        last_error TEXT,
        next_run_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS task_executions (
        execution_id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        trigger_kind TEXT NOT NULL,
        status TEXT NOT NULL,
        submitted_at INTEGER NOT NULL,
        started_at INTEGER,
        finished_at INTEGER,
        error_message TEXT,
        FOREIGN KEY (task_id) REFERENCES scheduled_tasks(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_task_executions_task
        ON task_executions (task_id, submitted_at DESC);
";

const TASK_COLUMNS: &str = "id, name, description, agent_id, project_path, schedule, enabled, \
     last_run_at, last_run_status, last_error, next_run_at, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "execution_id, task_id, agent_id, trigger_kind, status, \
     submitted_at, started_at, finished_at, error_message";

/// SQLite-based storage for agentcron.
#[derive(Clone)]
pub struct AgentCronStorage {
    conn: Arc<Mutex<Connection>>,
}

impl AgentCronStorage {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        init_schema(&conn)?;

        tracing::info!("Storage opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ─── Scheduled Tasks ───────────────────────────────────

    /// Insert or replace a task.
    pub async fn save_task(&self, task: &ScheduledTask) -> Result<()> {
        let conn = self.conn.clone();
        let task = task.clone();
        let schedule = serde_json::to_string(&task.schedule)?;
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO scheduled_tasks
                    (id, name, description, agent_id, project_path, schedule, enabled,
                     last_run_at, last_run_status, last_error, next_run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    agent_id = excluded.agent_id,
                    project_path = excluded.project_path,
                    schedule = excluded.schedule,
                    enabled = excluded.enabled,
                    last_run_at = excluded.last_run_at,
                    last_run_status = excluded.last_run_status,
                    last_error = excluded.last_error,
                    next_run_at = excluded.next_run_at,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    task.id,
                    task.name,
                    task.description,
                    task.agent_id,
                    task.project_path,
                    schedule,
                    task.enabled as i32,
                    task.last_run_at.map(|t| t.timestamp_millis()),
                    task.last_run_status.as_str(),
                    task.last_error,
                    task.next_run_at.map(|t| t.timestamp_millis()),
                    task.created_at.timestamp_millis(),
                    task.updated_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Get a task by id.
    pub async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let row = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                    rusqlite::params![id],
                    TaskRow::from_row,
                )
                .optional()?;
            row.map(TaskRow::into_task).transpose()
        })
        .await?
    }

    /// List all tasks, oldest first.
    pub async fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map([], TaskRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await?
    }

    /// Delete a task together with its execution history.
    ///
    /// Returns `false` when no such task existed.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM task_executions WHERE task_id = ?1",
                rusqlite::params![id],
            )?;
            let removed = tx.execute(
                "DELETE FROM scheduled_tasks WHERE id = ?1",
                rusqlite::params![id],
            )?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await?
    }

    // ─── Execution History ───────────────────────────────────

    /// Append a new execution record.
    pub async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let conn = self.conn.clone();
        let r = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                &format!(
                    "INSERT INTO task_executions ({EXECUTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                rusqlite::params![
                    r.execution_id,
                    r.task_id,
                    r.agent_id,
                    r.trigger.as_str(),
                    r.status.as_str(),
                    r.submitted_at.timestamp_millis(),
                    r.started_at.map(|t| t.timestamp_millis()),
                    r.finished_at.map(|t| t.timestamp_millis()),
                    r.error_message,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Overwrite the mutable fields of an execution record.
    ///
    /// Records that already carry a `finished_at` are left untouched and
    /// `false` is returned.
    pub async fn update_execution(&self, record: &ExecutionRecord) -> Result<bool> {
        let conn = self.conn.clone();
        let r = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let changed = conn.execute(
                "UPDATE task_executions SET
                    status = ?2,
                    started_at = ?3,
                    finished_at = ?4,
                    error_message = ?5
                 WHERE execution_id = ?1 AND finished_at IS NULL",
                rusqlite::params![
                    r.execution_id,
                    r.status.as_str(),
                    r.started_at.map(|t| t.timestamp_millis()),
                    r.finished_at.map(|t| t.timestamp_millis()),
                    r.error_message,
                ],
            )?;
            Ok(changed > 0)
        })
        .await?
    }

    /// Get an execution record by id.
    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let conn = self.conn.clone();
        let execution_id = execution_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE execution_id = ?1"
                    ),
                    rusqlite::params![execution_id],
                    ExecutionRow::from_row,
                )
                .optional()?;
            row.map(ExecutionRow::into_record).transpose()
        })
        .await?
    }

    /// Page through a task's executions, newest first.
    ///
    /// Returns the page together with the task's total record count.
    pub async fn list_executions(
        &self,
        task_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<ExecutionRecord>, u64)> {
        let conn = self.conn.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM task_executions WHERE task_id = ?1",
                rusqlite::params![task_id],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM task_executions
                 WHERE task_id = ?1
                 ORDER BY submitted_at DESC, rowid DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![task_id, limit as i64, offset as i64],
                    ExecutionRow::from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let records = rows
                .into_iter()
                .map(ExecutionRow::into_record)
                .collect::<Result<Vec<_>>>()?;
            Ok((records, total.max(0) as u64))
        })
        .await?
    }

    /// Keep only the newest `keep` finished executions of a task.
    ///
    /// In-flight records are never pruned. Returns the number removed.
    pub async fn prune_executions(&self, task_id: &str, keep: usize) -> Result<usize> {
        let conn = self.conn.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let removed = conn.execute(
                "DELETE FROM task_executions
                 WHERE task_id = ?1 AND finished_at IS NOT NULL
                   AND execution_id NOT IN (
                       SELECT execution_id FROM task_executions
                       WHERE task_id = ?1 AND finished_at IS NOT NULL
                       ORDER BY submitted_at DESC, rowid DESC
                       LIMIT ?2
                   )",
                rusqlite::params![task_id, keep as i64],
            )?;
            Ok(removed)
        })
        .await?
    }

    /// Mark executions left queued or running by a previous process as
    /// failed. Returns the affected records.
    pub async fn recover_interrupted(
        &self,
        now: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn.clone();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let rows = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM task_executions
                     WHERE finished_at IS NULL AND status IN ('queued', 'running')"
                ))?;
                let rows = stmt
                    .query_map([], ExecutionRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };
            tx.execute(
                "UPDATE task_executions SET status = 'error', finished_at = ?1, error_message = ?2
                 WHERE finished_at IS NULL AND status IN ('queued', 'running')",
                rusqlite::params![now.timestamp_millis(), message],
            )?;
            tx.commit()?;

            rows.into_iter()
                .map(|row| {
                    let mut record = row.into_record()?;
                    record.status = ExecutionStatus::Error;
                    record.finished_at = Some(now);
                    record.error_message = Some(message.clone());
                    Ok(record)
                })
                .collect()
        })
        .await?
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch(SCHEMA)
}

fn millis_to_datetime(ms: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Corrupt(format!("{column} out of range: {ms}")))
}

fn opt_millis(ms: Option<i64>, column: &str) -> Result<Option<DateTime<Utc>>> {
    ms.map(|ms| millis_to_datetime(ms, column)).transpose()
}

/// Raw `scheduled_tasks` row before decoding.
struct TaskRow {
    id: String,
    name: String,
    description: Option<String>,
    agent_id: String,
    project_path: Option<String>,
    schedule: String,
    enabled: bool,
    last_run_at: Option<i64>,
    last_run_status: String,
    last_error: Option<String>,
    next_run_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            agent_id: row.get(3)?,
            project_path: row.get(4)?,
            schedule: row.get(5)?,
            enabled: row.get::<_, i32>(6)? != 0,
            last_run_at: row.get(7)?,
            last_run_status: row.get(8)?,
            last_error: row.get(9)?,
            next_run_at: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_task(self) -> Result<ScheduledTask> {
        let schedule: ScheduleSpec = serde_json::from_str(&self.schedule)?;
        let last_run_status = RunStatus::parse(&self.last_run_status).ok_or_else(|| {
            StorageError::Corrupt(format!(
                "task {}: unknown run status '{}'",
                self.id, self.last_run_status
            ))
        })?;
        Ok(ScheduledTask {
            schedule,
            last_run_status,
            last_run_at: opt_millis(self.last_run_at, "last_run_at")?,
            next_run_at: opt_millis(self.next_run_at, "next_run_at")?,
            created_at: millis_to_datetime(self.created_at, "created_at")?,
            updated_at: millis_to_datetime(self.updated_at, "updated_at")?,
            id: self.id,
            name: self.name,
            description: self.description,
            agent_id: self.agent_id,
            project_path: self.project_path,
            enabled: self.enabled,
            last_error: self.last_error,
        })
    }
}

/// Raw `task_executions` row before decoding.
struct ExecutionRow {
    execution_id: String,
    task_id: String,
    agent_id: String,
    trigger: String,
    status: String,
    submitted_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    error_message: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            execution_id: row.get(0)?,
            task_id: row.get(1)?,
            agent_id: row.get(2)?,
            trigger: row.get(3)?,
            status: row.get(4)?,
            submitted_at: row.get(5)?,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
            error_message: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord> {
        let trigger = TriggerKind::parse(&self.trigger).ok_or_else(|| {
            StorageError::Corrupt(format!(
                "execution {}: unknown trigger '{}'",
                self.execution_id, self.trigger
            ))
        })?;
        let status = ExecutionStatus::parse(&self.status).ok_or_else(|| {
            StorageError::Corrupt(format!(
                "execution {}: unknown status '{}'",
                self.execution_id, self.status
            ))
        })?;
        Ok(ExecutionRecord {
            trigger,
            status,
            submitted_at: millis_to_datetime(self.submitted_at, "submitted_at")?,
            started_at: opt_millis(self.started_at, "started_at")?,
            finished_at: opt_millis(self.finished_at, "finished_at")?,
            execution_id: self.execution_id,
            task_id: self.task_id,
            agent_id: self.agent_id,
            error_message: self.error_message,
        })
    }
}
