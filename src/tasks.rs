// Reconciliation Task Records
//
// Task records are owned exclusively by the reconciliation orchestrator:
// created at job start, mutated only by the orchestrator (plus the explicit
// cancel operation), and deleted only by retention cleanup. Two stores are
// provided behind the `TaskStore` trait: an in-memory map and a sqlite
// database for deployments that need task history to survive restarts.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use crate::error::{DomainError, FleetError};

/// How a run was triggered: throttled (normal) or unthrottled (force)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    Normal,
    Force,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Force => "force",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "force" => Some(Self::Force),
            _ => None,
        }
    }
}

/// Task lifecycle: Pending -> Running -> {Completed | Failed | Cancelled}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One fleet-wide reconciliation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub mode: TaskMode,
    pub status: TaskStatus,

    /// 0-100, non-decreasing within a run
    pub progress: u8,
    pub total_devices: usize,
    pub processed_devices: usize,
    pub online_count: usize,
    pub offline_count: usize,

    pub operator: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_seconds_remaining: Option<i64>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(mode: TaskMode, operator: impl Into<String>) -> Self {
        Self {
            task_id: new_task_id(),
            mode,
            status: TaskStatus::Pending,
            progress: 0,
            total_devices: 0,
            processed_devices: 0,
            online_count: 0,
            offline_count: 0,
            operator: operator.into(),
            started_at: Utc::now(),
            completed_at: None,
            estimated_seconds_remaining: None,
            error: None,
        }
    }
}

/// Time-plus-random task id; the suffix guards against same-millisecond
/// collisions
fn new_task_id() -> String {
    let suffix: u16 = rand::thread_rng().gen();
    format!("recon-{}-{:04x}", Utc::now().timestamp_millis(), suffix)
}

/// Counts by status plus the mean duration of completed runs
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub avg_duration_secs: Option<f64>,
}

impl TaskStats {
    fn from_tasks<'a>(tasks: impl Iterator<Item = &'a Task>) -> Self {
        let mut stats = TaskStats::default();
        let mut duration_sum = 0.0;
        let mut duration_count = 0usize;
        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            if task.status == TaskStatus::Completed {
                if let Some(completed_at) = task.completed_at {
                    duration_sum +=
                        (completed_at - task.started_at).num_milliseconds() as f64 / 1000.0;
                    duration_count += 1;
                }
            }
        }
        if duration_count > 0 {
            stats.avg_duration_secs = Some(duration_sum / duration_count as f64);
        }
        stats
    }
}

/// Persistence surface for task records
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<(), FleetError>;

    /// Replace the stored record (task ids are stable)
    async fn update(&self, task: &Task) -> Result<(), FleetError>;

    async fn get(&self, task_id: &str) -> Result<Option<Task>, FleetError>;

    /// Most recently started task, any mode or status
    async fn latest(&self) -> Result<Option<Task>, FleetError>;

    /// Most recently started *completed* task of the given mode; this is
    /// what the throttle window is measured against
    async fn latest_completed(&self, mode: TaskMode) -> Result<Option<Task>, FleetError>;

    /// Newest first
    async fn recent(&self, limit: usize) -> Result<Vec<Task>, FleetError>;

    async fn stats(&self) -> Result<TaskStats, FleetError>;

    /// Delete terminal tasks started before the retention cutoff; returns
    /// how many were removed. Non-terminal tasks are never touched.
    async fn delete_older_than(&self, days: i64) -> Result<usize, FleetError>;
}

// ============================================================================
// In-memory store
// ============================================================================

pub struct MemoryTaskStore {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), FleetError> {
        self.tasks
            .write()
            .await
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn update(&self, task: &Task) -> Result<(), FleetError> {
        self.tasks
            .write()
            .await
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>, FleetError> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn latest(&self) -> Result<Option<Task>, FleetError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .max_by_key(|t| (t.started_at, t.task_id.clone()))
            .cloned())
    }

    async fn latest_completed(&self, mode: TaskMode) -> Result<Option<Task>, FleetError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.mode == mode && t.status == TaskStatus::Completed)
            .max_by_key(|t| (t.started_at, t.task_id.clone()))
            .cloned())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Task>, FleetError> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn stats(&self) -> Result<TaskStats, FleetError> {
        let tasks = self.tasks.read().await;
        Ok(TaskStats::from_tasks(tasks.values()))
    }

    async fn delete_older_than(&self, days: i64) -> Result<usize, FleetError> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !(t.status.is_terminal() && t.started_at < cutoff));
        Ok(before - tasks.len())
    }
}

// ============================================================================
// Sqlite store
// ============================================================================

/// Sqlite-backed task store. The connection sits behind a mutex; every
/// operation locks, runs one statement batch, and releases before any await.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    task_id                     TEXT PRIMARY KEY,
    mode                        TEXT NOT NULL,
    status                      TEXT NOT NULL,
    progress                    INTEGER NOT NULL,
    total_devices               INTEGER NOT NULL,
    processed_devices           INTEGER NOT NULL,
    online_count                INTEGER NOT NULL,
    offline_count               INTEGER NOT NULL,
    operator                    TEXT NOT NULL,
    started_at                  TEXT NOT NULL,
    completed_at                TEXT,
    estimated_seconds_remaining INTEGER,
    error                       TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_started_at ON tasks (started_at);
";

impl SqliteTaskStore {
    pub fn open(path: &Path) -> Result<Self, FleetError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, FleetError> {
        self.conn.lock().map_err(|_| {
            FleetError::from(DomainError::Task {
                task_id: "-".to_string(),
                reason: "task store mutex poisoned".to_string(),
            })
        })
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        let mode: String = row.get("mode")?;
        let status: String = row.get("status")?;
        let started_at: String = row.get("started_at")?;
        let completed_at: Option<String> = row.get("completed_at")?;
        Ok(Task {
            task_id: row.get("task_id")?,
            mode: TaskMode::parse(&mode).unwrap_or(TaskMode::Normal),
            status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
            progress: row.get::<_, i64>("progress")? as u8,
            total_devices: row.get::<_, i64>("total_devices")? as usize,
            processed_devices: row.get::<_, i64>("processed_devices")? as usize,
            online_count: row.get::<_, i64>("online_count")? as usize,
            offline_count: row.get::<_, i64>("offline_count")? as usize,
            operator: row.get("operator")?,
            started_at: parse_ts(&started_at),
            completed_at: completed_at.as_deref().map(parse_ts),
            estimated_seconds_remaining: row.get("estimated_seconds_remaining")?,
            error: row.get("error")?,
        })
    }

    fn upsert(&self, task: &Task) -> Result<(), FleetError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (task_id, mode, status, progress, total_devices,
                 processed_devices, online_count, offline_count, operator,
                 started_at, completed_at, estimated_seconds_remaining, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(task_id) DO UPDATE SET
                 mode = excluded.mode,
                 status = excluded.status,
                 progress = excluded.progress,
                 total_devices = excluded.total_devices,
                 processed_devices = excluded.processed_devices,
                 online_count = excluded.online_count,
                 offline_count = excluded.offline_count,
                 operator = excluded.operator,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 estimated_seconds_remaining = excluded.estimated_seconds_remaining,
                 error = excluded.error",
            params![
                task.task_id,
                task.mode.as_str(),
                task.status.as_str(),
                task.progress as i64,
                task.total_devices as i64,
                task.processed_devices as i64,
                task.online_count as i64,
                task.offline_count as i64,
                task.operator,
                task.started_at.to_rfc3339(),
                task.completed_at.map(|t| t.to_rfc3339()),
                task.estimated_seconds_remaining,
                task.error,
            ],
        )?;
        Ok(())
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), FleetError> {
        self.upsert(task)
    }

    async fn update(&self, task: &Task) -> Result<(), FleetError> {
        self.upsert(task)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>, FleetError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM tasks WHERE task_id = ?1")?;
        let mut rows = stmt.query_map(params![task_id], Self::row_to_task)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn latest(&self) -> Result<Option<Task>, FleetError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT * FROM tasks ORDER BY started_at DESC, task_id DESC LIMIT 1")?;
        let mut rows = stmt.query_map([], Self::row_to_task)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn latest_completed(&self, mode: TaskMode) -> Result<Option<Task>, FleetError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks WHERE mode = ?1 AND status = 'completed'
             ORDER BY started_at DESC, task_id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![mode.as_str()], Self::row_to_task)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Task>, FleetError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks ORDER BY started_at DESC, task_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    async fn stats(&self) -> Result<TaskStats, FleetError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM tasks")?;
        let rows = stmt.query_map([], Self::row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(TaskStats::from_tasks(tasks.iter()))
    }

    async fn delete_older_than(&self, days: i64) -> Result<usize, FleetError> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM tasks
             WHERE status IN ('completed', 'failed', 'cancelled') AND started_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}
