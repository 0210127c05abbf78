// Reconciliation Orchestrator
//
// Fleet-wide presence recomputation as a trackable, cancellable, paginated
// job. A run reads the directory in pages ordered by device id, applies the
// liveness calculator to each record, and bulk-writes only the records whose
// cached verdict changed. The Task record is the single witness of the run:
// progress, counts and ETA are persisted after every page.
//
// Concurrency notes (kept as observed behavior, not "fixed"):
// - The in-flight guard is keyed by task id. It stops the same task from
//   being processed twice, and deliberately does NOT serialize two different
//   runs against each other.
// - A page's read is not serialized against concurrent heartbeat writes to
//   the same devices. A device flipped offline by a page can be corrected a
//   moment later by its own heartbeat, and a heartbeat landing mid-page may
//   not be reflected in that page's snapshot. There is no compare-and-swap;
//   adding one would change observable semantics.
// - Cancellation is cooperative and coarse: observed once per page boundary,
//   never mid-page. A cancelled run keeps the counts it accumulated.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{DomainError, FleetError};
use crate::presence::{presence, Presence};
use crate::store::DeviceStore;
use crate::tasks::{Task, TaskMode, TaskStats, TaskStatus, TaskStore};

/// Normal-mode runs inside this window after the previous completed normal
/// run are refused. Fixed by policy, not configurable.
pub const NORMAL_RUN_THROTTLE_SECS: i64 = 5 * 60;

/// Structured answer to "may a normal-mode run start now?"
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleVerdict {
    pub can_run: bool,
    pub minutes_since_last_run: Option<i64>,
    pub minutes_left: i64,
}

/// External refresh triggered after a completed run; fire and forget
pub trait MetricsHook: Send + Sync {
    fn refresh(&self);
}

struct NoopMetrics;

impl MetricsHook for NoopMetrics {
    fn refresh(&self) {}
}

/// The reconciliation service. Explicitly constructed and passed by `Arc`;
/// there is no global instance.
pub struct Reconciler {
    devices: Arc<dyn DeviceStore>,
    tasks: Arc<dyn TaskStore>,
    batch_size: usize,
    online_timeout: Duration,
    /// Task ids currently being processed by this instance
    in_flight: Mutex<HashSet<String>>,
    metrics: Arc<dyn MetricsHook>,
}

impl Reconciler {
    pub fn new(devices: Arc<dyn DeviceStore>, tasks: Arc<dyn TaskStore>, config: &Config) -> Self {
        Self {
            devices,
            tasks,
            batch_size: config.reconcile.batch_size.max(1),
            online_timeout: config.online_timeout(),
            in_flight: Mutex::new(HashSet::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics_hook(mut self, hook: Arc<dyn MetricsHook>) -> Self {
        self.metrics = hook;
        self
    }

    /// Whether a normal-mode run may start at `now`, with the wait metadata
    /// a refusal carries
    pub async fn check_throttle(&self, now: DateTime<Utc>) -> Result<ThrottleVerdict, FleetError> {
        let window = Duration::seconds(NORMAL_RUN_THROTTLE_SECS);
        match self.tasks.latest_completed(TaskMode::Normal).await? {
            Some(last) => {
                let elapsed = now.signed_duration_since(last.started_at);
                if elapsed < window {
                    let left_secs = NORMAL_RUN_THROTTLE_SECS - elapsed.num_seconds();
                    Ok(ThrottleVerdict {
                        can_run: false,
                        minutes_since_last_run: Some(elapsed.num_minutes()),
                        minutes_left: (left_secs + 59) / 60,
                    })
                } else {
                    Ok(ThrottleVerdict {
                        can_run: true,
                        minutes_since_last_run: Some(elapsed.num_minutes()),
                        minutes_left: 0,
                    })
                }
            }
            None => Ok(ThrottleVerdict {
                can_run: true,
                minutes_since_last_run: None,
                minutes_left: 0,
            }),
        }
    }

    /// Start a fleet-wide run. Returns the pending Task immediately; the
    /// processing loop runs in a spawned task.
    pub async fn start_run(
        self: &Arc<Self>,
        mode: TaskMode,
        operator: &str,
    ) -> Result<Task, FleetError> {
        if mode == TaskMode::Normal {
            let verdict = self.check_throttle(Utc::now()).await?;
            if !verdict.can_run {
                return Err(DomainError::Throttled {
                    minutes_since_last_run: verdict.minutes_since_last_run.unwrap_or(0),
                    minutes_left: verdict.minutes_left,
                }
                .into());
            }
        }

        let task = Task::new(mode, operator);
        self.tasks.insert(&task).await?;
        tracing::info!(
            task_id = %task.task_id,
            mode = mode.as_str(),
            operator = %operator,
            "Reconciliation run queued"
        );

        let reconciler = Arc::clone(self);
        let task_id = task.task_id.clone();
        tokio::spawn(async move {
            reconciler.process(task_id).await;
        });

        Ok(task)
    }

    /// Guarded entry point for one task id. Duplicate processing of the same
    /// id is refused; distinct ids run concurrently by design.
    async fn process(self: Arc<Self>, task_id: String) {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(task_id.clone()) {
                tracing::warn!(task_id = %task_id, "Task already processing, ignoring duplicate");
                return;
            }
        }

        if let Err(e) = self.run_pages(&task_id).await {
            self.persist_failure(&task_id, &e).await;
            // The triggering caller only logs; no retry, no rollback of
            // pages already written.
            tracing::error!(task_id = %task_id, error = %e, "Reconciliation run failed");
        }

        self.in_flight.lock().await.remove(&task_id);
    }

    async fn run_pages(&self, task_id: &str) -> Result<(), FleetError> {
        let run_started = Utc::now();
        let total = self.devices.count().await?;

        let mut task = self.get_task(task_id).await?;
        task.status = TaskStatus::Running;
        task.total_devices = total;
        self.tasks.update(&task).await?;
        tracing::info!(task_id = %task_id, total_devices = total, "Reconciliation run started");

        if total == 0 {
            return self.complete(task_id).await;
        }

        let mut offset = 0usize;
        let mut pages_done = 0usize;
        let mut processed = 0usize;
        let mut online = 0usize;
        let mut offline = 0usize;

        loop {
            // Cancellation is observed here, once per page boundary
            let boundary = self.get_task(task_id).await?;
            if boundary.status == TaskStatus::Cancelled {
                tracing::info!(
                    task_id = %task_id,
                    processed = processed,
                    "Run cancelled, stopping before next page"
                );
                return Ok(());
            }

            let page = self.devices.page(offset, self.batch_size).await?;
            if page.is_empty() {
                break;
            }

            let now = Utc::now();
            let mut deltas: Vec<(String, Presence)> = Vec::new();
            for record in &page {
                let verdict = presence(record.last_seen, now, self.online_timeout);
                match verdict {
                    Presence::Online => online += 1,
                    Presence::Offline => offline += 1,
                }
                if verdict != record.online_status {
                    deltas.push((record.cpe_id.clone(), verdict));
                }
            }

            if !deltas.is_empty() {
                let written = self.devices.bulk_set_presence(&deltas).await?;
                tracing::debug!(
                    task_id = %task_id,
                    page = pages_done,
                    changed = written,
                    "Presence deltas written"
                );
            }

            processed = (processed + page.len()).min(total);
            pages_done += 1;

            // Re-read before persisting: a cancel that landed mid-page must
            // keep its status while still receiving this page's counts
            let mut current = self.get_task(task_id).await?;
            current.processed_devices = processed;
            current.online_count = online;
            current.offline_count = offline;
            current.progress = ((processed as f64 / total as f64) * 100.0).round() as u8;
            if pages_done >= 2 && current.progress > 0 {
                let elapsed = Utc::now().signed_duration_since(run_started).num_seconds();
                current.estimated_seconds_remaining =
                    Some(elapsed * (100 - current.progress as i64) / current.progress as i64);
            }
            self.tasks.update(&current).await?;

            offset += self.batch_size;
        }

        self.complete(task_id).await
    }

    async fn complete(&self, task_id: &str) -> Result<(), FleetError> {
        let mut task = self.get_task(task_id).await?;
        if task.status == TaskStatus::Cancelled {
            // Cancelled after the last page; there is no later boundary to
            // observe it at, so honor it here
            return Ok(());
        }
        task.status = TaskStatus::Completed;
        task.progress = 100;
        task.completed_at = Some(Utc::now());
        task.estimated_seconds_remaining = Some(0);
        self.tasks.update(&task).await?;
        tracing::info!(
            task_id = %task_id,
            online = task.online_count,
            offline = task.offline_count,
            "Reconciliation run completed"
        );

        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            metrics.refresh();
        });
        Ok(())
    }

    async fn persist_failure(&self, task_id: &str, error: &FleetError) {
        match self.tasks.get(task_id).await {
            Ok(Some(mut task)) if !task.status.is_terminal() => {
                task.status = TaskStatus::Failed;
                task.error = Some(error.to_string());
                task.completed_at = Some(Utc::now());
                if let Err(persist_err) = self.tasks.update(&task).await {
                    tracing::error!(
                        task_id = %task_id,
                        error = %persist_err,
                        "Could not persist task failure"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Could not load task to mark failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Task operations exposed to the HTTP layer
    // ------------------------------------------------------------------

    pub async fn get_task(&self, task_id: &str) -> Result<Task, FleetError> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| {
                DomainError::TaskNotFound {
                    task_id: task_id.to_string(),
                }
                .into()
            })
    }

    pub async fn latest_task(&self) -> Result<Option<Task>, FleetError> {
        self.tasks.latest().await
    }

    pub async fn recent_tasks(&self, limit: usize) -> Result<Vec<Task>, FleetError> {
        self.tasks.recent(limit).await
    }

    /// Cancel a running task. The loop observes the new status at its next
    /// page boundary; accumulated counts are kept.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, FleetError> {
        let mut task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Running {
            return Err(DomainError::InvalidTransition {
                task_id: task_id.to_string(),
                status: task.status,
            }
            .into());
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        self.tasks.update(&task).await?;
        tracing::info!(task_id = %task_id, "Task cancelled");
        Ok(task)
    }

    pub async fn task_stats(&self) -> Result<TaskStats, FleetError> {
        self.tasks.stats().await
    }

    /// Delete terminal tasks older than the retention window
    pub async fn cleanup(&self, days_to_keep: i64) -> Result<usize, FleetError> {
        let deleted = self.tasks.delete_older_than(days_to_keep).await?;
        if deleted > 0 {
            tracing::info!(deleted = deleted, days = days_to_keep, "Old task records removed");
        }
        Ok(deleted)
    }
}
