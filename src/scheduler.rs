//! Background window reconciliation.
//!
//! Two periodic tasks keep the cached `is_active` flags fresh and drop
//! windows that have ended. A failed tick is logged and the loop carries on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::window::{RefreshOutcome, WindowGate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    StatusRefresh,
    ExpiredCleanup,
}

impl TaskKind {
    fn index(self) -> usize {
        match self {
            TaskKind::StatusRefresh => 0,
            TaskKind::ExpiredCleanup => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task: TaskKind,
    pub enabled: bool,
    pub runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub task_count: usize,
    pub tasks: Vec<TaskStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub refresh: RefreshOutcome,
    pub removed: u64,
}

struct Inner {
    gate: Arc<WindowGate>,
    config: EngineConfig,
    cancel: CancellationToken,
    tasks: Mutex<[TaskStatus; 2]>,
}

impl Inner {
    fn record<T>(&self, task: TaskKind, result: &Result<T>) {
        let mut tasks = self.tasks.lock();
        let status = &mut tasks[task.index()];
        status.runs += 1;
        status.last_run_at = Some(self.gate.now());
        status.last_error = result.as_ref().err().map(ToString::to_string);
    }

    async fn refresh(&self) -> Result<RefreshOutcome> {
        let result = self.gate.refresh_statuses().await;
        if let Err(err) = &result {
            warn!(error = %err, "window status refresh failed");
        }
        self.record(TaskKind::StatusRefresh, &result);
        result
    }

    async fn cleanup(&self) -> Result<CleanupOutcome> {
        let result = self.cleanup_pass().await;
        if let Err(err) = &result {
            warn!(error = %err, "expired window cleanup failed");
        }
        self.record(TaskKind::ExpiredCleanup, &result);
        result
    }

    /// Refreshes first so the delete decision sees current flags.
    async fn cleanup_pass(&self) -> Result<CleanupOutcome> {
        let refresh = self.gate.refresh_statuses().await?;
        let removed = self.gate.bulk_delete_expired(None).await?;
        Ok(CleanupOutcome { refresh, removed })
    }

    async fn run_loop(self: Arc<Self>, task: TaskKind, period: Duration) {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // Errors are already logged and recorded.
                    let _ = match task {
                        TaskKind::StatusRefresh => self.refresh().await.map(|_| ()),
                        TaskKind::ExpiredCleanup => self.cleanup().await.map(|_| ()),
                    };
                }
            }
        }
        debug!(?task, "reconciliation task stopped");
    }
}

/// Owns the reconciliation timers. Build once at startup and share by
/// reference; `shutdown` is safe to call more than once.
pub struct ReconciliationScheduler {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReconciliationScheduler {
    pub fn new(gate: Arc<WindowGate>, config: EngineConfig) -> Self {
        let status = |task, enabled| TaskStatus {
            task,
            enabled,
            runs: 0,
            last_run_at: None,
            last_error: None,
        };
        let tasks = [
            status(TaskKind::StatusRefresh, true),
            status(TaskKind::ExpiredCleanup, config.cleanup_enabled),
        ];
        Self {
            inner: Arc::new(Inner {
                gate,
                config,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(tasks),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the periodic tasks. Returns `false` if they are already
    /// running or the scheduler has been shut down.
    pub fn start(&self) -> bool {
        let mut handles = self.handles.lock();
        if !handles.is_empty() || self.inner.cancel.is_cancelled() {
            return false;
        }

        let config = &self.inner.config;
        handles.push(tokio::spawn(
            self.inner
                .clone()
                .run_loop(TaskKind::StatusRefresh, config.refresh_interval),
        ));
        if config.cleanup_enabled {
            handles.push(tokio::spawn(
                self.inner
                    .clone()
                    .run_loop(TaskKind::ExpiredCleanup, config.cleanup_interval),
            ));
        }
        info!(
            tasks = handles.len(),
            refresh_secs = config.refresh_interval.as_secs(),
            cleanup_secs = config.cleanup_interval.as_secs(),
            "reconciliation scheduler started"
        );
        true
    }

    pub async fn run_refresh_once(&self) -> Result<RefreshOutcome> {
        self.inner.refresh().await
    }

    pub async fn run_cleanup_once(&self) -> Result<CleanupOutcome> {
        self.inner.cleanup().await
    }

    pub fn status(&self) -> SchedulerStatus {
        let handles = self.handles.lock();
        let task_count = handles.iter().filter(|handle| !handle.is_finished()).count();
        SchedulerStatus {
            running: task_count > 0 && !self.inner.cancel.is_cancelled(),
            task_count,
            tasks: self.inner.tasks.lock().to_vec(),
        }
    }

    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "reconciliation task ended abnormally");
            }
        }
        info!("reconciliation scheduler stopped");
    }
}
