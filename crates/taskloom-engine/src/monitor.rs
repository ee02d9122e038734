use crate::config::MonitorConfig;
use crate::events::EngineEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use taskloom_core::{AttemptOutcome, FailureReason, TaskId, TaskStatus};
use tokio::sync::RwLock;
use tracing::warn;

/// Engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineMetrics {
    pub submitted: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub executor_lost: u64,
    pub denials: u64,
}

/// Kind of alert raised by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Executing with no progress or transition for too long.
    Stalled,
    /// Executing for longer than the runaway threshold.
    Runaway,
    ExecutorOffline,
    /// A root task failed.
    GraphFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub task_id: Option<TaskId>,
    pub executor_id: Option<String>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// A task currently executing, as tracked from events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningTask {
    pub task_id: TaskId,
    pub attempt: u32,
    pub executor_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub progress: f64,
}

#[derive(Debug, Default)]
struct MonitorState {
    metrics: EngineMetrics,
    running: HashMap<TaskId, RunningTask>,
    alerts: Vec<Alert>,
    /// (task or executor, kind) pairs already alerted.
    raised: HashSet<(String, AlertKind)>,
}

impl MonitorState {
    fn raise(&mut self, key: String, alert: Alert) -> Option<Alert> {
        if !self.raised.insert((key, alert.kind)) {
            return None;
        }
        warn!(kind = ?alert.kind, message = %alert.message, "Monitor alert");
        self.alerts.push(alert.clone());
        Some(alert)
    }
}

/// Tracks execution state and metrics for every graph in the engine.
///
/// Fed from the engine's event stream; readers get snapshots.
pub struct EngineMonitor {
    config: MonitorConfig,
    state: Arc<RwLock<MonitorState>>,
}

impl EngineMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(MonitorState::default())),
        }
    }

    /// Fold one event into the counters and running set.
    pub async fn observe(&self, event: &EngineEvent) {
        let mut state = self.state.write().await;
        match event {
            EngineEvent::Submitted { .. } => state.metrics.submitted += 1,
            EngineEvent::AttemptStarted {
                task_id,
                attempt,
                executor_id,
                ..
            } => {
                state.metrics.dispatched += 1;
                let now = Utc::now();
                state.running.insert(
                    *task_id,
                    RunningTask {
                        task_id: *task_id,
                        attempt: *attempt,
                        executor_id: executor_id.clone(),
                        started_at: now,
                        last_activity: now,
                        progress: 0.0,
                    },
                );
            }
            EngineEvent::AttemptFinished {
                task_id, outcome, ..
            } => {
                state.running.remove(task_id);
                if let AttemptOutcome::Failed { failure } = outcome {
                    match failure.reason {
                        FailureReason::Timeout => state.metrics.timeouts += 1,
                        FailureReason::ExecutorLost => state.metrics.executor_lost += 1,
                        _ => {}
                    }
                }
            }
            EngineEvent::RetryScheduled { .. } => state.metrics.retries += 1,
            EngineEvent::AllocationDenied { .. } => state.metrics.denials += 1,
            EngineEvent::Progress(update) => {
                if let Some(running) = state.running.get_mut(&update.task_id) {
                    running.progress = update.fraction;
                    running.last_activity = Utc::now();
                }
            }
            EngineEvent::StatusChanged {
                task_id,
                parent_id,
                to,
                at,
                ..
            } => {
                match to {
                    TaskStatus::Completed => state.metrics.completed += 1,
                    TaskStatus::Failed => state.metrics.failed += 1,
                    TaskStatus::Cancelled => state.metrics.cancelled += 1,
                    _ => {}
                }
                if to.is_terminal() {
                    state.running.remove(task_id);
                } else if let Some(running) = state.running.get_mut(task_id) {
                    running.last_activity = *at;
                }
                if *to == TaskStatus::Failed && parent_id.is_none() {
                    state.raise(
                        task_id.to_string(),
                        Alert {
                            kind: AlertKind::GraphFailed,
                            task_id: Some(*task_id),
                            executor_id: None,
                            message: format!("root task {task_id} failed"),
                            raised_at: *at,
                        },
                    );
                }
            }
            EngineEvent::ExecutorOffline { executor_id } => {
                state.raise(
                    executor_id.clone(),
                    Alert {
                        kind: AlertKind::ExecutorOffline,
                        task_id: None,
                        executor_id: Some(executor_id.clone()),
                        message: format!("executor {executor_id} missed its liveness window"),
                        raised_at: Utc::now(),
                    },
                );
            }
            EngineEvent::ExecutorOnline { executor_id } => {
                // A later outage alerts again.
                state
                    .raised
                    .remove(&(executor_id.clone(), AlertKind::ExecutorOffline));
            }
        }
    }

    /// Raise `stalled` and `runaway` alerts for running tasks; returns the
    /// alerts raised by this call.
    pub async fn check(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let stall = chrono::Duration::milliseconds(self.config.stall_threshold_ms as i64);
        let runaway = chrono::Duration::milliseconds(self.config.runaway_threshold_ms as i64);
        let mut state = self.state.write().await;
        let candidates: Vec<RunningTask> = state.running.values().cloned().collect();
        let mut raised = Vec::new();
        for task in candidates {
            if now - task.started_at > runaway {
                raised.extend(state.raise(
                    task.task_id.to_string(),
                    Alert {
                        kind: AlertKind::Runaway,
                        task_id: Some(task.task_id),
                        executor_id: Some(task.executor_id.clone()),
                        message: format!(
                            "task {} has been executing since {}",
                            task.task_id, task.started_at
                        ),
                        raised_at: now,
                    },
                ));
            } else if now - task.last_activity > stall {
                raised.extend(state.raise(
                    task.task_id.to_string(),
                    Alert {
                        kind: AlertKind::Stalled,
                        task_id: Some(task.task_id),
                        executor_id: Some(task.executor_id.clone()),
                        message: format!(
                            "task {} reported no activity since {}",
                            task.task_id, task.last_activity
                        ),
                        raised_at: now,
                    },
                ));
            }
        }
        raised
    }

    pub async fn metrics(&self) -> EngineMetrics {
        self.state.read().await.metrics.clone()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.state.read().await.alerts.clone()
    }

    /// Currently executing tasks, oldest first.
    pub async fn running(&self) -> Vec<RunningTask> {
        let state = self.state.read().await;
        let mut running: Vec<RunningTask> = state.running.values().cloned().collect();
        running.sort_by_key(|r| (r.started_at, r.task_id));
        running
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let state = self.state.read().await;
        let mut running: Vec<&RunningTask> = state.running.values().collect();
        running.sort_by_key(|r| (r.started_at, r.task_id));
        serde_json::json!({
            "metrics": state.metrics,
            "running": running,
            "alerts": state.alerts,
        })
    }
}

impl Default for EngineMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}
