//! Executor contract and the live registry of executors.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskloom_core::{
    Constraints, ExecutionOutput, ExecutionRequest, ExecutorDescriptor, ProgressUpdate,
    Requirements, TaskId, TaskloomResult,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Channel an executor uses to stream progress for one attempt.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    task_id: TaskId,
    attempt: u32,
    tx: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl ProgressSink {
    pub(crate) fn new(
        task_id: TaskId,
        attempt: u32,
        tx: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Self {
        Self {
            task_id,
            attempt,
            tx: Some(tx),
        }
    }

    /// A sink that drops every update.
    pub fn detached(task_id: TaskId, attempt: u32) -> Self {
        Self {
            task_id,
            attempt,
            tx: None,
        }
    }

    /// Report progress. The fraction is clamped to `[0, 1]`.
    pub fn report(&self, fraction: f64, note: Option<String>) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        if let Some(tx) = &self.tx {
            // The attempt may already be finished; late updates are dropped.
            let _ = tx.send(ProgressUpdate {
                task_id: self.task_id,
                attempt: self.attempt,
                fraction,
                note,
            });
        }
    }
}

/// Anything that can perform the content of an atomic task.
#[async_trait]
pub trait Executor: Send + Sync {
    fn descriptor(&self) -> &ExecutorDescriptor;

    /// Run one attempt. The engine enforces `request.deadline` itself.
    async fn execute(
        &self,
        request: ExecutionRequest,
        progress: ProgressSink,
    ) -> TaskloomResult<ExecutionOutput>;

    /// Cooperative stop request for an in-flight attempt.
    async fn cancel(&self, _task_id: TaskId) {}
}

/// How liveness is established for an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// In-process; always considered alive.
    Local,
    /// Must heartbeat within the liveness window.
    Remote,
}

/// Historical outcome counters of one executor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub succeeded: u64,
    pub failed: u64,
    pub total_duration_ms: u64,
}

impl ExecutorStats {
    /// Share of successful attempts; 1.0 before any attempt.
    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            1.0
        } else {
            self.succeeded as f64 / total as f64
        }
    }

    /// Mean attempt duration in milliseconds; 0 before any attempt.
    pub fn average_duration_ms(&self) -> u64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            0
        } else {
            self.total_duration_ms / total
        }
    }
}

/// Serializable view of a registered executor.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub descriptor: ExecutorDescriptor,
    pub liveness: Liveness,
    pub online: bool,
    pub stats: ExecutorStats,
}

struct Entry {
    executor: Arc<dyn Executor>,
    liveness: Liveness,
    online: bool,
    last_heartbeat: Instant,
    stats: ExecutorStats,
}

/// A matched executor.
#[derive(Clone)]
pub struct Candidate {
    pub descriptor: ExecutorDescriptor,
    pub executor: Arc<dyn Executor>,
}

/// Live set of executors and their capability advertisements.
#[derive(Default)]
pub struct ExecutorRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an executor. It starts online.
    pub fn register(&self, executor: Arc<dyn Executor>, liveness: Liveness) -> ExecutorDescriptor {
        let descriptor = executor.descriptor().clone();
        info!(
            executor_id = %descriptor.id,
            capabilities = ?descriptor.capabilities,
            ?liveness,
            "Registered executor"
        );
        self.entries.write().insert(
            descriptor.id.clone(),
            Entry {
                executor,
                liveness,
                online: true,
                last_heartbeat: Instant::now(),
                stats: ExecutorStats::default(),
            },
        );
        descriptor
    }

    /// Remove an executor. Returns whether it was registered.
    pub fn deregister(&self, id: &str) -> bool {
        self.entries.write().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.entries.read().get(id).is_some_and(|e| e.online)
    }

    /// Record a heartbeat. Returns `Some(true)` when the executor was offline
    /// and is now back, `None` when it is unknown.
    pub fn heartbeat(&self, id: &str) -> Option<bool> {
        self.heartbeat_at(id, Instant::now())
    }

    pub(crate) fn heartbeat_at(&self, id: &str, now: Instant) -> Option<bool> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(id)?;
        entry.last_heartbeat = now;
        let revived = !entry.online;
        entry.online = true;
        if revived {
            info!(executor_id = %id, "Executor back online");
        }
        Some(revived)
    }

    /// Mark remote executors silent for longer than `window` offline and
    /// return the ids that just went offline.
    pub fn sweep(&self, window: Duration) -> Vec<String> {
        self.sweep_at(Instant::now(), window)
    }

    pub(crate) fn sweep_at(&self, now: Instant, window: Duration) -> Vec<String> {
        let mut lost = Vec::new();
        for (id, entry) in self.entries.write().iter_mut() {
            if entry.liveness == Liveness::Remote
                && entry.online
                && now.saturating_duration_since(entry.last_heartbeat) > window
            {
                entry.online = false;
                warn!(executor_id = %id, "Executor missed its liveness window");
                lost.push(id.clone());
            }
        }
        lost.sort();
        lost
    }

    /// Online executors advertising every required capability (and the
    /// isolation class, when set), best first: lowest `load`, then highest
    /// success rate, then shortest average duration, then id.
    pub fn find(
        &self,
        requirements: &Requirements,
        constraints: &Constraints,
        load: impl Fn(&str) -> f64,
    ) -> Vec<Candidate> {
        let entries = self.entries.read();
        let mut matched: Vec<(f64, f64, u64, Candidate)> = entries
            .values()
            .filter(|e| e.online)
            .filter(|e| {
                let desc = e.executor.descriptor();
                desc.supports(&requirements.capabilities)
                    && constraints
                        .isolation
                        .as_ref()
                        .map_or(true, |iso| desc.capabilities.contains(iso))
            })
            .map(|e| {
                let descriptor = e.executor.descriptor().clone();
                (
                    load(&descriptor.id),
                    e.stats.success_rate(),
                    e.stats.average_duration_ms(),
                    Candidate {
                        descriptor,
                        executor: e.executor.clone(),
                    },
                )
            })
            .collect();
        matched.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(b.1.total_cmp(&a.1))
                .then(a.2.cmp(&b.2))
                .then_with(|| a.3.descriptor.id.cmp(&b.3.descriptor.id))
        });
        matched.into_iter().map(|(_, _, _, c)| c).collect()
    }

    /// Record how an attempt on `id` ended.
    pub fn record_outcome(&self, id: &str, success: bool, duration_ms: u64) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            if success {
                entry.stats.succeeded += 1;
            } else {
                entry.stats.failed += 1;
            }
            entry.stats.total_duration_ms += duration_ms;
        }
    }

    /// Snapshot of every executor, sorted by id.
    pub fn list(&self) -> Vec<ExecutorStatus> {
        let mut list: Vec<ExecutorStatus> = self
            .entries
            .read()
            .values()
            .map(|e| ExecutorStatus {
                descriptor: e.executor.descriptor().clone(),
                liveness: e.liveness,
                online: e.online,
                stats: e.stats.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        list
    }

    pub fn executor_count(&self) -> usize {
        self.entries.read().len()
    }
}
