//! The public face of the engine: submission, queries, cancellation,
//! executor management and the background maintenance loop.

use crate::config::EngineConfig;
use crate::decomposer::DecomposerRegistry;
use crate::events::EngineEvent;
use crate::monitor::EngineMonitor;
use crate::registry::{Executor, ExecutorRegistry, Liveness};
use crate::resources::ResourceManager;
use crate::scheduler::{ActorMessage, GraphActor, Shared};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskloom_core::{
    Constraints, ExecutionContext, ExecutorDescriptor, FailureReason, LogEntry, Task,
    TaskDescription, TaskFailure, TaskGraph, TaskId, TaskResult, TaskStatus, TaskloomError,
    TaskloomResult,
};
use taskloom_store::TaskStore;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

type Routes = Arc<Mutex<HashMap<TaskId, mpsc::UnboundedSender<ActorMessage>>>>;

/// Answer of [`Engine::get_result`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResultState {
    /// Not terminal yet.
    Pending,
    /// Completed; the result may be `success` or `partial`.
    Ready(TaskResult),
    /// Failed or cancelled.
    Error(TaskFailure),
}

/// The orchestration engine.
///
/// Accepts task submissions, runs one scheduling actor per root task and
/// exposes read-only views of task records and graphs. Must be created from
/// within a tokio runtime: construction spawns the monitor and maintenance
/// loops.
pub struct Engine {
    shared: Arc<Shared>,
    routes: Routes,
    actors: Mutex<Vec<JoinHandle<()>>>,
    monitor: Arc<EngineMonitor>,
    background: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Engine with the built-in decomposition strategies and an empty context.
    pub fn new(config: EngineConfig, store: Arc<dyn TaskStore>) -> TaskloomResult<Self> {
        Self::with_components(
            config,
            store,
            DecomposerRegistry::with_builtins(),
            ExecutionContext::default(),
        )
    }

    /// Engine with caller-supplied strategies and background context values.
    pub fn with_components(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        decomposers: DecomposerRegistry,
        context: ExecutionContext,
    ) -> TaskloomResult<Self> {
        config.validate()?;
        let monitor = Arc::new(EngineMonitor::new(config.monitor.clone()));
        let shared = Arc::new(Shared::new(config, store, decomposers, context));
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));

        let background = vec![
            tokio::spawn(monitor_loop(shared.events.subscribe(), monitor.clone())),
            tokio::spawn(maintenance_loop(
                shared.clone(),
                routes.clone(),
                monitor.clone(),
            )),
        ];

        info!(
            strategies = shared.decomposers.strategy_count(),
            "Engine started"
        );
        Ok(Self {
            shared,
            routes,
            actors: Mutex::new(Vec::new()),
            monitor,
            background,
        })
    }

    /// Accept a task and return its id. Decomposition and execution proceed
    /// in the background.
    pub async fn submit_task(
        &self,
        description: TaskDescription,
        constraints: Constraints,
    ) -> TaskloomResult<TaskId> {
        let mut task = Task::from_description(description, constraints);
        task.sequence = self.shared.reserve_sequence(1);
        self.shared.store.put_task(&task).await?;

        let id = task.id;
        info!(task_id = %id, name = %task.name, kind = %task.kind, "Task submitted");
        let _ = self.shared.events.send(EngineEvent::Submitted {
            task_id: id,
            name: task.name.clone(),
        });

        let handle = GraphActor::spawn(self.shared.clone(), task);
        self.routes.lock().insert(id, handle.tx);
        let mut actors = self.actors.lock();
        actors.retain(|actor| !actor.is_finished());
        actors.push(handle.join);
        Ok(id)
    }

    /// Snapshot of a task record.
    pub async fn get_task(&self, id: TaskId) -> TaskloomResult<Task> {
        self.shared
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| TaskloomError::NotFound(format!("task {id}")))
    }

    /// Snapshot of the graph of a root task.
    pub async fn get_graph(&self, root_id: TaskId) -> TaskloomResult<TaskGraph> {
        self.shared
            .store
            .get_graph(root_id)
            .await?
            .ok_or_else(|| TaskloomError::NotFound(format!("graph {root_id}")))
    }

    /// Request cancellation of a task and its descendants.
    ///
    /// Returns `false` when the task had already finished. In-flight attempts
    /// are signalled but their executors may keep running; whatever they
    /// return afterwards is discarded.
    pub async fn cancel_task(&self, id: TaskId) -> TaskloomResult<bool> {
        let task = self.get_task(id).await?;
        if task.is_terminal() {
            return Ok(false);
        }
        let route = self.routes.lock().get(&task.root_id).cloned();
        let Some(tx) = route else {
            return Ok(false);
        };
        let (reply, answer) = oneshot::channel();
        if tx.send(ActorMessage::Cancel { task_id: id, reply }).is_err() {
            // The graph finished in the meantime.
            return Ok(false);
        }
        answer.await.unwrap_or(Ok(false))
    }

    /// Result of a task, or `Pending` while it is not terminal.
    pub async fn get_result(&self, id: TaskId) -> TaskloomResult<ResultState> {
        let task = self.get_task(id).await?;
        let state = match task.status {
            TaskStatus::Completed => match task.result {
                Some(result) => ResultState::Ready(result),
                None => ResultState::Ready(TaskResult::success(serde_json::Value::Null)),
            },
            TaskStatus::Failed | TaskStatus::Cancelled => {
                match task.result.and_then(|r| r.error) {
                    Some(failure) => ResultState::Error(failure),
                    None => {
                        let reason = if task.status == TaskStatus::Failed {
                            FailureReason::ExecutorError
                        } else {
                            FailureReason::Cancelled
                        };
                        ResultState::Error(TaskFailure::new(reason, "no result recorded", id))
                    }
                }
            }
            _ => ResultState::Pending,
        };
        Ok(state)
    }

    /// Wait until a task reaches a terminal state and return its record.
    pub async fn wait_for(&self, id: TaskId) -> TaskloomResult<Task> {
        let mut events = self.shared.events.subscribe();
        loop {
            let task = self.get_task(id).await?;
            if task.is_terminal() {
                return Ok(task);
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.is_terminal_for(id) => break,
                    Ok(_) => {}
                    // Missed events: re-read the record.
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => {
                        return Err(TaskloomError::Cancelled("engine stopped".to_string()))
                    }
                }
            }
        }
    }

    /// Register an executor and its capacity.
    pub fn register_executor(
        &self,
        executor: Arc<dyn Executor>,
        liveness: Liveness,
    ) -> ExecutorDescriptor {
        let descriptor = self.shared.executors.register(executor, liveness);
        self.shared.resources.configure(&descriptor);
        descriptor
    }

    /// Change an executor's concurrency limit and compute budget.
    pub fn configure_executor_capacity(
        &self,
        executor_id: &str,
        concurrency_limit: usize,
        compute_budget: Option<u32>,
    ) -> TaskloomResult<()> {
        if !self.shared.executors.contains(executor_id)
            || !self
                .shared
                .resources
                .set_capacity(executor_id, concurrency_limit, compute_budget)
        {
            return Err(TaskloomError::NotFound(format!("executor {executor_id}")));
        }
        info!(executor_id, concurrency_limit, ?compute_budget, "Executor capacity changed");
        Ok(())
    }

    /// Remove an executor and its capacity. Attempts still running on it
    /// fail with `executor_lost` and are retried on another executor.
    pub fn deregister_executor(&self, executor_id: &str) -> TaskloomResult<()> {
        if !self.shared.executors.deregister(executor_id) {
            return Err(TaskloomError::NotFound(format!("executor {executor_id}")));
        }
        self.shared.resources.remove(executor_id);
        let senders: Vec<_> = self.routes.lock().values().cloned().collect();
        for tx in senders {
            let _ = tx.send(ActorMessage::ExecutorLost(executor_id.to_string()));
        }
        info!(executor_id, "Executor deregistered");
        Ok(())
    }

    /// Liveness signal from a remote executor.
    pub fn heartbeat(&self, executor_id: &str) -> TaskloomResult<()> {
        match self.shared.executors.heartbeat(executor_id) {
            None => Err(TaskloomError::NotFound(format!("executor {executor_id}"))),
            Some(revived) => {
                if revived {
                    let _ = self.shared.events.send(EngineEvent::ExecutorOnline {
                        executor_id: executor_id.to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Execution log of a task, oldest first.
    pub async fn read_log(&self, id: TaskId) -> TaskloomResult<Vec<LogEntry>> {
        self.shared.store.read_log(id).await
    }

    /// Remove finished root graphs older than `retention`; returns how many
    /// were removed.
    pub async fn sweep_retention(&self, retention: Duration) -> TaskloomResult<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| TaskloomError::Config(format!("retention out of range: {e}")))?;
        let cutoff = Utc::now() - retention;
        let removed = self.shared.store.sweep(cutoff).await?;
        if removed > 0 {
            info!(removed, "Retention sweep removed finished graphs");
        }
        Ok(removed)
    }

    /// Number of root graphs whose actor is still running.
    pub fn active_graphs(&self) -> usize {
        let mut actors = self.actors.lock();
        actors.retain(|actor| !actor.is_finished());
        actors.len()
    }

    /// Counters and alerts built from engine events.
    pub fn monitor(&self) -> &Arc<EngineMonitor> {
        &self.monitor
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Registered executors with their liveness and outcome statistics.
    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.shared.executors
    }

    /// Capacity and active leases shared by every graph.
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.shared.resources
    }

    /// Configuration the engine was started with.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Stop every graph actor and the background loops. Unfinished tasks keep
    /// their last persisted state.
    pub async fn shutdown(&self) {
        info!(graphs = self.active_graphs(), "Engine stopping");
        let routes: Vec<_> = self.routes.lock().drain().map(|(_, tx)| tx).collect();
        for tx in routes {
            let _ = tx.send(ActorMessage::Shutdown);
        }
        let actors: Vec<_> = self.actors.lock().drain(..).collect();
        for actor in actors {
            if let Err(err) = actor.await {
                warn!(error = %err, "Graph actor ended abnormally");
            }
        }
        for task in &self.background {
            task.abort();
        }
        info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

async fn monitor_loop(mut events: broadcast::Receiver<EngineEvent>, monitor: Arc<EngineMonitor>) {
    loop {
        match events.recv().await {
            Ok(event) => monitor.observe(&event).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Monitor fell behind the event stream");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Liveness sweeps, lease expiry and monitor checks.
async fn maintenance_loop(shared: Arc<Shared>, routes: Routes, monitor: Arc<EngineMonitor>) {
    let period = Duration::from_millis(shared.config.maintenance_interval_ms);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;

        for executor_id in shared.executors.sweep(shared.config.liveness_window()) {
            let _ = shared.events.send(EngineEvent::ExecutorOffline {
                executor_id: executor_id.clone(),
            });
            let senders: Vec<_> = routes.lock().values().cloned().collect();
            for tx in senders {
                let _ = tx.send(ActorMessage::ExecutorLost(executor_id.clone()));
            }
        }

        let now = Utc::now();
        for lease in shared.resources.expired(now) {
            let route = routes.lock().get(&lease.root_id).cloned();
            match route {
                Some(tx) => {
                    let _ = tx.send(ActorMessage::LeaseExpired(lease));
                }
                None => {
                    shared.resources.release(lease.task_id);
                }
            }
        }

        for alert in monitor.check(now).await {
            warn!(kind = ?alert.kind, message = %alert.message, "Monitor alert");
        }

        routes.lock().retain(|_, tx| !tx.is_closed());
    }
}
