//! The per-graph scheduling actor.
//!
//! Every root task gets one [`GraphActor`]. It owns the task records of its
//! graph, the graph itself and the resolver, and is the only writer of those
//! records. Completions, retries, cancellations and executor failures reach
//! it as messages, so updates to one graph are serialized while different
//! graphs run fully in parallel.
//!
//! Store writes and event publication are batched at the end of every
//! message: records are written first, then events are sent, so anyone
//! reacting to an event can read the matching state back.

use crate::aggregator::{self, Child, Verdict};
use crate::config::EngineConfig;
use crate::controller::{self, AttemptResult, RetryDecision};
use crate::decomposer::{materialize, DecomposerRegistry};
use crate::events::EngineEvent;
use crate::registry::{Candidate, ExecutorRegistry, ProgressSink};
use crate::resolver::{BlockCause, NodeInfo, Resolution, Resolver};
use crate::resources::{Allocation, Lease, LeaseRequest, ResourceManager};
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use taskloom_core::{
    AttemptOutcome, AttemptRecord, ExecutionContext, ExecutionPlan, ExecutionRequest,
    FailureReason, GraphNode, LogEntry, NodeType, OrderingStrategy, ProgressUpdate, Task,
    TaskFailure, TaskGraph, TaskId, TaskResult, TaskStatus, TaskloomError, TaskloomResult,
};
use taskloom_store::TaskStore;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Components every graph actor shares.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub store: Arc<dyn TaskStore>,
    pub executors: Arc<ExecutorRegistry>,
    pub resources: Arc<ResourceManager>,
    pub decomposers: Arc<DecomposerRegistry>,
    pub events: broadcast::Sender<EngineEvent>,
    /// Background values handed to decomposers and executors.
    pub context: ExecutionContext,
    sequence: AtomicU64,
}

impl Shared {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        decomposers: DecomposerRegistry,
        context: ExecutionContext,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            resources: Arc::new(ResourceManager::new(config.max_concurrent_tasks)),
            config,
            store,
            executors: Arc::new(ExecutorRegistry::new()),
            decomposers: Arc::new(decomposers),
            events,
            context,
            sequence: AtomicU64::new(0),
        }
    }

    /// Reserve `n` consecutive creation sequence numbers.
    pub fn reserve_sequence(&self, n: u64) -> u64 {
        self.sequence.fetch_add(n, Ordering::SeqCst)
    }
}

/// Messages a graph actor understands.
pub(crate) enum ActorMessage {
    AttemptFinished {
        task_id: TaskId,
        attempt: u32,
        result: AttemptResult,
    },
    RetryDue(TaskId),
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<TaskloomResult<bool>>,
    },
    ExecutorLost(String),
    LeaseExpired(Lease),
    Shutdown,
}

struct InFlight {
    attempt: u32,
    executor_id: String,
    cancel: watch::Sender<bool>,
}

/// Follow-up work produced while handling a message.
enum Work {
    /// The task just became terminal: update the resolver and the parent.
    Settled(TaskId),
    /// Re-run aggregation for a composite.
    Aggregate(TaskId),
}

/// Single writer of one root task's graph.
pub(crate) struct GraphActor {
    shared: Arc<Shared>,
    root_id: TaskId,
    ordering: OrderingStrategy,
    tasks: HashMap<TaskId, Task>,
    graph: TaskGraph,
    resolver: Resolver,
    in_flight: HashMap<TaskId, InFlight>,
    /// Tasks whose retry backoff has elapsed.
    retry_ready: BTreeSet<TaskId>,
    /// Tasks denied a lease since their last dispatch.
    denied: HashSet<TaskId>,
    work: VecDeque<Work>,
    tx: mpsc::UnboundedSender<ActorMessage>,
    progress_tx: mpsc::UnboundedSender<ProgressUpdate>,
    dirty: BTreeSet<TaskId>,
    graph_dirty: bool,
    logs: Vec<(TaskId, LogEntry)>,
    outbox: Vec<EngineEvent>,
}

/// Handle returned when an actor is spawned.
pub(crate) struct ActorHandle {
    pub tx: mpsc::UnboundedSender<ActorMessage>,
    pub join: tokio::task::JoinHandle<()>,
}

impl GraphActor {
    /// Spawn the actor for an already persisted root task.
    pub fn spawn(shared: Arc<Shared>, root: Task) -> ActorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let ordering = root
            .execution
            .plan
            .as_ref()
            .map(|p| p.ordering)
            .unwrap_or_default();
        let root_id = root.id;
        let actor = GraphActor {
            shared,
            root_id,
            ordering,
            tasks: HashMap::from([(root_id, root)]),
            graph: TaskGraph::new(root_id),
            resolver: Resolver::new(ordering),
            in_flight: HashMap::new(),
            retry_ready: BTreeSet::new(),
            denied: HashSet::new(),
            work: VecDeque::new(),
            tx: tx.clone(),
            progress_tx,
            dirty: BTreeSet::new(),
            graph_dirty: true,
            logs: Vec::new(),
            outbox: Vec::new(),
        };
        let join = tokio::spawn(actor.run(rx, progress_rx));
        ActorHandle { tx, join }
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ActorMessage>,
        mut progress_rx: mpsc::UnboundedReceiver<ProgressUpdate>,
    ) {
        info!(root_id = %self.root_id, "Graph actor started");
        self.start().await;
        self.step().await;

        let resources = self.shared.resources.clone();
        let mut tick = tokio::time::interval(self.shared.config.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.is_finished() {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(ActorMessage::Shutdown) | None => {
                        self.abandon();
                        break;
                    }
                    Some(msg) => self.handle(msg),
                },
                Some(update) = progress_rx.recv() => self.on_progress(update),
                _ = resources.released() => {}
                _ = tick.tick() => {}
            }
            self.step().await;
        }
        info!(root_id = %self.root_id, "Graph actor finished");
    }

    fn is_finished(&self) -> bool {
        self.tasks
            .get(&self.root_id)
            .map_or(true, |root| root.is_terminal())
    }

    /// Drain follow-up work, dispatch what is ready, then write and publish.
    async fn step(&mut self) {
        self.drain();
        if !self.is_finished() {
            self.dispatch().await;
            self.drain();
        }
        self.flush().await;
    }

    /// Plan the root: atomic roots become the single node of their graph,
    /// composite roots are decomposed.
    async fn start(&mut self) {
        let Some(root) = self.tasks.get(&self.root_id) else {
            return;
        };
        if root.kind.is_composite() {
            self.expand(self.root_id).await;
            return;
        }
        let info = NodeInfo {
            id: root.id,
            node_type: NodeType::Task,
            priority: root.priority,
            depth: root.depth,
            sequence: root.sequence,
        };
        let node = GraphNode {
            id: root.id,
            name: root.name.clone(),
            node_type: NodeType::Task,
            status: root.status,
            estimated_duration_ms: root.requirements.estimated_duration_ms,
        };
        self.graph.add_node(node);
        self.set_status(self.root_id, TaskStatus::Planned);
        self.resolver.insert(&[info], &[], &HashMap::new());
    }

    fn handle(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::AttemptFinished {
                task_id,
                attempt,
                result,
            } => self.on_attempt_finished(task_id, attempt, result),
            ActorMessage::RetryDue(task_id) => {
                if self
                    .tasks
                    .get(&task_id)
                    .is_some_and(|t| t.status == TaskStatus::Scheduled)
                {
                    self.retry_ready.insert(task_id);
                }
            }
            ActorMessage::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(task_id));
            }
            ActorMessage::ExecutorLost(executor_id) => self.on_executor_lost(&executor_id),
            ActorMessage::LeaseExpired(lease) => self.on_lease_expired(lease),
            ActorMessage::Shutdown => {}
        }
    }

    // ---- dispatch -------------------------------------------------------

    async fn dispatch(&mut self) {
        let mut queue: Vec<TaskId> = self.retry_ready.iter().copied().collect();
        queue.extend(self.resolver.ready());
        // Stable: keeps the resolver's order within one priority.
        queue.sort_by_key(|id| Reverse(self.tasks.get(id).map_or(i32::MIN, |t| t.priority)));

        for id in queue {
            if self.is_finished() {
                return;
            }
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if task.is_terminal() || self.in_flight.contains_key(&id) {
                self.retry_ready.remove(&id);
                continue;
            }
            let node_type = self.node_type(id);
            if node_type.is_control() {
                self.resolver.mark_dispatched(id);
                self.complete_control(id);
            } else if task.kind.is_composite() {
                self.resolver.mark_dispatched(id);
                self.expand(id).await;
            } else {
                self.try_start_attempt(id);
            }
        }
    }

    fn try_start_attempt(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let now = Utc::now();
        let deadline = controller::attempt_deadline(task, &self.shared.config, now);
        if deadline <= now {
            let failure = TaskFailure::new(
                FailureReason::Timeout,
                "deadline passed before the attempt could start",
                id,
            );
            self.resolver.mark_dispatched(id);
            self.retry_ready.remove(&id);
            self.fail_task(id, failure);
            return;
        }

        let resources = self.shared.resources.clone();
        let candidates: Vec<Candidate> = self.shared.executors.find(
            &task.requirements,
            &task.constraints,
            |executor_id| resources.load(executor_id),
        );
        let descriptors: Vec<_> = candidates.iter().map(|c| c.descriptor.clone()).collect();
        let request = LeaseRequest {
            task_id: id,
            root_id: self.root_id,
            class: task.requirements.resource_class,
            expires_at: deadline
                .checked_add_signed(chrono::Duration::milliseconds(
                    self.shared.config.lease_grace_ms as i64,
                ))
                .unwrap_or(deadline),
        };

        let lease = match resources.allocate(&request, &descriptors) {
            Allocation::Granted(lease) => lease,
            Allocation::Denied(reason) => {
                if self.denied.insert(id) {
                    debug!(task_id = %id, %reason, "Allocation denied; task deferred");
                    self.outbox.push(EngineEvent::AllocationDenied {
                        task_id: id,
                        reason: reason.to_string(),
                    });
                }
                return;
            }
        };
        let Some(candidate) = candidates
            .into_iter()
            .find(|c| c.descriptor.id == lease.executor_id)
        else {
            resources.release(id);
            return;
        };

        self.denied.remove(&id);
        self.retry_ready.remove(&id);
        self.resolver.mark_dispatched(id);
        // A denied task stays planned, so a task is scheduled only once its
        // executor holds a lease for it. Retries wait out their backoff here.
        if self.tasks.get(&id).is_some_and(|t| t.status == TaskStatus::Planned) {
            self.set_status(id, TaskStatus::Scheduled);
        }
        self.set_status(id, TaskStatus::Executing);

        let context = self.context_for(id);
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        task.execution.attempt_count += 1;
        let attempt = task.execution.attempt_count;
        task.execution.started_at.get_or_insert(now);
        task.execution.executor_id = Some(lease.executor_id.clone());
        task.execution.progress = 0.0;
        task.execution.history.push(AttemptRecord {
            attempt,
            executor_id: lease.executor_id.clone(),
            started_at: now,
            finished_at: None,
            outcome: AttemptOutcome::Running,
        });
        let entry = task.log(format!(
            "attempt {attempt} dispatched to {} (deadline {deadline})",
            lease.executor_id
        ));
        let request = ExecutionRequest {
            task_id: id,
            task_name: task.name.clone(),
            attempt,
            parameters: task.objective.clone(),
            deadline,
            context,
        };
        self.logs.push((id, entry));
        self.dirty.insert(id);
        info!(task_id = %id, attempt, executor_id = %lease.executor_id, "Attempt dispatched");
        self.outbox.push(EngineEvent::AttemptStarted {
            task_id: id,
            attempt,
            executor_id: lease.executor_id.clone(),
            deadline,
        });

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.in_flight.insert(
            id,
            InFlight {
                attempt,
                executor_id: lease.executor_id,
                cancel: cancel_tx,
            },
        );
        let sink = ProgressSink::new(id, attempt, self.progress_tx.clone());
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = controller::run_attempt(candidate.executor, request, sink, cancel_rx).await;
            let _ = tx.send(ActorMessage::AttemptFinished {
                task_id: id,
                attempt,
                result,
            });
        });
    }

    /// Decision and merge nodes finish inside the engine with the merged
    /// payloads of their completed predecessors.
    fn complete_control(&mut self, id: TaskId) {
        let payload = aggregator::merge_by_name(
            self.graph
                .incoming(id)
                .filter_map(|e| self.tasks.get(&e.source))
                .filter(|t| t.status == TaskStatus::Completed),
        );
        self.set_status(id, TaskStatus::Executing);
        self.set_status(id, TaskStatus::Completed);
        if let Some(task) = self.tasks.get_mut(&id) {
            task.result = Some(TaskResult::success(payload));
        }
        self.work.push_back(Work::Settled(id));
    }

    /// Decompose a composite and insert its children into the graph.
    async fn expand(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(&id).cloned() else {
            return;
        };
        let context = self.context_for(id);
        let expansion = match self.shared.decomposers.decompose(&task, &context).await {
            Ok(decomposition) => {
                let mut sequence =
                    self.shared.reserve_sequence(decomposition.subtasks.len() as u64);
                materialize(&task, decomposition, &mut sequence)
            }
            Err(err) => Err(err),
        };
        let expansion = match expansion {
            Ok(expansion) => expansion,
            Err(err) => {
                warn!(task_id = %id, error = %err, "Decomposition failed");
                let failure =
                    TaskFailure::new(FailureReason::DecompositionError, err.to_string(), id);
                self.fail_task(id, failure);
                return;
            }
        };

        info!(
            task_id = %id,
            subtasks = expansion.subtasks.len(),
            method = %expansion.method,
            "Task decomposed"
        );
        self.set_status(id, TaskStatus::Decomposed);
        if let Some(parent) = self.tasks.get_mut(&id) {
            parent.subtasks = expansion.subtasks.iter().map(|t| t.id).collect();
            parent.execution.plan = Some(ExecutionPlan {
                ordering: self.ordering,
                method: Some(expansion.method.clone()),
                planned_at: Utc::now(),
            });
            let entry = parent.log(format!(
                "decomposed by {} into {} subtasks",
                expansion.method,
                expansion.subtasks.len()
            ));
            self.logs.push((id, entry));
        }
        self.set_status(id, TaskStatus::Planned);
        self.set_status(id, TaskStatus::Executing);

        let mut infos = Vec::with_capacity(expansion.nodes.len());
        for node in &expansion.nodes {
            self.graph.add_node(node.clone());
        }
        for edge in &expansion.edges {
            self.graph.add_edge(edge.clone());
        }
        self.graph_dirty = true;
        for (child, node) in expansion.subtasks.into_iter().zip(&expansion.nodes) {
            infos.push(NodeInfo {
                id: child.id,
                node_type: node.node_type,
                priority: child.priority,
                depth: child.depth,
                sequence: child.sequence,
            });
            let child_id = child.id;
            let plan_now = !child.kind.is_composite() || node.node_type.is_control();
            self.dirty.insert(child_id);
            self.tasks.insert(child_id, child);
            if plan_now {
                self.set_status(child_id, TaskStatus::Planned);
            }
        }
        let changes = self
            .resolver
            .insert(&infos, &expansion.edges, &HashMap::new());
        self.apply(changes);
    }

    // ---- attempt outcomes -----------------------------------------------

    fn on_attempt_finished(&mut self, id: TaskId, attempt: u32, result: AttemptResult) {
        match self.in_flight.get(&id) {
            Some(flight) if flight.attempt == attempt => {}
            _ => {
                debug!(task_id = %id, attempt, "Ignoring result of an abandoned attempt");
                return;
            }
        }
        let Some(flight) = self.in_flight.remove(&id) else {
            return;
        };
        self.shared.resources.release(id);
        let now = Utc::now();
        let started = self
            .tasks
            .get(&id)
            .and_then(|t| t.execution.history.last())
            .map_or(now, |r| r.started_at);
        let duration_ms = (now - started).num_milliseconds().max(0) as u64;

        match result {
            AttemptResult::Succeeded(output) => {
                self.shared
                    .executors
                    .record_outcome(&flight.executor_id, true, duration_ms);
                self.finish_attempt(id, AttemptOutcome::Succeeded);
                self.set_status(id, TaskStatus::Completed);
                if let Some(task) = self.tasks.get_mut(&id) {
                    let attempts = task.execution.attempt_count;
                    let total_ms = task
                        .execution
                        .started_at
                        .map_or(duration_ms, |s| (now - s).num_milliseconds().max(0) as u64);
                    task.execution.progress = 1.0;
                    task.result = Some(TaskResult {
                        status: output.status,
                        payload: output.payload,
                        error: None,
                        metrics: taskloom_core::ResultMetrics {
                            duration_ms: total_ms,
                            attempts,
                            resource_units: task.requirements.resource_class.weight() * attempts,
                        },
                    });
                    let entry = task.log(format!("attempt {attempt} succeeded in {duration_ms} ms"));
                    self.logs.push((id, entry));
                }
                info!(task_id = %id, attempt, "Task completed");
                self.work.push_back(Work::Settled(id));
            }
            AttemptResult::Failed(err) => {
                self.shared
                    .executors
                    .record_outcome(&flight.executor_id, false, duration_ms);
                self.attempt_failed(id, TaskFailure::from_error(&err, id));
            }
            AttemptResult::Cancelled => {
                self.finish_attempt(id, AttemptOutcome::Cancelled);
            }
        }
    }

    /// Close the open attempt record.
    fn finish_attempt(&mut self, id: TaskId, outcome: AttemptOutcome) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let attempt = task.execution.attempt_count;
        if let Some(record) = task.execution.history.last_mut() {
            if record.finished_at.is_none() {
                record.finished_at = Some(Utc::now());
                record.outcome = outcome.clone();
            }
        }
        self.dirty.insert(id);
        self.outbox.push(EngineEvent::AttemptFinished {
            task_id: id,
            attempt,
            outcome,
        });
    }

    /// A failed attempt: retry with backoff or fail terminally.
    fn attempt_failed(&mut self, id: TaskId, failure: TaskFailure) {
        warn!(task_id = %id, reason = %failure.reason, error = %failure.message, "Attempt failed");
        self.finish_attempt(
            id,
            AttemptOutcome::Failed {
                failure: failure.clone(),
            },
        );
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let decision = controller::decide_retry(
            task,
            failure.reason,
            &self.shared.config,
            Utc::now(),
            &mut rand::thread_rng(),
        );
        match decision {
            RetryDecision::Retry { delay } => {
                self.set_status(id, TaskStatus::Scheduled);
                let next_attempt = task_attempts(self.tasks.get(&id)) + 1;
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.execution.progress = 0.0;
                    let entry = task.log(format!(
                        "{}: {}; retrying in {} ms",
                        failure.reason,
                        failure.message,
                        delay.as_millis()
                    ));
                    self.logs.push((id, entry));
                }
                self.outbox.push(EngineEvent::RetryScheduled {
                    task_id: id,
                    next_attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(ActorMessage::RetryDue(id));
                });
            }
            RetryDecision::GiveUp => {
                self.retry_ready.remove(&id);
                self.fail_task(id, failure);
            }
        }
    }

    fn on_executor_lost(&mut self, executor_id: &str) {
        let lost: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.executor_id == executor_id)
            .map(|(id, _)| *id)
            .collect();
        for id in lost {
            if let Some(flight) = self.in_flight.remove(&id) {
                let _ = flight.cancel.send(true);
            }
            self.shared.resources.release(id);
            self.shared
                .executors
                .record_outcome(executor_id, false, 0);
            let failure = TaskFailure::new(
                FailureReason::ExecutorLost,
                format!("executor {executor_id} went offline or was removed"),
                id,
            );
            self.attempt_failed(id, failure);
        }
    }

    fn on_lease_expired(&mut self, lease: Lease) {
        let Some(flight) = self.in_flight.get(&lease.task_id) else {
            // Stale: release in case the attempt already ended.
            self.shared.resources.release(lease.task_id);
            return;
        };
        if flight.executor_id != lease.executor_id {
            return;
        }
        if let Some(flight) = self.in_flight.remove(&lease.task_id) {
            let _ = flight.cancel.send(true);
        }
        self.shared.resources.release(lease.task_id);
        let failure = TaskFailure::new(
            FailureReason::Timeout,
            format!("lease on {} expired", lease.executor_id),
            lease.task_id,
        );
        self.attempt_failed(lease.task_id, failure);
    }

    fn on_progress(&mut self, update: ProgressUpdate) {
        let matches_attempt = self
            .in_flight
            .get(&update.task_id)
            .is_some_and(|f| f.attempt == update.attempt);
        if !matches_attempt {
            return;
        }
        if let Some(task) = self.tasks.get_mut(&update.task_id) {
            task.execution.progress = update.fraction;
            task.updated_at = Utc::now();
            if let Some(note) = &update.note {
                let entry = task.log(format!("progress {:.0}%: {note}", update.fraction * 100.0));
                self.logs.push((update.task_id, entry));
            }
            self.dirty.insert(update.task_id);
        }
        self.outbox.push(EngineEvent::Progress(update));
    }

    // ---- terminal handling ----------------------------------------------

    /// Fail `id` terminally with `failure`.
    fn fail_task(&mut self, id: TaskId, failure: TaskFailure) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        let from = task.status;
        let message = failure.to_string();
        if let Err(err) = task.fail(failure) {
            error!(task_id = %id, error = %err, "Could not record failure");
            return;
        }
        let entry = task.log(message);
        self.logs.push((id, entry));
        self.note_transition(id, from);
        self.work.push_back(Work::Settled(id));
    }

    /// Cancel `id` terminally, recording why.
    fn cancel_task_record(&mut self, id: TaskId, failure: TaskFailure) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        let from = task.status;
        if let Err(err) = task.transition(TaskStatus::Cancelled) {
            error!(task_id = %id, error = %err, "Could not cancel task");
            return;
        }
        let mut result = TaskResult::failure(failure.clone());
        result.metrics.attempts = task.execution.attempt_count;
        task.result = Some(result);
        let entry = task.log(format!("cancelled: {}", failure.message));
        self.logs.push((id, entry));
        self.note_transition(id, from);
        self.work.push_back(Work::Settled(id));
    }

    /// Cancel `id` and every non-terminal descendant, children first.
    fn cancel_subtree(&mut self, id: TaskId, failure: &TaskFailure) {
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(task) = self.tasks.get(&current) {
                for child in task.subtasks.iter().rev() {
                    stack.push((*child, false));
                }
            }
        }
        for target in order {
            if self.tasks.get(&target).map_or(true, |t| t.is_terminal()) {
                continue;
            }
            if let Some(flight) = self.in_flight.remove(&target) {
                let _ = flight.cancel.send(true);
                self.shared.resources.release(target);
                self.finish_attempt(target, AttemptOutcome::Cancelled);
            }
            self.retry_ready.remove(&target);
            self.cancel_task_record(target, failure.clone());
        }
    }

    /// Handle a cancellation request for a task of this graph.
    fn cancel(&mut self, id: TaskId) -> TaskloomResult<bool> {
        let Some(task) = self.tasks.get(&id) else {
            return Err(TaskloomError::NotFound(format!("task {id}")));
        };
        if task.is_terminal() {
            return Ok(false);
        }
        info!(task_id = %id, "Cancellation requested");
        let failure = TaskFailure::new(FailureReason::Cancelled, "cancelled on request", id);
        self.cancel_subtree(id, &failure);
        Ok(true)
    }

    /// Signal in-flight attempts on shutdown; records stay as they are.
    fn abandon(&mut self) {
        for (id, flight) in self.in_flight.drain() {
            let _ = flight.cancel.send(true);
            self.shared.resources.release(id);
        }
    }

    /// Process queued terminal notifications and aggregations until quiet.
    fn drain(&mut self) {
        while let Some(work) = self.work.pop_front() {
            match work {
                Work::Settled(id) => self.settled(id),
                Work::Aggregate(id) => self.aggregate(id),
            }
        }
    }

    fn settled(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let status = task.status;
        let parent = task.parent_id;
        let changes = match status {
            TaskStatus::Completed => match task.result.clone() {
                Some(result) => self.resolver.complete(id, &result),
                None => self.resolver.fail(id),
            },
            TaskStatus::Failed => self.resolver.fail(id),
            TaskStatus::Cancelled => self.resolver.cancel(id),
            _ => Vec::new(),
        };
        self.apply(changes);
        if let Some(parent) = parent {
            self.work.push_back(Work::Aggregate(parent));
        }
    }

    /// Apply readiness changes from the resolver.
    fn apply(&mut self, changes: Vec<Resolution>) {
        for change in changes {
            let Resolution::Blocked {
                task_id,
                origin,
                cause,
            } = change
            else {
                continue;
            };
            match cause {
                BlockCause::PrerequisiteFailed => {
                    let root_cause = self
                        .tasks
                        .get(&origin)
                        .and_then(|t| t.result.as_ref())
                        .and_then(|r| r.error.as_ref())
                        .map_or(origin, |e| e.origin);
                    let name = self
                        .tasks
                        .get(&origin)
                        .map_or_else(|| origin.to_string(), |t| t.name.clone());
                    self.fail_task(
                        task_id,
                        TaskFailure::new(
                            FailureReason::DependencyFailed,
                            format!("hard prerequisite {name} failed"),
                            root_cause,
                        ),
                    );
                }
                BlockCause::PrerequisiteCancelled => {
                    self.cancel_task_record(
                        task_id,
                        TaskFailure::new(
                            FailureReason::Cancelled,
                            "hard prerequisite was cancelled",
                            origin,
                        ),
                    );
                }
                BlockCause::ConditionNotMet => {
                    self.cancel_task_record(
                        task_id,
                        TaskFailure::new(
                            FailureReason::ConditionNotMet,
                            "branch not taken",
                            origin,
                        ),
                    );
                }
            }
        }
    }

    fn aggregate(&mut self, parent_id: TaskId) {
        let Some(parent) = self.tasks.get(&parent_id) else {
            return;
        };
        let children: Vec<Child<'_>> = parent
            .subtasks
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|task| Child {
                task,
                node_type: self
                    .graph
                    .nodes
                    .get(&task.id)
                    .map_or(NodeType::Task, |n| n.node_type),
            })
            .collect();
        let verdict = aggregator::aggregate(parent, &children, self.shared.config.aggregation);
        match verdict {
            Verdict::Settled | Verdict::Waiting => {}
            Verdict::Complete(result) => {
                self.set_status(parent_id, TaskStatus::Completed);
                if let Some(parent) = self.tasks.get_mut(&parent_id) {
                    parent.execution.progress = 1.0;
                    let entry = parent.log(format!("aggregated result: {:?}", result.status));
                    self.logs.push((parent_id, entry));
                    parent.result = Some(result);
                }
                info!(task_id = %parent_id, "Composite completed");
                self.work.push_back(Work::Settled(parent_id));
            }
            Verdict::Fail { failure, cancel } => {
                let cancelled = TaskFailure::new(
                    FailureReason::Cancelled,
                    "sibling subtask failed",
                    failure.origin,
                );
                for id in cancel {
                    self.cancel_subtree(id, &cancelled);
                }
                warn!(task_id = %parent_id, origin = %failure.origin, "Composite failed");
                self.fail_task(parent_id, failure);
            }
        }
    }

    // ---- helpers --------------------------------------------------------

    fn node_type(&self, id: TaskId) -> NodeType {
        self.graph
            .nodes
            .get(&id)
            .map_or(NodeType::Task, |n| n.node_type)
    }

    /// Background values plus payloads of completed hard prerequisites.
    fn context_for(&self, id: TaskId) -> ExecutionContext {
        let mut context = self.shared.context.clone();
        context.root_id = Some(self.root_id);
        if let Some(task) = self.tasks.get(&id) {
            for dep in task.hard_dependencies() {
                if let Some(source) = self.tasks.get(&dep.task_id) {
                    if let Some(result) = &source.result {
                        if source.status == TaskStatus::Completed {
                            context
                                .inputs
                                .insert(source.name.clone(), result.payload.clone());
                        }
                    }
                }
            }
        }
        context
    }

    /// Apply a state machine transition; invalid ones are logged and skipped.
    fn set_status(&mut self, id: TaskId, next: TaskStatus) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let from = task.status;
        if let Err(err) = task.transition(next) {
            error!(task_id = %id, error = %err, "Rejected status change");
            return;
        }
        self.note_transition(id, from);
    }

    fn note_transition(&mut self, id: TaskId, from: TaskStatus) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        debug!(task_id = %id, %from, to = %task.status, "Status changed");
        self.graph.set_status(id, task.status);
        self.graph_dirty = true;
        self.dirty.insert(id);
        self.outbox.push(EngineEvent::StatusChanged {
            task_id: id,
            root_id: self.root_id,
            parent_id: task.parent_id,
            from,
            to: task.status,
            at: task.updated_at,
        });
    }

    /// Write dirty records and logs, then publish queued events.
    async fn flush(&mut self) {
        let store = self.shared.store.clone();
        for id in std::mem::take(&mut self.dirty) {
            if let Some(task) = self.tasks.get(&id) {
                if let Err(err) = store.put_task(task).await {
                    error!(task_id = %id, error = %err, "Failed to persist task");
                }
            }
        }
        if std::mem::take(&mut self.graph_dirty) {
            if let Err(err) = store.put_graph(&self.graph).await {
                error!(root_id = %self.root_id, error = %err, "Failed to persist graph");
            }
        }
        for (id, entry) in std::mem::take(&mut self.logs) {
            if let Err(err) = store.append_log(id, &entry).await {
                error!(task_id = %id, error = %err, "Failed to append execution log");
            }
        }
        for event in std::mem::take(&mut self.outbox) {
            // No subscribers is fine.
            let _ = self.shared.events.send(event);
        }
    }
}

fn task_attempts(task: Option<&Task>) -> u32 {
    task.map_or(0, |t| t.execution.attempt_count)
}
