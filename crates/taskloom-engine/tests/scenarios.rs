//! End-to-end scheduling scenarios.
//!
//! Every test drives a real [`Engine`] with in-process executors whose
//! behaviour is scripted through the task objective: how many attempts fail,
//! whether a failure is an error or a hang, how long to sleep and what to
//! return.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskloom_core::{
    AttemptOutcome, Constraints, ExecutionOutput, ExecutionRequest, ExecutorDescriptor,
    FailureReason, ResultStatus, Task, TaskDescription, TaskId, TaskKind, TaskStatus,
    TaskloomError, TaskloomResult,
};
use taskloom_engine::*;
use taskloom_store::{FileTaskStore, InMemoryTaskStore, TaskStore};
use tokio::sync::broadcast;
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

/// Objective keys understood by [`Scripted`]:
///
/// - `fail_first`: the first N attempts fail
/// - `failure`: `"timeout"` hangs instead of returning an error, `"reported"`
///   returns normally with a `failure` status
/// - `sleep_ms`: delay before answering
/// - `progress`: report 50% before answering
/// - `payload`: returned verbatim instead of the default echo
struct Scripted {
    descriptor: ExecutorDescriptor,
    calls: Mutex<HashMap<String, u32>>,
    running: Mutex<HashSet<TaskId>>,
    overlap: AtomicBool,
}

impl Scripted {
    fn new(id: &str, capabilities: &[&str], concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            descriptor: ExecutorDescriptor::new(id, capabilities).with_concurrency(concurrency),
            calls: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            overlap: AtomicBool::new(false),
        })
    }

    fn calls(&self, name: &str) -> u32 {
        self.calls.lock().get(name).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }

    /// Whether two attempts of the same task ever ran at once.
    fn overlapped(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

/// Marks a task as running on the executor for the lifetime of one attempt,
/// including attempts dropped on timeout or cancellation.
struct Running<'a> {
    owner: &'a Scripted,
    task_id: TaskId,
}

impl<'a> Running<'a> {
    fn enter(owner: &'a Scripted, task_id: TaskId) -> Self {
        if !owner.running.lock().insert(task_id) {
            owner.overlap.store(true, Ordering::SeqCst);
        }
        Self { owner, task_id }
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.owner.running.lock().remove(&self.task_id);
    }
}

#[async_trait]
impl Executor for Scripted {
    fn descriptor(&self) -> &ExecutorDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        progress: ProgressSink,
    ) -> TaskloomResult<ExecutionOutput> {
        let _running = Running::enter(self, request.task_id);
        *self
            .calls
            .lock()
            .entry(request.task_name.clone())
            .or_default() += 1;

        let params = &request.parameters;
        let fail_first = params.get("fail_first").and_then(Value::as_u64).unwrap_or(0);
        if u64::from(request.attempt) <= fail_first {
            match params.get("failure").and_then(Value::as_str) {
                Some("timeout") => tokio::time::sleep(Duration::from_secs(30)).await,
                Some("reported") => {
                    return Ok(ExecutionOutput {
                        status: ResultStatus::Failure,
                        payload: json!({ "err": "boom" }),
                    });
                }
                _ => {}
            }
            return Err(TaskloomError::Executor(format!(
                "{} failed on attempt {}",
                request.task_name, request.attempt
            )));
        }
        if params.get("progress").and_then(Value::as_bool) == Some(true) {
            progress.report(0.5, Some("half".to_string()));
        }
        if let Some(ms) = params.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let payload = match params.get("payload") {
            Some(payload) => payload.clone(),
            None => json!({
                "task": request.task_name,
                "attempt": request.attempt,
                "inputs": request.context.inputs,
            }),
        };
        Ok(ExecutionOutput::success(payload))
    }
}

/// Never answers; stands in for a remote worker that went away.
struct Hanging {
    descriptor: ExecutorDescriptor,
}

#[async_trait]
impl Executor for Hanging {
    fn descriptor(&self) -> &ExecutorDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        _request: ExecutionRequest,
        _progress: ProgressSink,
    ) -> TaskloomResult<ExecutionOutput> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(ExecutionOutput::success(Value::Null))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_config() -> EngineConfig {
    EngineConfig {
        tick_interval_ms: 10,
        maintenance_interval_ms: 20,
        retry: RetryPolicy {
            backoff_base_ms: 10,
            backoff_max_ms: 50,
            jitter: 0.0,
        },
        ..EngineConfig::default()
    }
}

fn setup(config: EngineConfig) -> (Engine, Arc<InMemoryTaskStore>, Arc<Scripted>) {
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = Engine::new(config, store.clone()).unwrap();
    let worker = Scripted::new("worker", &["work"], 8);
    engine.register_executor(worker.clone(), Liveness::Local);
    (engine, store, worker)
}

fn work(key: &str, objective: Value) -> Value {
    json!({
        "key": key,
        "objective": objective,
        "requirements": { "capabilities": ["work"] },
    })
}

async fn finish(engine: &Engine, id: TaskId) -> Task {
    timeout(Duration::from_secs(10), engine.wait_for(id))
        .await
        .expect("task did not finish in time")
        .unwrap()
}

async fn by_name(store: &InMemoryTaskStore, root: TaskId) -> HashMap<String, Task> {
    store
        .tasks_for_root(root)
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.name.clone(), t))
        .collect()
}

fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_parallel_then_merge_recovers_from_timeouts() {
    let (engine, store, worker) = setup(fast_config());
    let flaky = json!({ "fail_first": 1, "failure": "timeout" });
    let mut b = work("B", flaky.clone());
    b["constraints"] = json!({ "timeout_ms": 100 });
    let mut c = work("C", flaky);
    c["constraints"] = json!({ "timeout_ms": 100 });
    let plan = json!({
        "subtasks": [b, c, work("D", json!({}))],
        "edges": [
            { "source": "B", "target": "D" },
            { "source": "C", "target": "D" },
        ],
    });

    let id = engine
        .submit_task(
            TaskDescription::composite("A", TaskKind::Composite, plan),
            Constraints::default(),
        )
        .await
        .unwrap();
    let root = finish(&engine, id).await;

    assert_eq!(root.status, TaskStatus::Completed);
    let result = root.result.unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.payload["B"]["task"], "B");
    assert_eq!(result.payload["C"]["task"], "C");
    assert_eq!(result.payload["D"]["task"], "D");
    // D saw the outputs of both prerequisites.
    assert_eq!(result.payload["D"]["inputs"]["B"]["attempt"], 2);
    assert_eq!(result.payload["D"]["inputs"]["C"]["attempt"], 2);

    let tasks = by_name(&store, id).await;
    for name in ["B", "C"] {
        let task = &tasks[name];
        assert_eq!(task.execution.attempt_count, 2, "{name}");
        assert_eq!(task.result.as_ref().unwrap().metrics.attempts, 2);
        match &task.execution.history[0].outcome {
            AttemptOutcome::Failed { failure } => {
                assert_eq!(failure.reason, FailureReason::Timeout);
            }
            other => panic!("unexpected first outcome for {name}: {other:?}"),
        }
        assert_eq!(task.execution.history[1].outcome, AttemptOutcome::Succeeded);
    }
    assert_eq!(tasks["D"].execution.attempt_count, 1);
    assert_eq!(worker.calls("D"), 1);
    assert_eq!(result.metrics.attempts, 5);
    assert!(!worker.overlapped());
    assert_eq!(engine.resources().active_count(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_graph() {
    let (engine, store, worker) = setup(fast_config());
    let mut b = work("B", json!({ "fail_first": 100 }));
    b["constraints"] = json!({ "max_retries": 2 });
    let plan = json!({
        "subtasks": [b, work("C", json!({})), work("D", json!({}))],
        "edges": [
            { "source": "B", "target": "D" },
            { "source": "C", "target": "D" },
        ],
    });

    let id = engine
        .submit_task(
            TaskDescription::composite("A", TaskKind::Composite, plan),
            Constraints::default(),
        )
        .await
        .unwrap();
    let root = finish(&engine, id).await;
    let tasks = by_name(&store, id).await;
    let b = &tasks["B"];
    let d = &tasks["D"];

    assert_eq!(root.status, TaskStatus::Failed);
    let failure = root.result.unwrap().error.unwrap();
    assert_eq!(failure.origin, b.id);
    assert_eq!(failure.reason, FailureReason::ExecutorError);
    assert!(failure.message.contains("attempt 3"), "{}", failure.message);
    assert!(failure.failed_descendants >= 2);

    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.execution.attempt_count, 3);
    assert_eq!(worker.calls("B"), 3);

    assert_eq!(d.status, TaskStatus::Failed);
    let d_failure = d.result.as_ref().unwrap().error.as_ref().unwrap();
    assert_eq!(d_failure.reason, FailureReason::DependencyFailed);
    assert_eq!(d_failure.origin, b.id);
    assert_eq!(d.execution.attempt_count, 0);
    assert_eq!(worker.calls("D"), 0);

    match engine.get_result(id).await.unwrap() {
        ResultState::Error(failure) => assert_eq!(failure.origin, b.id),
        other => panic!("expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_denied_allocation_defers_without_failing() {
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = Engine::new(fast_config(), store.clone()).unwrap();
    let slot = Scripted::new("slot", &["slot"], 1);
    engine.register_executor(slot.clone(), Liveness::Local);
    let mut events = engine.subscribe();

    let plan = json!({
        "subtasks": [
            {
                "key": "hog",
                "priority": 5,
                "objective": { "sleep_ms": 150 },
                "requirements": { "capabilities": ["slot"] },
            },
            {
                "key": "E",
                "objective": {},
                "requirements": { "capabilities": ["slot"] },
            },
        ],
    });
    let id = engine
        .submit_task(
            TaskDescription::composite("batch", TaskKind::Parallel, plan),
            Constraints::default(),
        )
        .await
        .unwrap();

    // Records are written before events go out, so the store shows E as
    // it was when the allocation was refused.
    let mut seen = Vec::new();
    let denied = timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            seen.push(event.clone());
            if let EngineEvent::AllocationDenied { task_id, .. } = event {
                return task_id;
            }
        }
    })
    .await
    .expect("no allocation was denied");
    let waiting = engine.get_task(denied).await.unwrap();
    assert_eq!(waiting.name, "E");
    assert_eq!(waiting.status, TaskStatus::Planned);
    assert_eq!(waiting.execution.attempt_count, 0);
    assert!(waiting.execution.history.is_empty());
    assert_eq!(engine.resources().active_count(), 1);

    let root = finish(&engine, id).await;
    assert_eq!(root.status, TaskStatus::Completed);

    let tasks = by_name(&store, id).await;
    let e = &tasks["E"];
    assert_eq!(e.status, TaskStatus::Completed);
    assert_eq!(e.execution.attempt_count, 1);
    assert_eq!(e.execution.history.len(), 1);
    assert!(e.result.as_ref().unwrap().error.is_none());
    // E only started once the hog had released the single slot.
    assert!(e.execution.history[0].started_at >= tasks["hog"].execution.history[0].started_at);

    seen.extend(drain(&mut events));
    assert!(!seen.iter().any(
        |ev| matches!(ev, EngineEvent::RetryScheduled { task_id, .. } if *task_id == e.id)
    ));
    // E is scheduled on the executor that granted its lease and dispatched
    // right after.
    let transitions: Vec<(TaskStatus, TaskStatus)> = seen
        .iter()
        .filter_map(|ev| match ev {
            EngineEvent::StatusChanged { task_id, from, to, .. } if *task_id == e.id => {
                Some((*from, *to))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (TaskStatus::Created, TaskStatus::Planned),
            (TaskStatus::Planned, TaskStatus::Scheduled),
            (TaskStatus::Scheduled, TaskStatus::Executing),
            (TaskStatus::Executing, TaskStatus::Completed),
        ]
    );
    assert!(!slot.overlapped());
}

#[tokio::test]
async fn test_reported_failure_blocks_dependents() {
    let (engine, store, worker) = setup(fast_config());
    let mut b = work("B", json!({ "fail_first": 100, "failure": "reported" }));
    b["constraints"] = json!({ "max_retries": 1 });
    let plan = json!({
        "subtasks": [b, work("D", json!({}))],
        "edges": [{ "source": "B", "target": "D" }],
    });
    let id = engine
        .submit_task(
            TaskDescription::composite("A", TaskKind::Composite, plan),
            Constraints::default(),
        )
        .await
        .unwrap();
    let root = finish(&engine, id).await;
    let tasks = by_name(&store, id).await;
    let b = &tasks["B"];

    assert_eq!(root.status, TaskStatus::Failed);
    let failure = root.result.unwrap().error.unwrap();
    assert_eq!(failure.origin, b.id);
    assert_eq!(failure.reason, FailureReason::ExecutorError);
    assert!(failure.message.contains("boom"), "{}", failure.message);

    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.execution.attempt_count, 2);
    assert_eq!(tasks["D"].status, TaskStatus::Failed);
    assert_eq!(worker.calls("D"), 0);
}

#[tokio::test]
async fn test_cancelling_root_reaches_every_descendant() {
    let (engine, store, worker) = setup(fast_config());
    let mut events = engine.subscribe();
    let sleeper = json!({ "sleep_ms": 30_000 });
    let plan = json!({
        "subtasks": [
            work("left", sleeper.clone()),
            work("right", sleeper.clone()),
            {
                "key": "inner",
                "kind": "sequential",
                "objective": {
                    "subtasks": [work("x", sleeper), work("y", json!({}))],
                },
            },
        ],
    });
    let id = engine
        .submit_task(
            TaskDescription::composite("job", TaskKind::Parallel, plan),
            Constraints::default(),
        )
        .await
        .unwrap();

    // Wait until left, right and x are running.
    let mut started = 0;
    timeout(Duration::from_secs(5), async {
        while started < 3 {
            if let Ok(EngineEvent::AttemptStarted { .. }) = events.recv().await {
                started += 1;
            }
        }
    })
    .await
    .expect("attempts never started");

    assert!(engine.cancel_task(id).await.unwrap());
    let root = finish(&engine, id).await;
    assert_eq!(root.status, TaskStatus::Cancelled);

    let tasks = store.tasks_for_root(id).await.unwrap();
    assert_eq!(tasks.len(), 6);
    for task in &tasks {
        assert!(task.is_terminal(), "{} is {}", task.name, task.status);
        assert_eq!(task.status, TaskStatus::Cancelled, "{}", task.name);
    }
    let y = tasks.iter().find(|t| t.name == "y").unwrap();
    assert_eq!(y.execution.attempt_count, 0);
    assert_eq!(worker.calls("y"), 0);
    assert_eq!(engine.resources().active_count(), 0);

    // Second request is a no-op.
    assert!(!engine.cancel_task(id).await.unwrap());
    match engine.get_result(id).await.unwrap() {
        ResultState::Error(failure) => assert_eq!(failure.reason, FailureReason::Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_attempts_never_exceed_retry_bound() {
    let (engine, _store, worker) = setup(fast_config());
    let description =
        TaskDescription::atomic("stubborn", json!({ "fail_first": 100 })).with_capabilities(&["work"]);
    let constraints = Constraints {
        max_retries: Some(3),
        ..Constraints::default()
    };

    let id = engine.submit_task(description, constraints).await.unwrap();
    let task = finish(&engine, id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.execution.attempt_count, 4);
    assert_eq!(task.execution.history.len(), 4);
    assert_eq!(worker.calls("stubborn"), 4);
    let result = task.result.unwrap();
    assert_eq!(result.metrics.attempts, 4);
    assert_eq!(result.error.unwrap().reason, FailureReason::ExecutorError);

    let log = engine.read_log(id).await.unwrap();
    assert!(log.iter().any(|e| e.message.contains("retrying")));
}

#[tokio::test]
async fn test_parent_is_finalised_once() {
    let (engine, _store, _worker) = setup(fast_config());
    let mut events = engine.subscribe();
    let objective = json!({
        "items": [1, 2, 3],
        "template": { "requirements": { "capabilities": ["work"] } },
    });
    let id = engine
        .submit_task(
            TaskDescription::composite("fan", TaskKind::Parallel, objective),
            Constraints::default(),
        )
        .await
        .unwrap();
    let root = finish(&engine, id).await;
    let result = root.result.clone().unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    for key in ["item-0", "item-1", "item-2"] {
        assert_eq!(result.payload[key]["task"], key);
    }

    // Give any straggling aggregation a chance to run.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let completions = drain(&mut events)
        .into_iter()
        .filter(|ev| {
            matches!(ev, EngineEvent::StatusChanged { task_id, to: TaskStatus::Completed, .. } if *task_id == id)
        })
        .count();
    assert_eq!(completions, 1);
    assert_eq!(engine.get_result(id).await.unwrap(), ResultState::Ready(result));
}

#[tokio::test]
async fn test_silent_remote_executor_is_replaced() {
    let config = EngineConfig {
        liveness_window_ms: 100,
        ..fast_config()
    };
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = Engine::new(config, store.clone()).unwrap();
    engine.register_executor(
        Arc::new(Hanging {
            descriptor: ExecutorDescriptor::new("a-remote", &["work"]),
        }),
        Liveness::Remote,
    );
    let local = Scripted::new("b-local", &["work"], 1);
    engine.register_executor(local.clone(), Liveness::Local);

    let id = engine
        .submit_task(
            TaskDescription::atomic("job", json!({})).with_capabilities(&["work"]),
            Constraints::default(),
        )
        .await
        .unwrap();
    let task = finish(&engine, id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.execution.attempt_count, 2);
    let first = &task.execution.history[0];
    assert_eq!(first.executor_id, "a-remote");
    match &first.outcome {
        AttemptOutcome::Failed { failure } => {
            assert_eq!(failure.reason, FailureReason::ExecutorLost);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(task.execution.history[1].executor_id, "b-local");
    assert!(!engine.executors().is_online("a-remote"));

    let mut offline = false;
    for _ in 0..50 {
        if engine
            .monitor()
            .alerts()
            .await
            .iter()
            .any(|a| a.kind == AlertKind::ExecutorOffline)
        {
            offline = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(offline);

    engine.heartbeat("a-remote").unwrap();
    assert!(engine.executors().is_online("a-remote"));
    assert!(engine.heartbeat("nobody").is_err());
}

#[tokio::test]
async fn test_deregistered_executor_hands_work_over() {
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = Engine::new(fast_config(), store).unwrap();
    engine.register_executor(
        Arc::new(Hanging {
            descriptor: ExecutorDescriptor::new("old", &["work"]),
        }),
        Liveness::Local,
    );
    let mut events = engine.subscribe();

    let id = engine
        .submit_task(
            TaskDescription::atomic("job", json!({})).with_capabilities(&["work"]),
            Constraints::default(),
        )
        .await
        .unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            if let EngineEvent::AttemptStarted { task_id, .. } = events.recv().await.unwrap() {
                if task_id == id {
                    return;
                }
            }
        }
    })
    .await
    .expect("first attempt never started");

    engine.register_executor(Scripted::new("new", &["work"], 1), Liveness::Local);
    engine.deregister_executor("old").unwrap();
    assert!(!engine.executors().contains("old"));
    assert!(matches!(
        engine.deregister_executor("old"),
        Err(TaskloomError::NotFound(_))
    ));

    let task = finish(&engine, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.execution.attempt_count, 2);
    match &task.execution.history[0].outcome {
        AttemptOutcome::Failed { failure } => {
            assert_eq!(failure.reason, FailureReason::ExecutorLost);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(task.execution.history[1].executor_id, "new");
    assert_eq!(engine.resources().active_count(), 0);
}

#[tokio::test]
async fn test_finished_graphs_release_their_actors() {
    let (engine, _store, _worker) = setup(fast_config());
    let mut ids = Vec::new();
    for n in 0..5 {
        let id = engine
            .submit_task(
                TaskDescription::atomic(format!("job-{n}"), json!({})).with_capabilities(&["work"]),
                Constraints::default(),
            )
            .await
            .unwrap();
        ids.push(id);
    }
    for id in ids {
        finish(&engine, id).await;
    }

    let mut active = engine.active_graphs();
    for _ in 0..100 {
        if active == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        active = engine.active_graphs();
    }
    assert_eq!(active, 0);
}

#[tokio::test]
async fn test_invalid_decompositions_fail_before_dispatch() {
    let (engine, _store, worker) = setup(fast_config());

    let empty = engine
        .submit_task(
            TaskDescription::composite("empty", TaskKind::Composite, json!({ "subtasks": [] })),
            Constraints::default(),
        )
        .await
        .unwrap();
    let cyclic_plan = json!({
        "subtasks": [work("a", json!({})), work("b", json!({}))],
        "edges": [
            { "source": "a", "target": "b" },
            { "source": "b", "target": "a" },
        ],
    });
    let cyclic = engine
        .submit_task(
            TaskDescription::composite("cyclic", TaskKind::Composite, cyclic_plan),
            Constraints::default(),
        )
        .await
        .unwrap();

    for id in [empty, cyclic] {
        let task = finish(&engine, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        let failure = task.result.unwrap().error.unwrap();
        assert_eq!(failure.reason, FailureReason::DecompositionError);
        assert_eq!(failure.origin, id);
        assert!(task.subtasks.is_empty());
    }
    assert_eq!(worker.total_calls(), 0);
}

#[tokio::test]
async fn test_conditional_branch_is_pruned() {
    let (engine, store, worker) = setup(fast_config());
    let plan = json!({
        "subtasks": [
            work("check", json!({ "payload": { "healthy": false } })),
            work("deploy", json!({ "payload": "deployed" })),
            work("rollback", json!({ "payload": "rolled back" })),
        ],
        "edges": [
            {
                "source": "check",
                "target": "deploy",
                "condition": { "op": "field_truthy", "pointer": "/healthy" },
            },
            {
                "source": "check",
                "target": "rollback",
                "condition": {
                    "op": "not",
                    "condition": { "op": "field_truthy", "pointer": "/healthy" },
                },
            },
        ],
    });
    let id = engine
        .submit_task(
            TaskDescription::composite("release", TaskKind::Conditional, plan),
            Constraints::default(),
        )
        .await
        .unwrap();
    let root = finish(&engine, id).await;

    assert_eq!(root.status, TaskStatus::Completed);
    let result = root.result.unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.payload, json!("rolled back"));

    let tasks = by_name(&store, id).await;
    let deploy = &tasks["deploy"];
    assert_eq!(deploy.status, TaskStatus::Cancelled);
    assert_eq!(
        deploy.result.as_ref().unwrap().error.as_ref().unwrap().reason,
        FailureReason::ConditionNotMet
    );
    assert_eq!(worker.calls("deploy"), 0);
    assert_eq!(tasks["rollback"].status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_best_effort_completes_with_partial_result() {
    let config = EngineConfig {
        aggregation: AggregationPolicy::BestEffort,
        ..fast_config()
    };
    let (engine, _store, _worker) = setup(config);
    let mut broken = work("broken", json!({ "fail_first": 100 }));
    broken["constraints"] = json!({ "max_retries": 0 });
    let plan = json!({
        "subtasks": [work("fine", json!({ "payload": 1 })), broken],
    });
    let id = engine
        .submit_task(
            TaskDescription::composite("mixed", TaskKind::Parallel, plan),
            Constraints::default(),
        )
        .await
        .unwrap();
    let root = finish(&engine, id).await;

    assert_eq!(root.status, TaskStatus::Completed);
    let result = root.result.unwrap();
    assert_eq!(result.status, ResultStatus::Partial);
    assert_eq!(result.payload, json!({ "fine": 1 }));
    let failure = result.error.unwrap();
    assert_eq!(failure.reason, FailureReason::ExecutorError);
    assert_ne!(failure.origin, id);
}

#[tokio::test]
async fn test_progress_and_result_states() {
    let (engine, _store, _worker) = setup(fast_config());
    let id = engine
        .submit_task(
            TaskDescription::atomic("slow", json!({ "progress": true, "sleep_ms": 100 }))
                .with_capabilities(&["work"]),
            Constraints::default(),
        )
        .await
        .unwrap();
    assert_eq!(engine.get_result(id).await.unwrap(), ResultState::Pending);

    let task = finish(&engine, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.execution.progress, 1.0);
    assert!(task
        .execution
        .log
        .iter()
        .any(|e| e.message.contains("progress 50%: half")));
    assert!(matches!(
        engine.get_result(id).await.unwrap(),
        ResultState::Ready(_)
    ));

    let graph = engine.get_graph(id).await.unwrap();
    assert_eq!(graph.len(), 1);
    assert_eq!(graph.completion_ratio(), 1.0);

    assert!(matches!(
        engine.get_result(uuid::Uuid::new_v4()).await,
        Err(TaskloomError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_unmatched_task_waits_for_a_capable_executor() {
    let (engine, _store, _worker) = setup(fast_config());
    let id = engine
        .submit_task(
            TaskDescription::atomic("gpu", json!({})).with_capabilities(&["gpu"]),
            Constraints::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let task = engine.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Planned);
    assert_eq!(task.execution.attempt_count, 0);

    engine.register_executor(Scripted::new("gpu-box", &["gpu"], 1), Liveness::Local);
    let task = finish(&engine, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.execution.executor_id.as_deref(), Some("gpu-box"));
}

#[tokio::test]
async fn test_file_store_keeps_finished_graph() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileTaskStore::new(dir.path().to_path_buf()).await.unwrap());
    let engine = Engine::new(fast_config(), store).unwrap();
    engine.register_executor(Scripted::new("worker", &["work"], 2), Liveness::Local);

    let plan = json!({ "subtasks": [work("one", json!({})), work("two", json!({}))] });
    let id = engine
        .submit_task(
            TaskDescription::composite("pair", TaskKind::Sequential, plan),
            Constraints::default(),
        )
        .await
        .unwrap();
    finish(&engine, id).await;
    engine.shutdown().await;

    let reopened = FileTaskStore::new(dir.path().to_path_buf()).await.unwrap();
    let root = reopened.get_task(id).await.unwrap().unwrap();
    assert_eq!(root.status, TaskStatus::Completed);
    assert_eq!(root.result.unwrap().payload["task"], "two");
    assert_eq!(reopened.tasks_for_root(id).await.unwrap().len(), 3);
    let graph = reopened.get_graph(id).await.unwrap().unwrap();
    assert_eq!(graph.len(), 2);
    assert_eq!(graph.topological_order().unwrap().len(), 2);
    assert!(!reopened.read_log(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retention_sweep_removes_finished_roots() {
    let (engine, store, _worker) = setup(fast_config());
    let id = engine
        .submit_task(
            TaskDescription::atomic("short", json!({})).with_capabilities(&["work"]),
            Constraints::default(),
        )
        .await
        .unwrap();
    finish(&engine, id).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(engine.sweep_retention(Duration::ZERO).await.unwrap(), 1);
    assert!(store.get_task(id).await.unwrap().is_none());
    assert!(matches!(
        engine.get_task(id).await,
        Err(TaskloomError::NotFound(_))
    ));
}
