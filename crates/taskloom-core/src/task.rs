use crate::condition::Condition;
use crate::error::{TaskFailure, TaskloomError, TaskloomResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of a task. Stable across retries.
pub type TaskId = Uuid;

/// Structural kind of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Dispatched to a single executor.
    #[default]
    Atomic,
    /// Generic composite; children are merged like `parallel`.
    Composite,
    /// Children form a chain; the last child's result is the parent's.
    Sequential,
    /// Children run independently; results are merged into a collection.
    Parallel,
    /// Children include branches selected by conditions.
    Conditional,
    /// Children are iterations; results are concatenated.
    Iterative,
}

impl TaskKind {
    /// Whether tasks of this kind are expanded by a decomposer instead of
    /// being dispatched.
    pub fn is_composite(&self) -> bool {
        !matches!(self, TaskKind::Atomic)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Atomic => write!(f, "atomic"),
            TaskKind::Composite => write!(f, "composite"),
            TaskKind::Sequential => write!(f, "sequential"),
            TaskKind::Parallel => write!(f, "parallel"),
            TaskKind::Conditional => write!(f, "conditional"),
            TaskKind::Iterative => write!(f, "iterative"),
        }
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// created -> [decomposed] -> planned -> scheduled -> executing -> completed
///                                          ^             |
///                                          +-- retry ----+-> failed
/// any non-terminal state -> cancelled | failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Recorded, nothing decided yet.
    Created,
    /// Composite only: subgraph produced by a decomposer.
    Decomposed,
    /// Execution plan attached; waiting for its prerequisites.
    Planned,
    /// Matched to a prospective executor, or waiting for a retry.
    Scheduled,
    /// An attempt holds a lease (composites: their subgraph is live).
    Executing,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
    /// Terminal, cancelled on request or branch not taken.
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (*self, next),
            (_, Cancelled)
                | (_, Failed)
                | (Created, Decomposed)
                | (Created, Planned)
                | (Decomposed, Planned)
                | (Planned, Scheduled)
                | (Planned, Executing)
                | (Scheduled, Executing)
                | (Executing, Scheduled)
                | (Executing, Completed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Decomposed => "decomposed",
            TaskStatus::Planned => "planned",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Coarse compute class used to weigh leases against an executor's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    /// Weight 1.
    #[default]
    Low,
    /// Weight 2.
    Medium,
    /// Weight 4.
    High,
}

impl ResourceClass {
    /// Units charged against a compute budget.
    pub fn weight(&self) -> u32 {
        match self {
            ResourceClass::Low => 1,
            ResourceClass::Medium => 2,
            ResourceClass::High => 4,
        }
    }
}

/// What a task needs from an executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    /// Every tag must be advertised by the executor.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resource_class: ResourceClass,
    /// Used for the critical path; never for correctness.
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
    /// Decomposition strategy override for composite kinds.
    #[serde(default)]
    pub strategy: Option<String>,
}

/// Limits on how a task may run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Absolute wall-clock deadline. Attempts never run past it.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Timeout for one attempt (or for all attempts under a cumulative scope).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retries after the first attempt. Falls back to the engine default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Isolation/security class; executors must advertise it when set.
    #[serde(default)]
    pub isolation: Option<String>,
}

/// Whether a dependency blocks readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Blocks readiness until satisfied.
    #[default]
    Hard,
    /// Only influences ordering among ready tasks.
    Soft,
}

/// What "satisfied" means for a dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// The prerequisite completed.
    #[default]
    Completion,
    /// The prerequisite completed and its result satisfies the condition.
    Result(Condition),
}

impl DependencyCondition {
    /// Evaluate against a completed prerequisite.
    pub fn is_satisfied_by(&self, result: &TaskResult) -> bool {
        match self {
            DependencyCondition::Completion => true,
            DependencyCondition::Result(condition) => condition.evaluate(result),
        }
    }
}

/// A prerequisite of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// The prerequisite task.
    pub task_id: TaskId,
    #[serde(default)]
    pub kind: DependencyKind,
    #[serde(default)]
    pub condition: DependencyCondition,
}

impl Dependency {
    /// A hard completion dependency.
    pub fn hard(task_id: TaskId) -> Self {
        Self {
            task_id,
            kind: DependencyKind::Hard,
            condition: DependencyCondition::Completion,
        }
    }

    /// A soft completion dependency.
    pub fn soft(task_id: TaskId) -> Self {
        Self {
            task_id,
            kind: DependencyKind::Soft,
            condition: DependencyCondition::Completion,
        }
    }

    /// Require the prerequisite's result to satisfy `condition`.
    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = DependencyCondition::Result(condition);
        self
    }
}

/// How ready tasks of one graph are ordered beyond priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderingStrategy {
    /// Priority, then creation order.
    #[default]
    PriorityFirst,
    /// Priority, then deeper tasks first, then creation order.
    DepthFirst,
}

/// Attached on the transition to `planned`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub ordering: OrderingStrategy,
    /// Decomposition method that produced the subgraph, for composites.
    pub method: Option<String>,
    pub planned_at: DateTime<Utc>,
}

/// One entry of a task's execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    pub message: String,
}

impl LogEntry {
    /// Log entry stamped now.
    pub fn new(attempt: u32, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            attempt,
            message: message.into(),
        }
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Still running.
    Running,
    Succeeded,
    Failed { failure: TaskFailure },
    Cancelled,
}

/// Record of one execution attempt. Appended, never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub executor_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
}

/// Mutable execution state of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Executor holding (or last holding) the task.
    pub executor_id: Option<String>,
    /// Start of the first attempt.
    pub started_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    /// Fraction in `[0, 1]`, reset on retry.
    pub progress: f64,
    pub plan: Option<ExecutionPlan>,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

/// Outcome classification of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    /// Completed with some parts missing (best-effort aggregation).
    Partial,
    Failure,
}

/// Measurements attached to a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub duration_ms: u64,
    pub attempts: u32,
    /// Resource units charged while executing (class weight per attempt).
    pub resource_units: u32,
}

/// Result of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: ResultStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub error: Option<TaskFailure>,
    #[serde(default)]
    pub metrics: ResultMetrics,
}

impl TaskResult {
    /// A successful result.
    pub fn success(payload: Value) -> Self {
        Self {
            status: ResultStatus::Success,
            payload,
            error: None,
            metrics: ResultMetrics::default(),
        }
    }

    /// A failed result carrying `failure`.
    pub fn failure(failure: TaskFailure) -> Self {
        Self {
            status: ResultStatus::Failure,
            payload: Value::Null,
            error: Some(failure),
            metrics: ResultMetrics::default(),
        }
    }
}

/// What a caller submits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDescription {
    pub name: String,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub priority: i32,
    /// Opaque to the engine; interpreted by executors and decomposers.
    #[serde(default)]
    pub objective: Value,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub ordering: OrderingStrategy,
}

impl TaskDescription {
    /// Description of an atomic task.
    pub fn atomic(name: impl Into<String>, objective: Value) -> Self {
        Self {
            name: name.into(),
            objective,
            ..Default::default()
        }
    }

    /// Description of a composite task of the given kind.
    pub fn composite(name: impl Into<String>, kind: TaskKind, objective: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            objective,
            ..Default::default()
        }
    }

    /// Require executor capabilities.
    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.requirements.capabilities = caps.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub parent_id: Option<TaskId>,
    /// Root of the graph this task belongs to (itself for roots).
    pub root_id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Higher runs first among ready tasks.
    pub priority: i32,
    pub objective: Value,
    pub requirements: Requirements,
    pub constraints: Constraints,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Ordered children, composites only.
    #[serde(default)]
    pub subtasks: Vec<TaskId>,
    /// Failure of an optional subtask never fails its parent.
    #[serde(default)]
    pub optional: bool,
    /// Depth below the root (root = 0).
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub execution: ExecutionRecord,
    #[serde(default)]
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic creation counter; FIFO tie-break among equal priorities.
    #[serde(default)]
    pub sequence: u64,
}

impl Task {
    /// A new root task in `created` state.
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            parent_id: None,
            root_id: id,
            name: name.into(),
            kind,
            status: TaskStatus::Created,
            priority: 0,
            objective: Value::Null,
            requirements: Requirements::default(),
            constraints: Constraints::default(),
            dependencies: Vec::new(),
            subtasks: Vec::new(),
            optional: false,
            depth: 0,
            execution: ExecutionRecord::default(),
            result: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            sequence: 0,
        }
    }

    /// Build a root task from a submission.
    pub fn from_description(description: TaskDescription, constraints: Constraints) -> Self {
        let mut task = Task::new(description.name, description.kind);
        task.priority = description.priority;
        task.objective = description.objective;
        task.requirements = description.requirements;
        task.constraints = constraints;
        task.execution.plan = Some(ExecutionPlan {
            ordering: description.ordering,
            method: None,
            planned_at: task.created_at,
        });
        task
    }

    /// Set the task id (root tasks keep `root_id == id`).
    pub fn with_id(mut self, id: TaskId) -> Self {
        if self.root_id == self.id {
            self.root_id = id;
        }
        self.id = id;
        self
    }

    /// Attach to a parent, inheriting its root and depth.
    pub fn with_parent(mut self, parent: &Task) -> Self {
        self.parent_id = Some(parent.id);
        self.root_id = parent.root_id;
        self.depth = parent.depth + 1;
        self
    }

    /// Replace the dependency list.
    pub fn with_dependencies(mut self, deps: Vec<Dependency>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Completed with a result satisfying `condition`.
    pub fn satisfies(&self, condition: &DependencyCondition) -> bool {
        self.status == TaskStatus::Completed
            && self
                .result
                .as_ref()
                .is_some_and(|r| condition.is_satisfied_by(r))
    }

    /// Hard dependencies only.
    pub fn hard_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Hard)
    }

    /// Move to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: TaskStatus) -> TaskloomResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(TaskloomError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Record a finished failure (status and result).
    pub fn fail(&mut self, failure: TaskFailure) -> TaskloomResult<()> {
        self.transition(TaskStatus::Failed)?;
        let mut result = TaskResult::failure(failure);
        result.metrics.attempts = self.execution.attempt_count;
        self.result = Some(result);
        Ok(())
    }

    /// Attempts still allowed after the current one, given a default bound.
    pub fn retries_left(&self, default_max_retries: u32) -> u32 {
        let max_attempts = self
            .constraints
            .max_retries
            .unwrap_or(default_max_retries)
            .saturating_add(1);
        max_attempts.saturating_sub(self.execution.attempt_count)
    }

    /// Append to the in-record log.
    pub fn log(&mut self, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry::new(self.execution.attempt_count, message);
        self.execution.log.push(entry.clone());
        entry
    }
}
