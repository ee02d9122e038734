use crate::task::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`TaskloomError`].
pub type TaskloomResult<T> = Result<T, TaskloomError>;

/// Top-level error type for the taskloom engine.
///
/// Each variant corresponds to a subsystem or to one entry of the failure
/// taxonomy. Resource exhaustion is absent on purpose: a denied allocation
/// defers a task, it never fails it.
#[derive(Error, Debug)]
pub enum TaskloomError {
    /// A composite task could not be expanded into a subgraph.
    #[error("Decomposition error: {0}")]
    Decomposition(String),

    /// An executor reported a failure for an attempt.
    #[error("Executor error: {0}")]
    Executor(String),

    /// An attempt did not finish before its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The executor running an attempt stopped heartbeating or was removed.
    #[error("Executor lost: {0}")]
    ExecutorLost(String),

    /// The task was cancelled on request.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A hard prerequisite failed and will not recover.
    #[error("Dependency failed: {0}")]
    DependencyFailed(String),

    /// A task graph contains a cycle.
    #[error("Cyclic graph: {0}")]
    CyclicGraph(String),

    /// A task graph references unknown nodes or is otherwise malformed.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// A status change that the task state machine does not allow.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// A task, graph or executor id that is not known.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A persistence failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskloomError {
    /// Map this error onto the failure taxonomy recorded on tasks.
    pub fn reason(&self) -> FailureReason {
        match self {
            TaskloomError::Decomposition(_)
            | TaskloomError::CyclicGraph(_)
            | TaskloomError::InvalidGraph(_) => FailureReason::DecompositionError,
            TaskloomError::Timeout(_) => FailureReason::Timeout,
            TaskloomError::ExecutorLost(_) => FailureReason::ExecutorLost,
            TaskloomError::Cancelled(_) => FailureReason::Cancelled,
            TaskloomError::DependencyFailed(_) => FailureReason::DependencyFailed,
            _ => FailureReason::ExecutorError,
        }
    }
}

/// Why a task ended (or an attempt ended) without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The task could not be decomposed. Structural, never retried.
    DecompositionError,
    /// The executor reported an error.
    ExecutorError,
    /// The attempt exceeded its deadline.
    Timeout,
    /// The executor went away mid-attempt.
    ExecutorLost,
    /// Cancelled on request.
    Cancelled,
    /// A hard prerequisite failed terminally.
    DependencyFailed,
    /// A conditional edge into this task evaluated false; the branch was not taken.
    ConditionNotMet,
}

impl FailureReason {
    /// Whether an attempt ending with this reason may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::ExecutorError | FailureReason::Timeout | FailureReason::ExecutorLost
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::DecompositionError => "decomposition_error",
            FailureReason::ExecutorError => "executor_error",
            FailureReason::Timeout => "timeout",
            FailureReason::ExecutorLost => "executor_lost",
            FailureReason::Cancelled => "cancelled",
            FailureReason::DependencyFailed => "dependency_failed",
            FailureReason::ConditionNotMet => "condition_not_met",
        };
        write!(f, "{s}")
    }
}

/// A recorded failure, carrying the task that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Taxonomy entry.
    pub reason: FailureReason,
    /// Human-readable detail, usually the executor's error message.
    pub message: String,
    /// Task where the failure originated. Equal to the failing task itself
    /// unless the failure was inherited from a subtask or prerequisite.
    pub origin: TaskId,
    /// Number of descendants in `failed` state when a composite failed.
    #[serde(default)]
    pub failed_descendants: usize,
}

impl TaskFailure {
    /// A failure that originated in `origin`.
    pub fn new(reason: FailureReason, message: impl Into<String>, origin: TaskId) -> Self {
        Self {
            reason,
            message: message.into(),
            origin,
            failed_descendants: 0,
        }
    }

    /// Build a failure from an error returned for `origin`.
    pub fn from_error(err: &TaskloomError, origin: TaskId) -> Self {
        Self::new(err.reason(), err.to_string(), origin)
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (task {}): {}", self.reason, self.origin, self.message)
    }
}
