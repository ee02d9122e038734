//! Combining subtask results into the parent's result.
//!
//! Aggregation is a pure function of the parent and its children, which is
//! what makes re-running it safe: a parent that is already terminal yields
//! [`Verdict::Settled`] and the caller changes nothing.

use crate::config::AggregationPolicy;
use chrono::Utc;
use serde_json::{Map, Value};
use taskloom_core::{
    FailureReason, NodeType, ResultMetrics, ResultStatus, Task, TaskFailure, TaskId, TaskKind,
    TaskResult, TaskStatus,
};

/// A child as the aggregator sees it.
#[derive(Debug, Clone, Copy)]
pub struct Child<'a> {
    pub task: &'a Task,
    pub node_type: NodeType,
}

/// What should happen to the parent.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The parent is already terminal.
    Settled,
    /// Some child that matters is still running.
    Waiting,
    /// Complete the parent with this result.
    Complete(TaskResult),
    /// Fail the parent and cancel the listed non-terminal children.
    Fail {
        failure: TaskFailure,
        cancel: Vec<TaskId>,
    },
}

/// Aggregate `children` (in the parent's subtask order) into a verdict.
pub fn aggregate(parent: &Task, children: &[Child<'_>], policy: AggregationPolicy) -> Verdict {
    if parent.is_terminal() {
        return Verdict::Settled;
    }

    let required_failures: Vec<&Task> = children
        .iter()
        .filter(|c| c.task.status == TaskStatus::Failed && !c.task.optional)
        .map(|c| c.task)
        .collect();
    let failed_descendants = children
        .iter()
        .filter(|c| c.task.status == TaskStatus::Failed)
        .map(|c| {
            1 + c
                .task
                .result
                .as_ref()
                .and_then(|r| r.error.as_ref())
                .map_or(0, |e| e.failed_descendants)
        })
        .sum();

    if policy == AggregationPolicy::FailFast {
        if let Some(first) = first_failure(&required_failures) {
            let mut failure = inherited_failure(first);
            failure.failed_descendants = failed_descendants;
            let cancel = children
                .iter()
                .filter(|c| !c.task.is_terminal())
                .map(|c| c.task.id)
                .collect();
            return Verdict::Fail { failure, cancel };
        }
    }

    if children.iter().any(|c| !c.task.is_terminal()) {
        return Verdict::Waiting;
    }

    let work: Vec<&Task> = children
        .iter()
        .filter(|c| !c.node_type.is_control())
        .map(|c| c.task)
        .collect();
    let completed: Vec<&Task> = work
        .iter()
        .copied()
        .filter(|t| t.status == TaskStatus::Completed)
        .collect();

    if completed.is_empty() && !required_failures.is_empty() {
        // Nothing succeeded: best effort has nothing to offer.
        let mut failure = first_failure(&required_failures)
            .map(inherited_failure)
            .unwrap_or_else(|| {
                TaskFailure::new(FailureReason::ExecutorError, "every subtask failed", parent.id)
            });
        failure.failed_descendants = failed_descendants;
        return Verdict::Fail {
            failure,
            cancel: Vec::new(),
        };
    }

    let payload = merge_payload(parent.kind, &completed);

    let mut partial = completed
        .iter()
        .any(|t| t.result.as_ref().is_some_and(|r| r.status == ResultStatus::Partial));
    let mut error = None;
    for task in &work {
        match task.status {
            TaskStatus::Failed => {
                partial = true;
                if error.is_none() && !task.optional {
                    error = Some(inherited_failure(task));
                }
            }
            TaskStatus::Cancelled if !pruned(task) => partial = true,
            _ => {}
        }
    }
    if let Some(failure) = error.as_mut() {
        failure.failed_descendants = failed_descendants;
    }

    let metrics = ResultMetrics {
        duration_ms: (Utc::now() - parent.created_at).num_milliseconds().max(0) as u64,
        attempts: work
            .iter()
            .filter_map(|t| t.result.as_ref())
            .map(|r| r.metrics.attempts)
            .sum(),
        resource_units: work
            .iter()
            .filter_map(|t| t.result.as_ref())
            .map(|r| r.metrics.resource_units)
            .sum(),
    };

    Verdict::Complete(TaskResult {
        status: if partial {
            ResultStatus::Partial
        } else {
            ResultStatus::Success
        },
        payload,
        error,
        metrics,
    })
}

/// Payloads of `sources` keyed by task name; the input of control nodes.
pub fn merge_by_name<'a>(sources: impl IntoIterator<Item = &'a Task>) -> Value {
    let mut map = Map::new();
    for task in sources {
        if let Some(result) = &task.result {
            map.insert(task.name.clone(), result.payload.clone());
        }
    }
    Value::Object(map)
}

fn payload_of(task: &Task) -> Value {
    task.result
        .as_ref()
        .map_or(Value::Null, |r| r.payload.clone())
}

fn merge_payload(kind: TaskKind, completed: &[&Task]) -> Value {
    match kind {
        TaskKind::Sequential | TaskKind::Conditional => {
            completed.last().map_or(Value::Null, |t| payload_of(t))
        }
        TaskKind::Iterative => Value::Array(completed.iter().map(|t| payload_of(t)).collect()),
        TaskKind::Parallel | TaskKind::Composite | TaskKind::Atomic => {
            merge_by_name(completed.iter().copied())
        }
    }
}

/// Branch not taken.
fn pruned(task: &Task) -> bool {
    task.result
        .as_ref()
        .and_then(|r| r.error.as_ref())
        .is_some_and(|e| e.reason == FailureReason::ConditionNotMet)
}

/// Earliest finished failure; subtask order breaks ties.
fn first_failure<'a>(failures: &[&'a Task]) -> Option<&'a Task> {
    failures
        .iter()
        .enumerate()
        .min_by_key(|(i, t)| (t.completed_at, *i))
        .map(|(_, t)| *t)
}

/// The child's own failure (which already names the root cause), or a
/// fresh one pointing at the child.
fn inherited_failure(child: &Task) -> TaskFailure {
    child
        .result
        .as_ref()
        .and_then(|r| r.error.clone())
        .unwrap_or_else(|| {
            TaskFailure::new(
                FailureReason::ExecutorError,
                format!("subtask {} failed", child.name),
                child.id,
            )
        })
}
