//! Core types for the taskloom task orchestration engine.
//!
//! This crate holds the data model shared by the store and the engine:
//! tasks and their state machine, task graphs with the graph algorithms
//! the scheduler needs, executor descriptors, and the error taxonomy.
//!
//! # Main types
//!
//! - [`Task`]: A unit of work with status, requirements, dependencies and result.
//! - [`TaskGraph`]: The DAG of subtasks belonging to one root task.
//! - [`ExecutorDescriptor`]: What an executor advertises.
//! - [`TaskloomError`]: Unified error enum; [`FailureReason`] is the recorded taxonomy.

/// Conditions evaluated against prerequisite results.
pub mod condition;
/// Error enum and failure taxonomy.
pub mod error;
/// Executor descriptors and the request/response shapes of an attempt.
pub mod executor;
/// Task graph model and algorithms.
pub mod graph;
/// Task model and state machine.
pub mod task;

pub use condition::Condition;
pub use error::{FailureReason, TaskFailure, TaskloomError, TaskloomResult};
pub use executor::{
    ExecutionContext, ExecutionOutput, ExecutionRequest, ExecutorDescriptor, OperationSpec,
    ProgressUpdate,
};
pub use graph::{Edge, EdgeKind, GraphNode, NodeType, TaskGraph};
pub use task::{
    AttemptOutcome, AttemptRecord, Constraints, Dependency, DependencyCondition, DependencyKind,
    ExecutionPlan, ExecutionRecord, LogEntry, OrderingStrategy, Requirements, ResourceClass,
    ResultMetrics, ResultStatus, Task, TaskDescription, TaskId, TaskKind, TaskResult, TaskStatus,
};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 over the canonical JSON form of `value`.
///
/// `serde_json` maps keep keys sorted, so equal values hash equally
/// regardless of construction order.
pub fn fingerprint<T: Serialize>(value: &T) -> TaskloomResult<String> {
    let canonical = serde_json::to_vec(&serde_json::to_value(value)?)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}
