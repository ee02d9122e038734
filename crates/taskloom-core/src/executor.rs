use crate::task::{ResultStatus, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An operation an executor advertises, with its parameter and return shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub name: String,
    /// JSON-schema-like description of accepted parameters.
    #[serde(default)]
    pub parameters: Value,
    /// JSON-schema-like description of the payload returned.
    #[serde(default)]
    pub returns: Value,
}

/// Advertisement of an executor's identity, capabilities and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorDescriptor {
    pub id: String,
    pub name: String,
    /// Capability tags matched against task requirements.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
    /// Simultaneous attempts this executor accepts.
    pub concurrency_limit: usize,
    /// Optional compute budget in resource-class units.
    #[serde(default)]
    pub compute_budget: Option<u32>,
}

impl ExecutorDescriptor {
    /// Descriptor with a concurrency limit of one.
    pub fn new(id: impl Into<String>, capabilities: &[&str]) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            capabilities: capabilities.iter().map(|c| (*c).to_string()).collect(),
            operations: Vec::new(),
            concurrency_limit: 1,
            compute_budget: None,
        }
    }

    /// Set the concurrency limit.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Whether every tag in `required` is advertised.
    pub fn supports(&self, required: &[String]) -> bool {
        required.iter().all(|tag| self.capabilities.contains(tag))
    }
}

/// Explicit context handed to decomposers and executors instead of any
/// process-wide state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Root task of the graph the work belongs to.
    pub root_id: Option<TaskId>,
    /// Background values supplied by the caller (knowledge, settings).
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    /// Payloads of completed hard prerequisites, keyed by task name.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

impl ExecutionContext {
    /// Add a background value.
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

/// One attempt's request to an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub task_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub parameters: Value,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub context: ExecutionContext,
}

/// What an executor returns on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub status: ResultStatus,
    pub payload: Value,
}

impl ExecutionOutput {
    /// A successful output.
    pub fn success(payload: Value) -> Self {
        Self {
            status: ResultStatus::Success,
            payload,
        }
    }

    /// An output flagged as partial.
    pub fn partial(payload: Value) -> Self {
        Self {
            status: ResultStatus::Partial,
            payload,
        }
    }
}

/// A progress report streamed by an executor mid-attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: TaskId,
    pub attempt: u32,
    pub fraction: f64,
    #[serde(default)]
    pub note: Option<String>,
}
