//! Workflow files: the executors to register and the root task to submit.
//!
//! ```toml
//! [[executors]]
//! id = "shell"
//! kind = "command"
//! capabilities = ["shell"]
//! concurrency = 4
//!
//! [task]
//! name = "build"
//! kind = "sequential"
//!
//! [[task.objective.subtasks]]
//! key = "compile"
//! objective = { command = "make" }
//! requirements = { capabilities = ["shell"] }
//! ```

use crate::executors::{CommandExecutor, EchoExecutor};
use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use taskloom_core::{Constraints, ExecutorDescriptor, TaskDescription};
use taskloom_engine::Executor;

/// Built-in executor implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Echo,
    Command,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub id: String,
    pub kind: ExecutorKind,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub compute_budget: Option<u32>,
    /// Fixed command for `command` executors.
    #[serde(default)]
    pub command: Option<String>,
}

fn default_concurrency() -> usize {
    1
}

impl ExecutorConfig {
    fn descriptor(&self) -> ExecutorDescriptor {
        let capabilities: Vec<&str> = self.capabilities.iter().map(String::as_str).collect();
        let mut descriptor =
            ExecutorDescriptor::new(&self.id, &capabilities).with_concurrency(self.concurrency);
        descriptor.compute_budget = self.compute_budget;
        descriptor
    }

    /// Instantiate the executor.
    pub fn build(&self) -> Arc<dyn Executor> {
        match self.kind {
            ExecutorKind::Echo => Arc::new(EchoExecutor::new(self.descriptor())),
            ExecutorKind::Command => Arc::new(CommandExecutor::new(
                self.descriptor(),
                self.command.clone(),
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub executors: Vec<ExecutorConfig>,
    pub task: TaskDescription,
    #[serde(default)]
    pub constraints: Constraints,
    /// Background values passed to decomposers and executors.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl Workflow {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let workflow: Workflow = toml::from_str(text).context("Invalid workflow")?;
        let mut seen = std::collections::HashSet::new();
        for executor in &workflow.executors {
            if !seen.insert(executor.id.as_str()) {
                anyhow::bail!("Executor '{}' is declared twice", executor.id);
            }
        }
        Ok(workflow)
    }

    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read workflow file '{}'", path.display()))?;
        Self::from_toml_str(&text)
    }
}
