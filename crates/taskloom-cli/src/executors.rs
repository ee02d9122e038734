//! Executors shipped with the command-line runner.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use taskloom_core::{
    ExecutionOutput, ExecutionRequest, ExecutorDescriptor, TaskloomError, TaskloomResult,
};
use taskloom_engine::{Executor, ProgressSink};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Returns its parameters and the inputs it received.
pub struct EchoExecutor {
    descriptor: ExecutorDescriptor,
}

impl EchoExecutor {
    pub fn new(descriptor: ExecutorDescriptor) -> Self {
        Self { descriptor }
    }
}

#[async_trait]
impl Executor for EchoExecutor {
    fn descriptor(&self) -> &ExecutorDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        progress: ProgressSink,
    ) -> TaskloomResult<ExecutionOutput> {
        debug!(task = %request.task_name, attempt = request.attempt, "Echo executor");
        progress.report(1.0, None);
        Ok(ExecutionOutput::success(json!({
            "task": request.task_name,
            "parameters": request.parameters,
            "inputs": request.context.inputs,
        })))
    }
}

/// Runs a shell command with `sh -c`.
///
/// The request is written to the command's stdin as JSON. Standard output
/// becomes the payload: parsed as JSON when possible, otherwise kept as a
/// string. A non-zero exit status is an executor error.
pub struct CommandExecutor {
    descriptor: ExecutorDescriptor,
    /// Fixed command; when absent the task's `command` parameter is used.
    command: Option<String>,
}

impl CommandExecutor {
    pub fn new(descriptor: ExecutorDescriptor, command: Option<String>) -> Self {
        Self {
            descriptor,
            command,
        }
    }

    fn command_for(&self, request: &ExecutionRequest) -> TaskloomResult<String> {
        self.command
            .clone()
            .or_else(|| {
                request
                    .parameters
                    .get("command")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                TaskloomError::Executor(format!(
                    "no command configured for {} and none in its parameters",
                    request.task_name
                ))
            })
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn descriptor(&self) -> &ExecutorDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        _progress: ProgressSink,
    ) -> TaskloomResult<ExecutionOutput> {
        let command = self.command_for(&request)?;
        info!(task = %request.task_name, attempt = request.attempt, command = %command, "Running command");

        let input = serde_json::to_vec(&json!({
            "task": request.task_name,
            "attempt": request.attempt,
            "parameters": request.parameters,
            "inputs": request.context.inputs,
            "values": request.context.values,
        }))?;

        // Dropped on timeout or cancellation; the child must not outlive it.
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskloomError::Executor(format!("failed to start '{command}': {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "Command did not read its input");
            }
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaskloomError::Executor(format!(
                "'{command}' exited with {}: {}",
                output.status.code().unwrap_or(-1),
                truncate_output(stderr.trim(), 2_000)
            )));
        }

        let text = stdout.trim();
        let payload = serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
        Ok(ExecutionOutput::success(payload))
    }
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..end], s.len())
}
