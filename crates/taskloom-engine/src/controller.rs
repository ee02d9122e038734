//! One dispatched attempt: deadline, cooperative cancellation, outcome
//! classification, and the retry decision that follows a failure.

use crate::config::{DeadlineScope, EngineConfig, RetryPolicy};
use crate::registry::{Executor, ProgressSink};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use taskloom_core::{
    ExecutionOutput, ExecutionRequest, FailureReason, ResultStatus, Task, TaskloomError,
};
use tokio::sync::watch;
use tracing::{debug, warn};

/// How one attempt ended, as seen by the engine.
#[derive(Debug)]
pub enum AttemptResult {
    Succeeded(ExecutionOutput),
    Failed(TaskloomError),
    /// The cancel signal fired before the executor answered.
    Cancelled,
}

/// Run one attempt against `executor`.
///
/// Races the executor future against the request deadline and the cancel
/// signal. On cancellation the executor is asked to stop, but the result
/// does not wait for it to acknowledge.
pub async fn run_attempt(
    executor: Arc<dyn Executor>,
    request: ExecutionRequest,
    progress: ProgressSink,
    mut cancel: watch::Receiver<bool>,
) -> AttemptResult {
    let task_id = request.task_id;
    let attempt = request.attempt;
    let budget = (request.deadline - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    debug!(task_id = %task_id, attempt, budget_ms = budget.as_millis() as u64, "Attempt running");

    let work = tokio::time::timeout(budget, executor.execute(request, progress));
    tokio::pin!(work);

    let cancelled = async {
        loop {
            if *cancel.borrow() {
                return;
            }
            if cancel.changed().await.is_err() {
                // Sender gone without cancelling: never fire.
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        outcome = &mut work => match outcome {
            Ok(Ok(output)) if output.status == ResultStatus::Failure => {
                AttemptResult::Failed(TaskloomError::Executor(format!(
                    "attempt {attempt} reported failure: {}",
                    output.payload
                )))
            }
            Ok(Ok(output)) => AttemptResult::Succeeded(output),
            Ok(Err(err)) => AttemptResult::Failed(err),
            Err(_) => {
                warn!(task_id = %task_id, attempt, "Attempt exceeded its deadline");
                executor.cancel(task_id).await;
                AttemptResult::Failed(TaskloomError::Timeout(format!(
                    "attempt {attempt} exceeded {} ms",
                    budget.as_millis()
                )))
            }
        },
        _ = cancelled => {
            executor.cancel(task_id).await;
            AttemptResult::Cancelled
        }
    }
}

/// Deadline for the next attempt of `task` starting at `now`.
///
/// The timeout is the task's own or the engine ceiling. Under a cumulative
/// scope it is measured from the first attempt. An absolute deadline on the
/// task always caps the result.
pub fn attempt_deadline(task: &Task, config: &EngineConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let timeout_ms = task
        .constraints
        .timeout_ms
        .unwrap_or(config.default_attempt_timeout_ms);
    let timeout = chrono::Duration::milliseconds(i64::try_from(timeout_ms).unwrap_or(i64::MAX / 2));
    let start = match config.deadline_scope {
        DeadlineScope::PerAttempt => now,
        DeadlineScope::Cumulative => task.execution.started_at.unwrap_or(now),
    };
    let relative = start
        .checked_add_signed(timeout)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    match task.constraints.deadline {
        Some(absolute) if absolute < relative => absolute,
        _ => relative,
    }
}

/// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
/// capped at the policy maximum, then scaled by a random factor in
/// `[1 - jitter, 1 + jitter]` and capped again.
pub fn compute_backoff(policy: &RetryPolicy, retry: u32, rng: &mut impl Rng) -> Duration {
    let exponent = retry.saturating_sub(1).min(32);
    let raw = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(policy.backoff_max_ms);
    let jitter = policy.jitter.clamp(0.0, 1.0);
    let scaled = if jitter > 0.0 {
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        ((raw as f64) * factor).round() as u64
    } else {
        raw
    };
    Duration::from_millis(scaled.min(policy.backoff_max_ms))
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Decide whether `task`, whose latest attempt failed with `reason`, gets
/// another attempt. `attempt_count` on the task already includes the failed
/// attempt.
pub fn decide_retry(
    task: &Task,
    reason: FailureReason,
    config: &EngineConfig,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> RetryDecision {
    if !reason.is_retryable() || task.retries_left(config.default_max_retries) == 0 {
        return RetryDecision::GiveUp;
    }
    let delay = compute_backoff(&config.retry, task.execution.attempt_count, rng);
    let resume = now + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64);
    if attempt_deadline(task, config, resume) <= resume {
        // Deadline or cumulative budget spent before the retry could start.
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry { delay }
}
