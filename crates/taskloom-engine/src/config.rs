use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use taskloom_core::{TaskloomError, TaskloomResult};

/// Exponential backoff settings for retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Relative jitter in `[0, 1]`; 0.2 means ±20%.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
        }
    }
}

/// How a task's timeout applies across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineScope {
    /// Every attempt gets the full timeout.
    #[default]
    PerAttempt,
    /// The timeout is a budget from the first attempt; retries stop once it is spent.
    Cumulative,
}

/// What happens to a composite when a required subtask fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Fail the parent on the first required failure and cancel the rest.
    #[default]
    FailFast,
    /// Let siblings finish; complete the parent with a `partial` result.
    BestEffort,
}

/// Thresholds used by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Executing with no progress or transition for this long raises `stalled`.
    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,
    /// Executing for longer than this raises `runaway`.
    #[serde(default = "default_runaway_threshold_ms")]
    pub runaway_threshold_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stall_threshold_ms: default_stall_threshold_ms(),
            runaway_threshold_ms: default_runaway_threshold_ms(),
        }
    }
}

/// Engine configuration. Every field has a default, so an empty TOML
/// document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub default_attempt_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub deadline_scope: DeadlineScope,
    #[serde(default)]
    pub aggregation: AggregationPolicy,
    #[serde(default = "default_liveness_window_ms")]
    pub liveness_window_ms: u64,
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    /// Leases expire this long after their attempt's deadline.
    #[serde(default = "default_lease_grace_ms")]
    pub lease_grace_ms: u64,
    /// Global cap on simultaneously leased tasks.
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            default_attempt_timeout_ms: default_attempt_timeout_ms(),
            default_max_retries: default_max_retries(),
            retry: RetryPolicy::default(),
            deadline_scope: DeadlineScope::default(),
            aggregation: AggregationPolicy::default(),
            liveness_window_ms: default_liveness_window_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            lease_grace_ms: default_lease_grace_ms(),
            max_concurrent_tasks: None,
            monitor: MonitorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse from a TOML document and validate.
    pub fn from_toml_str(text: &str) -> TaskloomResult<Self> {
        let config: EngineConfig = toml::from_str(text)
            .map_err(|e| TaskloomError::Config(format!("Invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub async fn from_file(path: &Path) -> TaskloomResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            TaskloomError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values that would make the engine spin or never retry sanely.
    pub fn validate(&self) -> TaskloomResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(TaskloomError::Config(
                "tick_interval_ms must be greater than zero".into(),
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(TaskloomError::Config(
                "maintenance_interval_ms must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(TaskloomError::Config(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(TaskloomError::Config(
                "retry.backoff_base_ms exceeds retry.backoff_max_ms".into(),
            ));
        }
        if self.max_concurrent_tasks == Some(0) {
            return Err(TaskloomError::Config(
                "max_concurrent_tasks must be greater than zero when set".into(),
            ));
        }
        Ok(())
    }

    /// Scheduling tick as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Liveness window as a [`Duration`].
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }
}

fn default_tick_interval_ms() -> u64 {
    50
}
fn default_attempt_timeout_ms() -> u64 {
    300_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_max_ms() -> u64 {
    10_000
}
fn default_jitter() -> f64 {
    0.2
}
fn default_liveness_window_ms() -> u64 {
    30_000
}
fn default_maintenance_interval_ms() -> u64 {
    1_000
}
fn default_lease_grace_ms() -> u64 {
    5_000
}
fn default_stall_threshold_ms() -> u64 {
    60_000
}
fn default_runaway_threshold_ms() -> u64 {
    600_000
}
