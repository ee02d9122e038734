//! Task orchestration engine: decomposition, dependency resolution,
//! scheduling, execution with retries, and result aggregation.
//!
//! Each submitted root task is owned by a single scheduling actor that
//! decomposes composites, dispatches ready work to executors under leases
//! from the shared resource manager, and folds subtask results back into
//! their parents.
//!
//! # Main types
//!
//! - [`Engine`]: Facade: submit, query, cancel and wait for tasks.
//! - [`Executor`]: Trait implemented by workers that perform atomic tasks.
//! - [`DecomposerRegistry`]: Named decomposition strategies with a default per kind.
//! - [`Resolver`]: Incremental ready-set computation over a task graph.
//! - [`ResourceManager`]: Executor capacity and execution leases.
//! - [`EngineMonitor`]: Counters, running tasks and alerts built from [`EngineEvent`]s.
//! - [`EngineConfig`]: Timeouts, retry policy, aggregation policy and limits.

/// Result aggregation for composite tasks.
pub mod aggregator;
/// Engine configuration.
pub mod config;
/// Attempt execution, deadlines and retry decisions.
pub mod controller;
/// Decomposition strategies and their registry.
pub mod decomposer;
/// Engine facade.
pub mod engine;
/// Events published by the engine.
pub mod events;
/// Metrics and alerts.
pub mod monitor;
/// Executor trait and registry.
pub mod registry;
/// Ready-set computation.
pub mod resolver;
/// Capacity accounting and leases.
pub mod resources;
mod scheduler;

pub use aggregator::{aggregate, Verdict};
pub use config::{AggregationPolicy, DeadlineScope, EngineConfig, MonitorConfig, RetryPolicy};
pub use controller::{compute_backoff, AttemptResult, RetryDecision};
pub use decomposer::{
    Decomposer, DecomposerRegistry, Decomposition, EdgeSpec, FanOutDecomposer, IterateDecomposer,
    StaticDecomposer, SubtaskSpec,
};
pub use engine::{Engine, ResultState};
pub use events::EngineEvent;
pub use monitor::{Alert, AlertKind, EngineMetrics, EngineMonitor};
pub use registry::{Executor, ExecutorRegistry, ExecutorStats, Liveness, ProgressSink};
pub use resolver::{BlockCause, Resolution, Resolver};
pub use resources::{Allocation, DenialReason, Lease, ResourceManager};
