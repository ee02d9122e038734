//! Leases: the only state shared by every graph.
//!
//! A lease ties one task to one executor for one attempt. Capacity is
//! counted per executor (concurrency limit plus an optional compute budget
//! in resource-class units) and optionally across the whole engine. A
//! denial is not an error; the scheduler leaves the task where it is and
//! tries again on the next tick or when a lease is released.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use taskloom_core::{ExecutorDescriptor, ResourceClass, TaskId};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// Permission for one attempt of one task to run on one executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lease {
    pub id: Uuid,
    pub task_id: TaskId,
    /// Graph the task belongs to, used to route expiry.
    pub root_id: TaskId,
    pub executor_id: String,
    /// Compute units charged against the executor's budget.
    pub units: u32,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Why no lease was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// No candidate executor was offered.
    NoCompatibleExecutor,
    /// Every candidate is at its concurrency limit or compute budget.
    ExecutorsBusy,
    /// The engine-wide concurrency budget is spent.
    GlobalLimit,
    /// The task already holds a lease.
    AlreadyLeased,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DenialReason::NoCompatibleExecutor => "no_compatible_executor",
            DenialReason::ExecutorsBusy => "executors_busy",
            DenialReason::GlobalLimit => "global_limit",
            DenialReason::AlreadyLeased => "already_leased",
        };
        write!(f, "{s}")
    }
}

/// Outcome of [`ResourceManager::allocate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Allocation {
    Granted(Lease),
    Denied(DenialReason),
}

/// What a lease request needs.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub task_id: TaskId,
    pub root_id: TaskId,
    pub class: ResourceClass,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Capacity {
    limit: usize,
    budget: Option<u32>,
    active: usize,
    units: u32,
}

impl Capacity {
    fn from_descriptor(descriptor: &ExecutorDescriptor) -> Self {
        Self {
            limit: descriptor.concurrency_limit.max(1),
            budget: descriptor.compute_budget,
            active: 0,
            units: 0,
        }
    }

    /// An idle executor always accepts one lease, so a class heavier than
    /// the whole budget still runs, alone.
    fn fits(&self, units: u32) -> bool {
        self.active < self.limit
            && self
                .budget
                .map_or(true, |b| self.units == 0 || self.units + units <= b)
    }
}

#[derive(Debug, Default)]
struct State {
    executors: HashMap<String, Capacity>,
    leases: HashMap<TaskId, Lease>,
}

/// Allocates and tracks leases.
#[derive(Debug)]
pub struct ResourceManager {
    state: Mutex<State>,
    max_concurrent: Option<usize>,
    released: Notify,
}

impl ResourceManager {
    /// `max_concurrent` caps leases across all executors.
    pub fn new(max_concurrent: Option<usize>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_concurrent,
            released: Notify::new(),
        }
    }

    /// Take capacity limits from a descriptor. Active leases are kept.
    pub fn configure(&self, descriptor: &ExecutorDescriptor) {
        let mut state = self.state.lock();
        let fresh = Capacity::from_descriptor(descriptor);
        let entry = state
            .executors
            .entry(descriptor.id.clone())
            .or_insert_with(|| fresh.clone());
        entry.limit = fresh.limit;
        entry.budget = fresh.budget;
    }

    /// Override the limits of a configured executor. Returns false when the
    /// executor is unknown.
    pub fn set_capacity(&self, executor_id: &str, limit: usize, budget: Option<u32>) -> bool {
        let changed = match self.state.lock().executors.get_mut(executor_id) {
            Some(capacity) => {
                capacity.limit = limit.max(1);
                capacity.budget = budget;
                true
            }
            None => false,
        };
        if changed {
            // Raised limits may unblock waiting tasks.
            self.released.notify_waiters();
        }
        changed
    }

    /// Forget an executor's capacity. Leases it still holds stay until
    /// their graphs release them.
    pub fn remove(&self, executor_id: &str) -> bool {
        self.state.lock().executors.remove(executor_id).is_some()
    }

    /// Try the candidates in order and lease the first with room.
    pub fn allocate(&self, request: &LeaseRequest, candidates: &[ExecutorDescriptor]) -> Allocation {
        if candidates.is_empty() {
            return Allocation::Denied(DenialReason::NoCompatibleExecutor);
        }
        let mut state = self.state.lock();
        if state.leases.contains_key(&request.task_id) {
            return Allocation::Denied(DenialReason::AlreadyLeased);
        }
        if self
            .max_concurrent
            .is_some_and(|max| state.leases.len() >= max)
        {
            return Allocation::Denied(DenialReason::GlobalLimit);
        }

        let units = request.class.weight();
        for descriptor in candidates {
            let capacity = state
                .executors
                .entry(descriptor.id.clone())
                .or_insert_with(|| Capacity::from_descriptor(descriptor));
            if !capacity.fits(units) {
                continue;
            }
            capacity.active += 1;
            capacity.units += units;
            let lease = Lease {
                id: Uuid::new_v4(),
                task_id: request.task_id,
                root_id: request.root_id,
                executor_id: descriptor.id.clone(),
                units,
                granted_at: Utc::now(),
                expires_at: request.expires_at,
            };
            state.leases.insert(request.task_id, lease.clone());
            debug!(task_id = %request.task_id, executor_id = %descriptor.id, "Lease granted");
            return Allocation::Granted(lease);
        }
        Allocation::Denied(DenialReason::ExecutorsBusy)
    }

    /// Release the lease held by `task_id`, if any, and wake waiters.
    pub fn release(&self, task_id: TaskId) -> Option<Lease> {
        let lease = {
            let mut state = self.state.lock();
            let lease = state.leases.remove(&task_id)?;
            if let Some(capacity) = state.executors.get_mut(&lease.executor_id) {
                capacity.active = capacity.active.saturating_sub(1);
                capacity.units = capacity.units.saturating_sub(lease.units);
            }
            lease
        };
        debug!(task_id = %task_id, executor_id = %lease.executor_id, "Lease released");
        self.released.notify_waiters();
        Some(lease)
    }

    /// Future resolving on the next release or capacity change.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Leases whose expiry is before `now`. They stay held; the owning
    /// graph releases them when it handles the expiry.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Lease> {
        let mut expired: Vec<Lease> = self
            .state
            .lock()
            .leases
            .values()
            .filter(|l| l.expires_at < now)
            .cloned()
            .collect();
        expired.sort_by_key(|l| l.expires_at);
        expired
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    /// Active leases over the concurrency limit, in `[0, 1]`.
    pub fn load(&self, executor_id: &str) -> f64 {
        self.state
            .lock()
            .executors
            .get(executor_id)
            .map_or(0.0, |c| c.active as f64 / c.limit as f64)
    }
}
