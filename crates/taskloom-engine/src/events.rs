use chrono::{DateTime, Utc};
use serde::Serialize;
use taskloom_core::{AttemptOutcome, ProgressUpdate, TaskId, TaskStatus};

/// Something observable that happened inside the engine.
///
/// Events are published on a broadcast channel after the records they
/// describe have been written to the store, so a subscriber that reacts to an
/// event always finds the matching state when it reads the store.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A root task was accepted.
    Submitted {
        task_id: TaskId,
        name: String,
    },
    /// A task moved between states.
    StatusChanged {
        task_id: TaskId,
        root_id: TaskId,
        parent_id: Option<TaskId>,
        from: TaskStatus,
        to: TaskStatus,
        at: DateTime<Utc>,
    },
    /// An attempt was dispatched under a lease.
    AttemptStarted {
        task_id: TaskId,
        attempt: u32,
        executor_id: String,
        deadline: DateTime<Utc>,
    },
    /// An attempt ended.
    AttemptFinished {
        task_id: TaskId,
        attempt: u32,
        outcome: AttemptOutcome,
    },
    /// A failed attempt will be retried after `delay_ms`.
    RetryScheduled {
        task_id: TaskId,
        next_attempt: u32,
        delay_ms: u64,
    },
    /// No lease could be granted; the task stays where it is.
    AllocationDenied {
        task_id: TaskId,
        reason: String,
    },
    Progress(ProgressUpdate),
    ExecutorOffline {
        executor_id: String,
    },
    ExecutorOnline {
        executor_id: String,
    },
}

impl EngineEvent {
    /// Task the event is about, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            EngineEvent::Submitted { task_id, .. }
            | EngineEvent::StatusChanged { task_id, .. }
            | EngineEvent::AttemptStarted { task_id, .. }
            | EngineEvent::AttemptFinished { task_id, .. }
            | EngineEvent::RetryScheduled { task_id, .. }
            | EngineEvent::AllocationDenied { task_id, .. } => Some(*task_id),
            EngineEvent::Progress(update) => Some(update.task_id),
            EngineEvent::ExecutorOffline { .. } | EngineEvent::ExecutorOnline { .. } => None,
        }
    }

    /// Whether this event moves `id` into a terminal state.
    pub fn is_terminal_for(&self, id: TaskId) -> bool {
        matches!(self, EngineEvent::StatusChanged { task_id, to, .. } if *task_id == id && to.is_terminal())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_terminal_detection() {
        let id = Uuid::new_v4();
        let event = EngineEvent::StatusChanged {
            task_id: id,
            root_id: id,
            parent_id: None,
            from: TaskStatus::Executing,
            to: TaskStatus::Completed,
            at: Utc::now(),
        };
        assert!(event.is_terminal_for(id));
        assert!(!event.is_terminal_for(Uuid::new_v4()));
        assert_eq!(event.task_id(), Some(id));

        let offline = EngineEvent::ExecutorOffline {
            executor_id: "w1".into(),
        };
        assert!(offline.task_id().is_none());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = EngineEvent::AllocationDenied {
            task_id: Uuid::new_v4(),
            reason: "executors_busy".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "allocation_denied");
    }
}
