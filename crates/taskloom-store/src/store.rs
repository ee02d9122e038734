use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use taskloom_core::{LogEntry, Task, TaskGraph, TaskId, TaskloomResult};
use tracing::debug;

/// Addressable storage for task records, graphs and execution logs.
///
/// Pure data access: no status policy lives here. Task records and graphs
/// are mutable current-state snapshots; the per-task log is append-only.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or overwrite a task record.
    async fn put_task(&self, task: &Task) -> TaskloomResult<()>;
    /// Fetch a task record.
    async fn get_task(&self, id: TaskId) -> TaskloomResult<Option<Task>>;
    /// Every task whose `root_id` is `root_id`, the root included.
    async fn tasks_for_root(&self, root_id: TaskId) -> TaskloomResult<Vec<Task>>;
    /// Insert or overwrite the graph of `graph.root_id`.
    async fn put_graph(&self, graph: &TaskGraph) -> TaskloomResult<()>;
    /// Fetch the graph rooted at `root_id`.
    async fn get_graph(&self, root_id: TaskId) -> TaskloomResult<Option<TaskGraph>>;
    /// Append one entry to a task's execution log.
    async fn append_log(&self, task_id: TaskId, entry: &LogEntry) -> TaskloomResult<()>;
    /// Read a task's execution log in append order.
    async fn read_log(&self, task_id: TaskId) -> TaskloomResult<Vec<LogEntry>>;
    /// Ids of all root tasks that have a graph.
    async fn list_roots(&self) -> TaskloomResult<Vec<TaskId>>;
    /// Remove a root's tasks, graph and logs.
    async fn delete_root(&self, root_id: TaskId) -> TaskloomResult<()>;

    /// Retention sweep: delete every root graph whose root task finished
    /// before `finished_before`. Never called implicitly.
    async fn sweep(&self, finished_before: DateTime<Utc>) -> TaskloomResult<usize> {
        let mut removed = 0;
        for root_id in self.list_roots().await? {
            let Some(root) = self.get_task(root_id).await? else {
                continue;
            };
            let expired = root.is_terminal()
                && root
                    .completed_at
                    .is_some_and(|done| done < finished_before);
            if expired {
                debug!(root_id = %root_id, "Retention sweep removing graph");
                self.delete_root(root_id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// In-memory store. The default backend.
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    graphs: RwLock<HashMap<TaskId, TaskGraph>>,
    logs: RwLock<HashMap<TaskId, Vec<LogEntry>>>,
}

impl InMemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            graphs: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of task records held.
    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn put_task(&self, task: &Task) -> TaskloomResult<()> {
        self.tasks.write().insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> TaskloomResult<Option<Task>> {
        Ok(self.tasks.read().get(&id).cloned())
    }

    async fn tasks_for_root(&self, root_id: TaskId) -> TaskloomResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.root_id == root_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.sequence));
        Ok(tasks)
    }

    async fn put_graph(&self, graph: &TaskGraph) -> TaskloomResult<()> {
        self.graphs.write().insert(graph.root_id, graph.clone());
        Ok(())
    }

    async fn get_graph(&self, root_id: TaskId) -> TaskloomResult<Option<TaskGraph>> {
        Ok(self.graphs.read().get(&root_id).cloned())
    }

    async fn append_log(&self, task_id: TaskId, entry: &LogEntry) -> TaskloomResult<()> {
        self.logs
            .write()
            .entry(task_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn read_log(&self, task_id: TaskId) -> TaskloomResult<Vec<LogEntry>> {
        Ok(self.logs.read().get(&task_id).cloned().unwrap_or_default())
    }

    async fn list_roots(&self) -> TaskloomResult<Vec<TaskId>> {
        Ok(self.graphs.read().keys().copied().collect())
    }

    async fn delete_root(&self, root_id: TaskId) -> TaskloomResult<()> {
        let removed: Vec<TaskId> = {
            let mut tasks = self.tasks.write();
            let ids: Vec<TaskId> = tasks
                .values()
                .filter(|t| t.root_id == root_id)
                .map(|t| t.id)
                .collect();
            for id in &ids {
                tasks.remove(id);
            }
            ids
        };
        let mut logs = self.logs.write();
        for id in &removed {
            logs.remove(id);
        }
        self.graphs.write().remove(&root_id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use taskloom_core::{TaskKind, TaskStatus};

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryTaskStore::new();
        let task = Task::new("index", TaskKind::Atomic);
        store.put_task(&task).await.unwrap();
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);
        assert_eq!(store.task_count(), 1);
    }

    #[tokio::test]
    async fn test_tasks_for_root() {
        let store = InMemoryTaskStore::new();
        let root = Task::new("root", TaskKind::Parallel);
        let child = Task::new("child", TaskKind::Atomic).with_parent(&root);
        let other = Task::new("other", TaskKind::Atomic);
        for t in [&root, &child, &other] {
            store.put_task(t).await.unwrap();
        }
        let tasks = store.tasks_for_root(root.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.root_id == root.id));
    }

    #[tokio::test]
    async fn test_log_is_append_only() {
        let store = InMemoryTaskStore::new();
        let id = uuid::Uuid::new_v4();
        store.append_log(id, &LogEntry::new(1, "first")).await.unwrap();
        store.append_log(id, &LogEntry::new(2, "second")).await.unwrap();
        let log = store.read_log(id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, "first");
        assert_eq!(log[1].attempt, 2);
    }

    #[tokio::test]
    async fn test_sweep_only_removes_finished_roots() {
        let store = InMemoryTaskStore::new();

        let mut finished = Task::new("old", TaskKind::Atomic);
        finished.transition(TaskStatus::Cancelled).unwrap();
        let running = Task::new("live", TaskKind::Atomic);
        for t in [&finished, &running] {
            store.put_task(t).await.unwrap();
            store.put_graph(&TaskGraph::new(t.id)).await.unwrap();
            store.append_log(t.id, &LogEntry::new(0, "created")).await.unwrap();
        }

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let removed = store.sweep(cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_task(finished.id).await.unwrap().is_none());
        assert!(store.read_log(finished.id).await.unwrap().is_empty());
        assert!(store.get_task(running.id).await.unwrap().is_some());
        assert_eq!(store.list_roots().await.unwrap(), vec![running.id]);
    }
}
