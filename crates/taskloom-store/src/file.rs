//! JSON files on disk, one per task and graph, with JSON-lines execution logs.

use crate::store::TaskStore;
use async_trait::async_trait;
use std::path::PathBuf;
use taskloom_core::{LogEntry, Task, TaskGraph, TaskId, TaskloomError, TaskloomResult};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// File-backed store.
///
/// Layout under `dir`:
/// - `tasks/<id>.json`: current task record
/// - `graphs/<root>.json`: current graph snapshot
/// - `logs/<id>.jsonl`: append-only execution log, one JSON entry per line
pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn new(dir: PathBuf) -> TaskloomResult<Self> {
        for sub in ["tasks", "graphs", "logs"] {
            tokio::fs::create_dir_all(dir.join(sub)).await?;
        }
        Ok(Self { dir })
    }

    fn task_path(&self, id: TaskId) -> PathBuf {
        self.dir.join("tasks").join(format!("{id}.json"))
    }

    fn graph_path(&self, root_id: TaskId) -> PathBuf {
        self.dir.join("graphs").join(format!("{root_id}.json"))
    }

    fn log_path(&self, id: TaskId) -> PathBuf {
        self.dir.join("logs").join(format!("{id}.jsonl"))
    }

    /// Write through a temp file so readers never see a torn record.
    async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> TaskloomResult<()> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn ids_in(&self, sub: &str, suffix: &str) -> TaskloomResult<Vec<TaskId>> {
        let mut entries = tokio::fs::read_dir(self.dir.join(sub)).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(suffix) {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }

    async fn remove_if_exists(path: PathBuf) -> TaskloomResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn put_task(&self, task: &Task) -> TaskloomResult<()> {
        let json = serde_json::to_vec_pretty(task)?;
        Self::write_atomic(self.task_path(task.id), json).await
    }

    async fn get_task(&self, id: TaskId) -> TaskloomResult<Option<Task>> {
        let path = self.task_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let task: Task = serde_json::from_str(&data)
            .map_err(|e| TaskloomError::Store(format!("Failed to parse task {id}: {e}")))?;
        Ok(Some(task))
    }

    async fn tasks_for_root(&self, root_id: TaskId) -> TaskloomResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for id in self.ids_in("tasks", ".json").await? {
            if let Some(task) = self.get_task(id).await? {
                if task.root_id == root_id {
                    tasks.push(task);
                }
            }
        }
        tasks.sort_by_key(|t| (t.created_at, t.sequence));
        Ok(tasks)
    }

    async fn put_graph(&self, graph: &TaskGraph) -> TaskloomResult<()> {
        let json = serde_json::to_vec_pretty(graph)?;
        Self::write_atomic(self.graph_path(graph.root_id), json).await
    }

    async fn get_graph(&self, root_id: TaskId) -> TaskloomResult<Option<TaskGraph>> {
        let path = self.graph_path(root_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let graph: TaskGraph = serde_json::from_str(&data).map_err(|e| {
            TaskloomError::Store(format!("Failed to parse graph {root_id}: {e}"))
        })?;
        Ok(Some(graph))
    }

    async fn append_log(&self, task_id: TaskId, entry: &LogEntry) -> TaskloomResult<()> {
        let line = format!("{}\n", serde_json::to_string(entry)?);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(task_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_log(&self, task_id: TaskId) -> TaskloomResult<Vec<LogEntry>> {
        let path = self.log_path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(path).await?;
        data.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    TaskloomError::Store(format!("Corrupt log line for {task_id}: {e}"))
                })
            })
            .collect()
    }

    async fn list_roots(&self) -> TaskloomResult<Vec<TaskId>> {
        self.ids_in("graphs", ".json").await
    }

    async fn delete_root(&self, root_id: TaskId) -> TaskloomResult<()> {
        for task in self.tasks_for_root(root_id).await? {
            Self::remove_if_exists(self.task_path(task.id)).await?;
            Self::remove_if_exists(self.log_path(task.id)).await?;
        }
        Self::remove_if_exists(self.graph_path(root_id)).await
    }
}
