#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use serde_json::json;
use taskloom_core::*;
use taskloom_store::{FileTaskStore, TaskStore};

async fn open() -> (tempfile::TempDir, FileTaskStore) {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileTaskStore::new(tmp.path().to_path_buf()).await.unwrap();
    (tmp, store)
}

#[tokio::test]
async fn task_record_survives_reopen() {
    let (tmp, store) = open().await;
    let mut task = Task::from_description(
        TaskDescription::atomic("fetch", json!({"url": "https://example.org"})),
        Constraints::default(),
    );
    task.transition(TaskStatus::Planned).unwrap();
    store.put_task(&task).await.unwrap();
    drop(store);

    let reopened = FileTaskStore::new(tmp.path().to_path_buf()).await.unwrap();
    let loaded = reopened.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Planned);
    assert_eq!(loaded.objective["url"], "https://example.org");
}

#[tokio::test]
async fn missing_records_are_none() {
    let (_tmp, store) = open().await;
    let id = uuid::Uuid::new_v4();
    assert!(store.get_task(id).await.unwrap().is_none());
    assert!(store.get_graph(id).await.unwrap().is_none());
    assert!(store.read_log(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn log_appends_in_order() {
    let (_tmp, store) = open().await;
    let id = uuid::Uuid::new_v4();
    for i in 1..=3 {
        store
            .append_log(id, &LogEntry::new(i, format!("attempt {i} started")))
            .await
            .unwrap();
    }
    let log = store.read_log(id).await.unwrap();
    let attempts: Vec<u32> = log.iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn graph_round_trip_and_sweep() {
    let (_tmp, store) = open().await;

    let mut root = Task::new("pipeline", TaskKind::Sequential);
    let child = Task::new("step", TaskKind::Atomic).with_parent(&root);
    let mut graph = TaskGraph::new(root.id);
    graph.add_node(GraphNode {
        id: child.id,
        name: child.name.clone(),
        node_type: NodeType::Task,
        status: TaskStatus::Completed,
        estimated_duration_ms: None,
    });
    root.transition(TaskStatus::Cancelled).unwrap();

    store.put_task(&root).await.unwrap();
    store.put_task(&child).await.unwrap();
    store.put_graph(&graph).await.unwrap();
    store.append_log(child.id, &LogEntry::new(1, "done")).await.unwrap();

    assert_eq!(store.get_graph(root.id).await.unwrap().unwrap(), graph);
    assert_eq!(store.tasks_for_root(root.id).await.unwrap().len(), 2);

    // Cutoff before the root finished keeps everything.
    let early = root.completed_at.unwrap() - chrono::Duration::seconds(10);
    assert_eq!(store.sweep(early).await.unwrap(), 0);

    let removed = store
        .sweep(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.get_task(child.id).await.unwrap().is_none());
    assert!(store.read_log(child.id).await.unwrap().is_empty());
    assert!(store.list_roots().await.unwrap().is_empty());
}
