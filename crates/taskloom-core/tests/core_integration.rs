#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use taskloom_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Task round-trips through JSON with its execution history intact
// ---------------------------------------------------------------------------

#[test]
fn task_serialization_keeps_history() {
    let mut task = Task::from_description(
        TaskDescription::atomic("lint", json!({"path": "src/"})).with_capabilities(&["lint"]),
        Constraints {
            max_retries: Some(1),
            timeout_ms: Some(5_000),
            ..Default::default()
        },
    );
    task.transition(TaskStatus::Planned).unwrap();
    task.execution.attempt_count = 1;
    task.execution.history.push(AttemptRecord {
        attempt: 1,
        executor_id: "linter".into(),
        started_at: chrono::Utc::now(),
        finished_at: None,
        outcome: AttemptOutcome::Running,
    });
    task.log("dispatched to linter");

    let json = serde_json::to_string(&task).unwrap();
    let parsed: Task = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, task);
    assert_eq!(parsed.execution.history.len(), 1);
    assert_eq!(parsed.requirements.capabilities, vec!["lint".to_string()]);
}

// ---------------------------------------------------------------------------
// 2. Conditional dependency evaluation against a result
// ---------------------------------------------------------------------------

#[test]
fn conditional_dependency_flow() {
    let mut probe = Task::new("probe", TaskKind::Atomic);
    let dep = Dependency::hard(probe.id).when(Condition::FieldEquals {
        pointer: "/mode".into(),
        value: json!("fast"),
    });
    assert!(!probe.satisfies(&dep.condition));

    probe.status = TaskStatus::Completed;
    probe.result = Some(TaskResult::success(json!({"mode": "fast"})));
    assert!(probe.satisfies(&dep.condition));

    probe.result = Some(TaskResult::success(json!({"mode": "slow"})));
    assert!(!probe.satisfies(&dep.condition));
}

// ---------------------------------------------------------------------------
// 3. Graph from a task list: dependencies become edges
// ---------------------------------------------------------------------------

#[test]
fn graph_from_dependencies() {
    let root = Task::new("release", TaskKind::Sequential);
    let build = Task::new("build", TaskKind::Atomic).with_parent(&root);
    let test = Task::new("test", TaskKind::Atomic)
        .with_parent(&root)
        .with_dependencies(vec![Dependency::hard(build.id)]);
    let publish = Task::new("publish", TaskKind::Atomic)
        .with_parent(&root)
        .with_dependencies(vec![Dependency::hard(test.id), Dependency::soft(build.id)]);

    let mut graph = TaskGraph::new(root.id);
    for task in [&build, &test, &publish] {
        graph.add_node(GraphNode {
            id: task.id,
            name: task.name.clone(),
            node_type: NodeType::Task,
            status: task.status,
            estimated_duration_ms: Some(100),
        });
        for dep in &task.dependencies {
            let mut edge = Edge::new(dep.task_id, task.id, EdgeKind::Dependency);
            edge.strength = dep.kind;
            graph.add_edge(edge);
        }
    }

    graph.validate().unwrap();
    let (path, total) = graph.critical_path().unwrap();
    assert_eq!(path, vec![build.id, test.id, publish.id]);
    assert_eq!(total, 300);
    assert_eq!(graph.incoming(publish.id).count(), 2);
    assert_eq!(graph.outgoing(build.id).count(), 2);
    assert!(graph.nodes.get(&Uuid::new_v4()).is_none());
}
