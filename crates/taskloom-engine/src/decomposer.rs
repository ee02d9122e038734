//! Pluggable decomposition strategies and the registry that selects them.
//!
//! A strategy turns a composite task into subtasks plus edges. The engine
//! materialises the result into task records whose ids are derived from the
//! parent id and the subtask key, so replaying a decomposition yields the
//! same ids.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use taskloom_core::{
    fingerprint, Condition, Constraints, Dependency, DependencyCondition, DependencyKind, Edge,
    EdgeKind, ExecutionContext, GraphNode, NodeType, Requirements, Task, TaskGraph, TaskKind,
    TaskloomError, TaskloomResult,
};
use tracing::{debug, info};
use uuid::Uuid;

/// One subtask produced by a strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// Unique within the decomposition; also the subtask's name.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub objective: Value,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub constraints: Constraints,
    /// Failure does not fail the parent.
    #[serde(default)]
    pub optional: bool,
}

impl SubtaskSpec {
    /// Atomic subtask requiring `capabilities`.
    pub fn atomic(key: impl Into<String>, capabilities: &[&str], objective: Value) -> Self {
        Self {
            key: key.into(),
            objective,
            requirements: Requirements {
                capabilities: capabilities.iter().map(|c| (*c).to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// An edge between two subtask keys (or the parent id, which is implied).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub kind: EdgeKind,
    #[serde(default)]
    pub strength: DependencyKind,
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl EdgeSpec {
    /// Hard dependency edge `source -> target`.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: EdgeKind::Dependency,
            strength: DependencyKind::Hard,
            condition: None,
        }
    }
}

/// Output of a decomposition strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub subtasks: Vec<SubtaskSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Name of the method used, recorded on the parent's plan.
    pub method: String,
}

/// A decomposition strategy.
///
/// Implementations must be deterministic: identical task content and
/// context must yield an identical decomposition.
#[async_trait]
pub trait Decomposer: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;

    /// Expand `task` into a subgraph. Return [`TaskloomError::Decomposition`]
    /// when the objective is ambiguous or underspecified.
    async fn decompose(
        &self,
        task: &Task,
        context: &ExecutionContext,
    ) -> TaskloomResult<Decomposition>;
}

/// A decomposition turned into records ready to persist.
#[derive(Debug, Clone)]
pub struct Expansion {
    pub subtasks: Vec<Task>,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<Edge>,
    pub method: String,
}

/// Strategies keyed by name, with a default per task kind.
pub struct DecomposerRegistry {
    strategies: HashMap<String, Arc<dyn Decomposer>>,
    defaults: HashMap<TaskKind, String>,
    cache: Mutex<HashMap<String, Decomposition>>,
}

impl DecomposerRegistry {
    /// Registry with no strategies.
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
            defaults: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the built-in `static`, `fan_out` and `iterate`
    /// strategies. `fan_out` is the default for parallel tasks, `iterate`
    /// for iterative ones and `static` for every other composite kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StaticDecomposer));
        registry.register(Arc::new(FanOutDecomposer));
        registry.register(Arc::new(IterateDecomposer));
        for kind in [
            TaskKind::Composite,
            TaskKind::Sequential,
            TaskKind::Conditional,
        ] {
            registry.set_default(kind, StaticDecomposer::NAME);
        }
        registry.set_default(TaskKind::Parallel, FanOutDecomposer::NAME);
        registry.set_default(TaskKind::Iterative, IterateDecomposer::NAME);
        registry
    }

    /// Add or replace a strategy.
    pub fn register(&mut self, strategy: Arc<dyn Decomposer>) {
        let name = strategy.name().to_string();
        info!(strategy = %name, "Registered decomposition strategy");
        self.strategies.insert(name, strategy);
    }

    /// Use `strategy` for tasks of `kind` that do not name one.
    pub fn set_default(&mut self, kind: TaskKind, strategy: &str) {
        self.defaults.insert(kind, strategy.to_string());
    }

    /// Number of registered strategies.
    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }

    /// Pick the strategy for `task`.
    pub fn resolve(&self, task: &Task) -> TaskloomResult<Arc<dyn Decomposer>> {
        if !task.kind.is_composite() {
            return Err(TaskloomError::Decomposition(format!(
                "task {} is atomic and cannot be decomposed",
                task.id
            )));
        }
        let name = task
            .requirements
            .strategy
            .as_ref()
            .or_else(|| self.defaults.get(&task.kind))
            .ok_or_else(|| {
                TaskloomError::Decomposition(format!(
                    "no decomposition strategy for kind {}",
                    task.kind
                ))
            })?;
        self.strategies.get(name).cloned().ok_or_else(|| {
            TaskloomError::Decomposition(format!("unknown decomposition strategy '{name}'"))
        })
    }

    /// Decompose `task`, returning a memoised result for identical input.
    pub async fn decompose(
        &self,
        task: &Task,
        context: &ExecutionContext,
    ) -> TaskloomResult<Decomposition> {
        let strategy = self.resolve(task)?;
        let key = fingerprint(&json!({
            "strategy": strategy.name(),
            "task": {
                "id": task.id,
                "kind": task.kind,
                "objective": task.objective,
                "requirements": task.requirements,
            },
            "context": fingerprint(context)?,
        }))?;

        if let Some(cached) = self.cache.lock().get(&key).cloned() {
            debug!(task_id = %task.id, "Decomposition replayed from cache");
            return Ok(cached);
        }

        let decomposition = strategy.decompose(task, context).await?;
        self.cache.lock().insert(key, decomposition.clone());
        Ok(decomposition)
    }
}

impl Default for DecomposerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Validate a decomposition against its parent and turn it into task
/// records, graph nodes and edges. Sequence numbers are drawn from
/// `next_sequence` in subtask order.
pub fn materialize(
    parent: &Task,
    decomposition: Decomposition,
    next_sequence: &mut u64,
) -> TaskloomResult<Expansion> {
    if decomposition.subtasks.is_empty() {
        return Err(TaskloomError::Decomposition(format!(
            "decomposition of {} produced no subtasks",
            parent.name
        )));
    }

    let mut ids: HashMap<String, Uuid> = HashMap::new();
    for spec in &decomposition.subtasks {
        if spec.key.is_empty() {
            return Err(TaskloomError::Decomposition(
                "subtask with an empty key".to_string(),
            ));
        }
        if ids
            .insert(
                spec.key.clone(),
                Uuid::new_v5(&parent.id, spec.key.as_bytes()),
            )
            .is_some()
        {
            return Err(TaskloomError::Decomposition(format!(
                "duplicate subtask key '{}'",
                spec.key
            )));
        }
    }

    let parent_ref = parent.id.to_string();
    let mut edges = Vec::new();
    for spec in &decomposition.edges {
        let is_parent = |end: &str| end == parent_ref || end == parent.name;
        if is_parent(&spec.source) || is_parent(&spec.target) {
            // Edges to or from the parent are implied by containment.
            continue;
        }
        let resolve = |end: &str| {
            ids.get(end).copied().ok_or_else(|| {
                TaskloomError::InvalidGraph(format!(
                    "edge {} -> {} references '{end}' outside the decomposition",
                    spec.source, spec.target
                ))
            })
        };
        edges.push(Edge {
            source: resolve(&spec.source)?,
            target: resolve(&spec.target)?,
            kind: spec.kind,
            strength: spec.strength,
            condition: spec.condition.clone(),
        });
    }

    let mut subtasks = Vec::with_capacity(decomposition.subtasks.len());
    let mut nodes = Vec::with_capacity(decomposition.subtasks.len());
    for spec in decomposition.subtasks {
        let id = ids[&spec.key];
        let dependencies = edges
            .iter()
            .filter(|e| e.target == id)
            .map(|e| Dependency {
                task_id: e.source,
                kind: e.strength,
                condition: e
                    .condition
                    .clone()
                    .map_or(DependencyCondition::Completion, DependencyCondition::Result),
            })
            .collect();

        let mut task = Task::new(spec.key.clone(), spec.kind)
            .with_id(id)
            .with_parent(parent)
            .with_dependencies(dependencies)
            .with_priority(spec.priority);
        task.objective = spec.objective;
        task.requirements = spec.requirements;
        task.constraints = spec.constraints;
        task.optional = spec.optional;
        task.sequence = *next_sequence;
        *next_sequence += 1;

        nodes.push(GraphNode {
            id,
            name: spec.key,
            node_type: spec.node_type,
            status: task.status,
            estimated_duration_ms: task.requirements.estimated_duration_ms,
        });
        subtasks.push(task);
    }

    let mut check = TaskGraph::new(parent.root_id);
    for node in &nodes {
        check.add_node(node.clone());
    }
    for edge in &edges {
        check.add_edge(edge.clone());
    }
    check.validate()?;

    Ok(Expansion {
        subtasks,
        nodes,
        edges,
        method: decomposition.method,
    })
}

#[derive(Debug, Deserialize)]
struct StaticPlan {
    #[serde(default)]
    subtasks: Vec<SubtaskSpec>,
    #[serde(default)]
    edges: Option<Vec<EdgeSpec>>,
}

/// Reads the plan embedded in the task objective:
/// `{"subtasks": [...], "edges": [...]}`. For sequential tasks without
/// explicit edges, consecutive subtasks are chained with sequence edges.
pub struct StaticDecomposer;

impl StaticDecomposer {
    /// Registry key.
    pub const NAME: &'static str = "static";
}

#[async_trait]
impl Decomposer for StaticDecomposer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn decompose(
        &self,
        task: &Task,
        _context: &ExecutionContext,
    ) -> TaskloomResult<Decomposition> {
        let plan: StaticPlan = serde_json::from_value(task.objective.clone()).map_err(|e| {
            TaskloomError::Decomposition(format!("objective of {} is not a plan: {e}", task.name))
        })?;
        if plan.subtasks.is_empty() {
            return Err(TaskloomError::Decomposition(format!(
                "objective of {} lists no subtasks",
                task.name
            )));
        }
        let edges = match plan.edges {
            Some(edges) => edges,
            None if task.kind == TaskKind::Sequential => chain(&plan.subtasks),
            None => Vec::new(),
        };
        Ok(Decomposition {
            subtasks: plan.subtasks,
            edges,
            method: Self::NAME.to_string(),
        })
    }
}

/// One independent subtask per entry of `objective.items`, each built from
/// `objective.template` with the item under `"item"`. An objective without
/// `items` but with an explicit `subtasks` list is read as a static plan.
pub struct FanOutDecomposer;

impl FanOutDecomposer {
    /// Registry key.
    pub const NAME: &'static str = "fan_out";
}

#[async_trait]
impl Decomposer for FanOutDecomposer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn decompose(
        &self,
        task: &Task,
        context: &ExecutionContext,
    ) -> TaskloomResult<Decomposition> {
        if task.objective.get("items").is_none() && task.objective.get("subtasks").is_some() {
            return StaticDecomposer.decompose(task, context).await;
        }
        let items = task
            .objective
            .get("items")
            .and_then(Value::as_array)
            .filter(|items| !items.is_empty())
            .ok_or_else(|| {
                TaskloomError::Decomposition(format!(
                    "fan_out objective of {} needs a non-empty 'items' array",
                    task.name
                ))
            })?;
        let template = template_of(task)?;
        let subtasks = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                instantiate(&template, format!("item-{i}"), &[("item", item.clone())])
            })
            .collect();
        Ok(Decomposition {
            subtasks,
            edges: Vec::new(),
            method: Self::NAME.to_string(),
        })
    }
}

/// A chain of iterations: `objective.iterations` copies of the template
/// (or one per entry of `objective.items`), each after the previous one.
pub struct IterateDecomposer;

impl IterateDecomposer {
    /// Registry key.
    pub const NAME: &'static str = "iterate";
}

#[async_trait]
impl Decomposer for IterateDecomposer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn decompose(
        &self,
        task: &Task,
        _context: &ExecutionContext,
    ) -> TaskloomResult<Decomposition> {
        let template = template_of(task)?;
        let items: Vec<Value> = match (
            task.objective.get("items").and_then(Value::as_array),
            task.objective.get("iterations").and_then(Value::as_u64),
        ) {
            (Some(items), _) => items.clone(),
            (None, Some(n)) => (0..n).map(|_| Value::Null).collect(),
            (None, None) => Vec::new(),
        };
        if items.is_empty() {
            return Err(TaskloomError::Decomposition(format!(
                "iterate objective of {} needs 'iterations' > 0 or non-empty 'items'",
                task.name
            )));
        }
        let subtasks: Vec<SubtaskSpec> = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                instantiate(
                    &template,
                    format!("iteration-{i}"),
                    &[("iteration", json!(i)), ("item", item)],
                )
            })
            .collect();
        let mut edges = chain(&subtasks);
        for edge in &mut edges {
            edge.kind = EdgeKind::DataFlow;
        }
        Ok(Decomposition {
            subtasks,
            edges,
            method: Self::NAME.to_string(),
        })
    }
}

fn template_of(task: &Task) -> TaskloomResult<SubtaskSpec> {
    match task.objective.get("template") {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            TaskloomError::Decomposition(format!("invalid template in {}: {e}", task.name))
        }),
        None => Ok(SubtaskSpec {
            requirements: Requirements {
                capabilities: task.requirements.capabilities.clone(),
                resource_class: task.requirements.resource_class,
                ..Default::default()
            },
            ..Default::default()
        }),
    }
}

fn instantiate(template: &SubtaskSpec, key: String, fields: &[(&str, Value)]) -> SubtaskSpec {
    let mut spec = template.clone();
    spec.key = key;
    let mut objective = match &template.objective {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("template".to_string(), other.clone());
            map
        }
    };
    for (name, value) in fields {
        objective.insert((*name).to_string(), value.clone());
    }
    spec.objective = Value::Object(objective);
    spec
}

fn chain(subtasks: &[SubtaskSpec]) -> Vec<EdgeSpec> {
    subtasks
        .windows(2)
        .map(|pair| {
            let mut edge = EdgeSpec::new(pair[0].key.clone(), pair[1].key.clone());
            edge.kind = EdgeKind::Sequence;
            edge
        })
        .collect()
}
