//! Task graph model and the graph algorithms the engine relies on:
//! validation, topological order, critical path and completion ratio.

use crate::condition::Condition;
use crate::error::{TaskloomError, TaskloomResult};
use crate::task::{DependencyKind, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Role of a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Dispatched to an executor (or decomposed, for composite tasks).
    #[default]
    Task,
    /// Control node whose result feeds the conditions of its outgoing edges.
    Decision,
    /// Control node that joins branches; needs at least one satisfied input.
    Merge,
}

impl NodeType {
    /// Decision and merge nodes complete inside the engine.
    pub fn is_control(&self) -> bool {
        !matches!(self, NodeType::Task)
    }
}

/// Relationship expressed by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Target runs after source.
    Sequence,
    /// Target needs source to have completed.
    #[default]
    Dependency,
    /// Target consumes source's result.
    DataFlow,
}

/// A node of a [`TaskGraph`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub node_type: NodeType,
    pub status: TaskStatus,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
}

/// A directed edge `source -> target`: target depends on source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: TaskId,
    pub target: TaskId,
    #[serde(default)]
    pub kind: EdgeKind,
    /// Soft edges never block readiness.
    #[serde(default)]
    pub strength: DependencyKind,
    /// Evaluated against the source's result.
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl Edge {
    /// A hard, unconditional edge.
    pub fn new(source: TaskId, target: TaskId, kind: EdgeKind) -> Self {
        Self {
            source,
            target,
            kind,
            strength: DependencyKind::Hard,
            condition: None,
        }
    }

    /// Whether this edge blocks the target's readiness.
    pub fn is_hard(&self) -> bool {
        self.strength == DependencyKind::Hard
    }
}

/// The DAG of tasks belonging to one root task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub root_id: TaskId,
    pub nodes: BTreeMap<TaskId, GraphNode>,
    pub edges: Vec<Edge>,
}

impl TaskGraph {
    /// Empty graph for `root_id`.
    pub fn new(root_id: TaskId) -> Self {
        Self {
            root_id,
            nodes: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    /// Insert or replace a node.
    pub fn add_node(&mut self, node: GraphNode) {
        self.nodes.insert(node.id, node);
    }

    /// Append an edge. Call [`TaskGraph::validate`] before persisting.
    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    /// Mirror a task's status onto its node.
    pub fn set_status(&mut self, id: TaskId, status: TaskStatus) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.status = status;
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Edges pointing at `id`.
    pub fn incoming(&self, id: TaskId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.target == id)
    }

    /// Edges leaving `id`.
    pub fn outgoing(&self, id: TaskId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// Check that every edge references known nodes and that the graph is acyclic.
    pub fn validate(&self) -> TaskloomResult<()> {
        for edge in &self.edges {
            if edge.source == edge.target {
                return Err(TaskloomError::CyclicGraph(format!(
                    "self-loop on {}",
                    edge.source
                )));
            }
            for end in [edge.source, edge.target] {
                if !self.nodes.contains_key(&end) {
                    return Err(TaskloomError::InvalidGraph(format!(
                        "edge {} -> {} references unknown node {}",
                        edge.source, edge.target, end
                    )));
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Kahn's algorithm over all edges (soft ones included: a soft cycle is
    /// still a cycle). Ties are broken by node id so the order is stable.
    pub fn topological_order(&self) -> TaskloomResult<Vec<TaskId>> {
        let mut in_degree: HashMap<TaskId, usize> = self.nodes.keys().map(|id| (*id, 0)).collect();
        let mut adjacency: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for edge in &self.edges {
            *in_degree.entry(edge.target).or_insert(0) += 1;
            adjacency.entry(edge.source).or_default().push(edge.target);
        }

        let mut queue: VecDeque<TaskId> = self
            .nodes
            .keys()
            .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
            .copied()
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(targets) = adjacency.get(&id) {
                for target in targets {
                    if let Some(degree) = in_degree.get_mut(target) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*target);
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<String> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| {
                    self.nodes
                        .get(id)
                        .map_or_else(|| id.to_string(), |n| n.name.clone())
                })
                .collect();
            return Err(TaskloomError::CyclicGraph(format!(
                "cycle among: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Longest chain of hard dependencies by estimated duration. Nodes without
    /// an estimate weigh 1 ms so unestimated chains still compare by length.
    pub fn critical_path(&self) -> TaskloomResult<(Vec<TaskId>, u64)> {
        let order = self.topological_order()?;
        let weight = |id: &TaskId| -> u64 {
            self.nodes
                .get(id)
                .and_then(|n| n.estimated_duration_ms)
                .unwrap_or(1)
        };

        let mut best: HashMap<TaskId, (u64, Option<TaskId>)> = HashMap::new();
        for id in &order {
            let through = self
                .incoming(*id)
                .filter(|e| e.is_hard())
                .filter_map(|e| best.get(&e.source).map(|(len, _)| (*len, e.source)))
                .max_by_key(|(len, _)| *len);
            let entry = match through {
                Some((len, prev)) => (len + weight(id), Some(prev)),
                None => (weight(id), None),
            };
            best.insert(*id, entry);
        }

        let Some((mut cursor, total)) = order
            .iter()
            .filter_map(|id| best.get(id).map(|(len, _)| (*id, *len)))
            .max_by_key(|(_, len)| *len)
        else {
            return Ok((Vec::new(), 0));
        };

        let mut path = vec![cursor];
        while let Some((_, Some(prev))) = best.get(&cursor) {
            path.push(*prev);
            cursor = *prev;
        }
        path.reverse();
        Ok((path, total))
    }

    /// Fraction of nodes in a terminal state.
    pub fn completion_ratio(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        let done = self
            .nodes
            .values()
            .filter(|n| n.status.is_terminal())
            .count();
        done as f64 / self.nodes.len() as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use uuid::Uuid;

    fn node(name: &str, ms: Option<u64>) -> GraphNode {
        GraphNode {
            id: Uuid::new_v4(),
            name: name.to_string(),
            node_type: NodeType::Task,
            status: TaskStatus::Planned,
            estimated_duration_ms: ms,
        }
    }

    fn diamond() -> (TaskGraph, [TaskId; 4]) {
        let mut graph = TaskGraph::new(Uuid::new_v4());
        let a = node("a", Some(10));
        let b = node("b", Some(50));
        let c = node("c", Some(20));
        let d = node("d", Some(5));
        let ids = [a.id, b.id, c.id, d.id];
        for n in [a, b, c, d] {
            graph.add_node(n);
        }
        graph.add_edge(Edge::new(ids[0], ids[1], EdgeKind::Dependency));
        graph.add_edge(Edge::new(ids[0], ids[2], EdgeKind::Dependency));
        graph.add_edge(Edge::new(ids[1], ids[3], EdgeKind::DataFlow));
        graph.add_edge(Edge::new(ids[2], ids[3], EdgeKind::DataFlow));
        (graph, ids)
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let (graph, ids) = diamond();
        let order = graph.topological_order().unwrap();
        let pos = |id: TaskId| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(ids[0]) < pos(ids[1]));
        assert!(pos(ids[0]) < pos(ids[2]));
        assert!(pos(ids[1]) < pos(ids[3]));
        assert!(pos(ids[2]) < pos(ids[3]));
    }

    #[test]
    fn test_cycle_rejected() {
        let (mut graph, ids) = diamond();
        graph.add_edge(Edge::new(ids[3], ids[0], EdgeKind::Sequence));
        let err = graph.validate().unwrap_err();
        assert!(matches!(err, TaskloomError::CyclicGraph(_)));
    }

    #[test]
    fn test_self_loop_rejected() {
        let (mut graph, ids) = diamond();
        graph.add_edge(Edge::new(ids[1], ids[1], EdgeKind::Sequence));
        assert!(matches!(
            graph.validate(),
            Err(TaskloomError::CyclicGraph(_))
        ));
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let (mut graph, ids) = diamond();
        graph.add_edge(Edge::new(ids[0], Uuid::new_v4(), EdgeKind::Dependency));
        assert!(matches!(
            graph.validate(),
            Err(TaskloomError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_critical_path() {
        let (graph, ids) = diamond();
        let (path, total) = graph.critical_path().unwrap();
        assert_eq!(path, vec![ids[0], ids[1], ids[3]]);
        assert_eq!(total, 65);
    }

    #[test]
    fn test_critical_path_ignores_soft_edges() {
        let (mut graph, ids) = diamond();
        let long = node("long", Some(500));
        let long_id = long.id;
        graph.add_node(long);
        let mut soft = Edge::new(long_id, ids[3], EdgeKind::Sequence);
        soft.strength = DependencyKind::Soft;
        graph.add_edge(soft);
        let (path, total) = graph.critical_path().unwrap();
        assert_eq!(path, vec![long_id]);
        assert_eq!(total, 500);
    }

    #[test]
    fn test_completion_ratio() {
        let (mut graph, ids) = diamond();
        assert_eq!(graph.completion_ratio(), 0.0);
        graph.set_status(ids[0], TaskStatus::Completed);
        graph.set_status(ids[1], TaskStatus::Failed);
        assert!((graph.completion_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_random_forward_graphs_are_acyclic() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let n = rng.gen_range(1..30);
            let mut graph = TaskGraph::new(Uuid::new_v4());
            let nodes: Vec<GraphNode> = (0..n).map(|i| node(&format!("n{i}"), None)).collect();
            let ids: Vec<TaskId> = nodes.iter().map(|n| n.id).collect();
            for n in nodes {
                graph.add_node(n);
            }
            for i in 0..n {
                for j in (i + 1)..n {
                    if rng.gen_bool(0.2) {
                        graph.add_edge(Edge::new(ids[i], ids[j], EdgeKind::Dependency));
                    }
                }
            }
            let order = graph.topological_order().unwrap();
            assert_eq!(order.len(), n);
            for edge in &graph.edges {
                let s = order.iter().position(|x| *x == edge.source).unwrap();
                let t = order.iter().position(|x| *x == edge.target).unwrap();
                assert!(s < t);
            }
        }
    }
}
