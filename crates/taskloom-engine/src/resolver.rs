//! Incremental ready-set computation for one task graph.
//!
//! Each node keeps a count of unresolved hard incoming edges. Building the
//! resolver is O(V+E); every completion, failure or cancellation touches only
//! the outgoing edges of the node that changed, so the engine can afford to
//! run it after every task completion.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};
use taskloom_core::{Edge, NodeType, OrderingStrategy, TaskId, TaskResult};

/// Why a node can never become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCause {
    /// A hard prerequisite failed.
    PrerequisiteFailed,
    /// A hard prerequisite was cancelled.
    PrerequisiteCancelled,
    /// A conditional edge evaluated false: the branch was not taken.
    ConditionNotMet,
}

/// A readiness change produced by a resolver update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The node entered the ready set.
    Ready(TaskId),
    /// The node can never run. `origin` is the node where the chain started.
    Blocked {
        task_id: TaskId,
        origin: TaskId,
        cause: BlockCause,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Ready,
    Dispatched,
    Done,
}

/// Deterministic ordering of ready nodes: priority (high first), then the
/// ordering strategy's depth rank, then fewer unsatisfied soft
/// prerequisites, then creation order, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: Reverse<i32>,
    depth_rank: Reverse<u32>,
    pending_soft: usize,
    sequence: u64,
    id: TaskId,
}

#[derive(Debug, Clone)]
struct NodeState {
    node_type: NodeType,
    priority: i32,
    depth: u32,
    sequence: u64,
    pending_hard: usize,
    satisfied_hard: usize,
    pending_soft: usize,
    phase: Phase,
}

/// Ordering inputs for a node, taken from its task record.
#[derive(Debug, Clone, Copy)]
pub struct NodeInfo {
    pub id: TaskId,
    pub node_type: NodeType,
    pub priority: i32,
    pub depth: u32,
    pub sequence: u64,
}

/// Incrementally maintained ready set.
#[derive(Debug)]
pub struct Resolver {
    ordering: OrderingStrategy,
    nodes: HashMap<TaskId, NodeState>,
    outgoing: HashMap<TaskId, Vec<Edge>>,
    ready: BTreeSet<ReadyKey>,
}

impl Resolver {
    /// Empty resolver.
    pub fn new(ordering: OrderingStrategy) -> Self {
        Self {
            ordering,
            nodes: HashMap::new(),
            outgoing: HashMap::new(),
            ready: BTreeSet::new(),
        }
    }

    /// Add nodes and the edges among them (or from already known nodes),
    /// then report which of the new nodes are immediately ready.
    ///
    /// Edges whose source is already done are resolved on insertion using
    /// `done_results` (completed sources); missing entries count as dead.
    pub fn insert(
        &mut self,
        nodes: &[NodeInfo],
        edges: &[Edge],
        done_results: &HashMap<TaskId, TaskResult>,
    ) -> Vec<Resolution> {
        for info in nodes {
            self.nodes.insert(
                info.id,
                NodeState {
                    node_type: info.node_type,
                    priority: info.priority,
                    depth: info.depth,
                    sequence: info.sequence,
                    pending_hard: 0,
                    satisfied_hard: 0,
                    pending_soft: 0,
                    phase: Phase::Waiting,
                },
            );
        }

        let mut dead_edges = Vec::new();
        for edge in edges {
            let source_done = self
                .nodes
                .get(&edge.source)
                .is_some_and(|s| s.phase == Phase::Done);
            if let Some(target) = self.nodes.get_mut(&edge.target) {
                if source_done {
                    if edge.is_hard() {
                        match done_results.get(&edge.source) {
                            Some(result) if edge_satisfied(edge, result) => {
                                target.satisfied_hard += 1;
                            }
                            Some(_) => dead_edges.push((edge.clone(), BlockCause::ConditionNotMet)),
                            None => {
                                dead_edges.push((edge.clone(), BlockCause::PrerequisiteFailed));
                            }
                        }
                    }
                } else if edge.is_hard() {
                    target.pending_hard += 1;
                } else {
                    target.pending_soft += 1;
                }
            }
            if !source_done {
                self.outgoing
                    .entry(edge.source)
                    .or_default()
                    .push(edge.clone());
            }
        }

        let mut changes = Vec::new();
        for (edge, cause) in dead_edges {
            self.kill_edge(&edge, edge.source, cause, &mut changes);
        }
        for info in nodes {
            self.promote(info.id, &mut changes);
        }
        changes
    }

    /// Ready nodes in dispatch order.
    pub fn ready(&self) -> Vec<TaskId> {
        self.ready.iter().map(|k| k.id).collect()
    }

    /// Remove `id` from the ready set once it has been dispatched.
    pub fn mark_dispatched(&mut self, id: TaskId) {
        if let Some(key) = self.key_of(id) {
            self.ready.remove(&key);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.phase != Phase::Done {
                node.phase = Phase::Dispatched;
            }
        }
    }

    /// `id` completed with `result`: resolve its outgoing edges.
    pub fn complete(&mut self, id: TaskId, result: &TaskResult) -> Vec<Resolution> {
        let mut changes = Vec::new();
        if !self.finish(id) {
            return changes;
        }
        for edge in self.outgoing.remove(&id).unwrap_or_default() {
            if !edge.is_hard() {
                self.soft_resolved(edge.target);
                continue;
            }
            if edge_satisfied(&edge, result) {
                if let Some(target) = self.nodes.get_mut(&edge.target) {
                    target.pending_hard = target.pending_hard.saturating_sub(1);
                    target.satisfied_hard += 1;
                }
                self.promote(edge.target, &mut changes);
            } else {
                self.kill_edge(&edge, id, BlockCause::ConditionNotMet, &mut changes);
            }
        }
        changes
    }

    /// `id` failed terminally: every node that hard-depends on it (directly
    /// or transitively) is blocked.
    pub fn fail(&mut self, id: TaskId) -> Vec<Resolution> {
        self.terminate(id, BlockCause::PrerequisiteFailed)
    }

    /// `id` was cancelled: dependents are blocked the same way.
    pub fn cancel(&mut self, id: TaskId) -> Vec<Resolution> {
        self.terminate(id, BlockCause::PrerequisiteCancelled)
    }

    fn terminate(&mut self, id: TaskId, cause: BlockCause) -> Vec<Resolution> {
        let mut changes = Vec::new();
        if !self.finish(id) {
            return changes;
        }
        for edge in self.outgoing.remove(&id).unwrap_or_default() {
            if edge.is_hard() {
                self.kill_edge(&edge, id, cause, &mut changes);
            } else {
                self.soft_resolved(edge.target);
            }
        }
        changes
    }

    /// Mark done; false when already done or unknown.
    fn finish(&mut self, id: TaskId) -> bool {
        let key = self.key_of(id);
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        if node.phase == Phase::Done {
            return false;
        }
        node.phase = Phase::Done;
        if let Some(key) = key {
            self.ready.remove(&key);
        }
        true
    }

    /// A hard edge can never be satisfied. Merge nodes tolerate dead inputs
    /// as long as one input is satisfied; every other node is blocked and the
    /// block cascades breadth-first.
    fn kill_edge(
        &mut self,
        edge: &Edge,
        origin: TaskId,
        cause: BlockCause,
        changes: &mut Vec<Resolution>,
    ) {
        let mut queue = VecDeque::from([(edge.target, origin, cause)]);
        while let Some((target, origin, cause)) = queue.pop_front() {
            let Some(node) = self.nodes.get_mut(&target) else {
                continue;
            };
            if matches!(node.phase, Phase::Done | Phase::Dispatched) {
                continue;
            }
            node.pending_hard = node.pending_hard.saturating_sub(1);
            if node.node_type == NodeType::Merge
                && (node.pending_hard > 0 || node.satisfied_hard > 0)
            {
                self.promote(target, changes);
                continue;
            }
            self.finish(target);
            changes.push(Resolution::Blocked {
                task_id: target,
                origin,
                cause,
            });
            for next in self.outgoing.remove(&target).unwrap_or_default() {
                if next.is_hard() {
                    queue.push_back((next.target, origin, cause));
                } else {
                    self.soft_resolved(next.target);
                }
            }
        }
    }

    fn soft_resolved(&mut self, id: TaskId) {
        let key = self.key_of(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.pending_soft = node.pending_soft.saturating_sub(1);
        }
        if let Some(old) = key {
            self.ready.remove(&old);
            if let Some(new) = self.key_of(id) {
                self.ready.insert(new);
            }
        }
    }

    fn promote(&mut self, id: TaskId, changes: &mut Vec<Resolution>) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let eligible = node.phase == Phase::Waiting
            && node.pending_hard == 0
            && (node.node_type != NodeType::Merge || node.satisfied_hard > 0);
        if eligible {
            node.phase = Phase::Ready;
            if let Some(key) = self.key_of(id) {
                self.ready.insert(key);
            }
            changes.push(Resolution::Ready(id));
        }
    }

    fn key_of(&self, id: TaskId) -> Option<ReadyKey> {
        let node = self.nodes.get(&id)?;
        if node.phase != Phase::Ready {
            return None;
        }
        let depth_rank = match self.ordering {
            OrderingStrategy::PriorityFirst => 0,
            OrderingStrategy::DepthFirst => node.depth,
        };
        Some(ReadyKey {
            priority: Reverse(node.priority),
            depth_rank: Reverse(depth_rank),
            pending_soft: node.pending_soft,
            sequence: node.sequence,
            id,
        })
    }
}

fn edge_satisfied(edge: &Edge, result: &TaskResult) -> bool {
    edge.condition
        .as_ref()
        .map_or(true, |condition| condition.evaluate(result))
}
