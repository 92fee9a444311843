mod validate;

use crate::{
    error::BuildError,
    semaphore::{Semaphore, SemaphoreMode},
    task::{Subflow, TaskKind, TaskView, Work},
    topology::Topology,
    types::{JoinCounter, NodeId, Priority},
};
use core::sync::atomic::{AtomicBool, Ordering};
use derive_more::Debug;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{Arc, OnceLock},
};
pub(crate) use validate::Plan;

/// An owned, insertion-ordered arena of nodes and the edges between them.
///
/// A graph is built with `&mut` access and then shared with the executor as
/// an `Arc<Graph>`; it can be run any number of times. Runs of the same graph
/// never overlap: a run submitted while another one is in progress is queued
/// behind it.
///
/// ```text
///   A ──► B ──► D        strong edges: D waits for both B and C
///    └──► C ──┘
/// ```
#[must_use]
#[derive(Debug)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    #[debug(skip)]
    plan: OnceLock<Result<Plan, BuildError>>,
    /// Runs of this graph, the executing one first.
    #[debug(skip)]
    pub(crate) runs: Mutex<VecDeque<Arc<Topology>>>,
    /// Set while the nodes are owned by an executing run or module task.
    #[debug(skip)]
    in_use: AtomicBool,
}

#[must_use]
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) kind: TaskKind,
    pub(crate) priority: Priority,
    #[debug(skip)]
    pub(crate) work: Mutex<Work>,
    /// Successors released when this node completes. Empty for conditions.
    pub(crate) strong_dependents: Vec<NodeId>,
    /// Successors a condition selects from by index. Empty for other kinds.
    pub(crate) weak_dependents: Vec<NodeId>,
    pub(crate) num_strong_preds: usize,
    pub(crate) num_weak_preds: usize,
    /// Strong predecessors that haven't completed in the current pass.
    #[debug(skip)]
    pub(crate) join_counter: JoinCounter,
    pub(crate) acquires: Vec<Semaphore>,
    pub(crate) releases: Vec<Semaphore>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            plan: OnceLock::new(),
            runs: Mutex::new(VecDeque::new()),
            in_use: AtomicBool::new(false),
        }
    }

    /// Name of the graph.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Handles of all nodes, in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + use<> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Add a node carrying `work`. It is named after its handle until
    /// [`set_name`](Self::set_name) is called.
    pub fn add_node(&mut self, work: Work) -> NodeId {
        self.plan.take();
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: id.to_string(),
            kind: work.kind(),
            priority: Priority::default(),
            work: Mutex::new(work),
            strong_dependents: Vec::new(),
            weak_dependents: Vec::new(),
            num_strong_preds: 0,
            num_weak_preds: 0,
            join_counter: JoinCounter::new(0),
            acquires: Vec::new(),
            releases: Vec::new(),
        });
        id
    }

    /// Add a static task.
    pub fn emplace(&mut self, work: impl FnMut() + Send + 'static) -> NodeId {
        self.add_node(Work::Static(Box::new(work)))
    }

    /// Add a condition task; its return value selects one successor by the
    /// order in which the edges were added.
    pub fn emplace_condition(&mut self, work: impl FnMut() -> usize + Send + 'static) -> NodeId {
        self.add_node(Work::Condition(Box::new(work)))
    }

    /// Add a subflow task.
    pub fn emplace_subflow(&mut self, work: impl FnMut(&mut Subflow) + Send + 'static) -> NodeId {
        self.add_node(Work::Subflow(Box::new(work)))
    }

    /// Add a module task running `graph` to completion each time it runs.
    pub fn emplace_module(&mut self, graph: Arc<Graph>) -> NodeId {
        self.add_node(Work::Module(graph))
    }

    /// Rename a node.
    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) {
        self.node_mut(id).name = name.into();
    }

    /// Name of a node.
    #[must_use]
    pub fn task_name(&self, id: NodeId) -> &str {
        &self.node(id).name
    }

    /// Kind of work a node carries.
    #[must_use]
    pub fn kind(&self, id: NodeId) -> TaskKind {
        self.node(id).kind
    }

    /// Set the scheduling priority of a node.
    pub fn set_priority(&mut self, id: NodeId, priority: Priority) {
        self.node_mut(id).priority = priority;
    }

    /// Scheduling priority of a node.
    #[must_use]
    pub fn priority(&self, id: NodeId) -> Priority {
        self.node(id).priority
    }

    /// Make `from` run before `to`.
    ///
    /// Edges leaving a condition task are weak and may close loops; all
    /// other edges are strong and must keep the graph acyclic, which
    /// [`validate`](Self::validate) checks.
    ///
    /// # Errors
    /// [`BuildError::SelfLoop`] for a strong edge from a node to itself.
    pub fn precede(&mut self, from: NodeId, to: NodeId) -> Result<(), BuildError> {
        self.check(to);
        let source = self.node(from);
        let weak = source.kind == TaskKind::Condition;
        if !weak && from == to {
            return Err(BuildError::SelfLoop {
                task: source.name.clone(),
            });
        }
        self.plan.take();
        let source = self.node_mut(from);
        if weak {
            source.weak_dependents.push(to);
            self.node_mut(to).num_weak_preds += 1;
        } else {
            source.strong_dependents.push(to);
            self.node_mut(to).num_strong_preds += 1;
        }
        Ok(())
    }

    /// Make `from` run before each of `to`, in order.
    ///
    /// # Errors
    /// See [`precede`](Self::precede).
    pub fn precede_all(&mut self, from: NodeId, to: &[NodeId]) -> Result<(), BuildError> {
        to.iter().try_for_each(|&to| self.precede(from, to))
    }

    /// Make `to` run after `from`.
    ///
    /// # Errors
    /// See [`precede`](Self::precede).
    pub fn succeed(&mut self, to: NodeId, from: NodeId) -> Result<(), BuildError> {
        self.precede(from, to)
    }

    /// Successors released when `id` completes.
    #[must_use]
    pub fn strong_dependents(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).strong_dependents
    }

    /// Successors the condition `id` selects from.
    #[must_use]
    pub fn weak_dependents(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).weak_dependents
    }

    /// Bound the node by `semaphore`: with [`SemaphoreMode::Acquire`] it takes
    /// a permit before its work runs, with [`SemaphoreMode::Release`] it
    /// returns one after.
    pub fn add_semaphore(&mut self, id: NodeId, semaphore: &Semaphore, mode: SemaphoreMode) {
        let node = self.node_mut(id);
        if mode.acquires() {
            node.acquires.push(semaphore.clone());
        }
        if mode.releases() {
            node.releases.push(semaphore.clone());
        }
    }

    /// Check the graph for cycles of strong edges.
    ///
    /// The result is cached until the graph is modified. Every run validates
    /// its graph before it is scheduled.
    ///
    /// # Errors
    /// [`BuildError::Cycle`] naming a task on the cycle.
    pub fn validate(&self) -> Result<(), BuildError> {
        self.plan().map(|_| ())
    }

    pub(crate) fn plan(&self) -> Result<&Plan, BuildError> {
        self.plan
            .get_or_init(|| self.compute_plan())
            .as_ref()
            .map_err(Clone::clone)
    }

    fn check(&self, id: NodeId) {
        assert!(
            id.0 < self.nodes.len(),
            "Node {id} does not belong to graph `{}`",
            self.name
        );
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        self.check(id);
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.check(id);
        &mut self.nodes[id.0]
    }

    /// Reset every join counter for a new pass.
    pub(crate) fn arm(&self) {
        for node in &self.nodes {
            node.join_counter.arm(node.num_strong_preds);
        }
    }

    /// Take exclusive ownership of the nodes for one run.
    pub(crate) fn try_enter(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn leave(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    pub(crate) fn view(&self, id: NodeId) -> TaskView<'_> {
        let node = self.node(id);
        TaskView {
            id,
            name: &node.name,
            graph: &self.name,
            kind: node.kind,
            priority: node.priority,
        }
    }
}

impl From<Subflow> for Graph {
    fn from(subflow: Subflow) -> Self {
        subflow.into_parts().0
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn edges_from_conditions_are_weak() {
        let mut graph = Graph::new("g");
        let a = graph.emplace(|| {});
        let cond = graph.emplace_condition(|| 0);
        let b = graph.emplace(|| {});
        graph.precede(a, cond).unwrap();
        graph.precede_all(cond, &[a, b]).unwrap();

        assert_eq!(graph.strong_dependents(a), &[cond]);
        assert!(graph.strong_dependents(cond).is_empty());
        assert_eq!(graph.weak_dependents(cond), &[a, b]);
        assert_eq!(graph.node(a).num_weak_preds, 1);
        assert_eq!(graph.node(cond).num_strong_preds, 1);
    }

    #[test]
    fn strong_self_loop_is_rejected_eagerly() {
        let mut graph = Graph::new("g");
        let a = graph.emplace(|| {});
        graph.set_name(a, "a");
        assert_eq!(
            graph.precede(a, a),
            Err(BuildError::SelfLoop { task: "a".into() })
        );

        let cond = graph.emplace_condition(|| 0);
        assert_eq!(graph.precede(cond, cond), Ok(()));
    }

    #[test]
    fn semaphore_modes_attach_to_the_right_lists() {
        let mut graph = Graph::new("g");
        let a = graph.emplace(|| {});
        let b = graph.emplace(|| {});
        let semaphore = Semaphore::new(1).unwrap();
        graph.add_semaphore(a, &semaphore, SemaphoreMode::Both);
        graph.add_semaphore(b, &semaphore, SemaphoreMode::Release);

        assert_eq!(graph.node(a).acquires.len(), 1);
        assert_eq!(graph.node(a).releases.len(), 1);
        assert!(graph.node(b).acquires.is_empty());
        assert_eq!(graph.node(b).releases.len(), 1);
    }

    #[test]
    #[should_panic(expected = "does not belong to graph")]
    fn foreign_handle_panics() {
        let mut other = Graph::new("other");
        other.emplace(|| {});
        let foreign = other.emplace(|| {});
        let mut graph = Graph::new("g");
        graph.set_priority(foreign, Priority::High);
    }
}
