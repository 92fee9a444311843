use crate::{
    graph::Graph,
    types::{NodeId, Priority},
};
use core::fmt;
use derive_more::{Deref, DerefMut, Display};
use std::sync::Arc;

/// The unit of work carried by a node.
///
/// The set of kinds is closed; the executor dispatches on the variant.
pub enum Work {
    /// Runs to completion, then releases every successor.
    Static(Box<dyn FnMut() + Send>),
    /// Returns the index of the single successor to release.
    ///
    /// All outgoing edges of a condition task are weak: they may point back
    /// to an ancestor and close a loop. An out-of-range index releases
    /// nothing.
    Condition(Box<dyn FnMut() -> usize + Send>),
    /// Builds a nested graph that is run before the node completes.
    Subflow(Box<dyn FnMut(&mut Subflow) + Send>),
    /// Runs another graph to completion as a nested run.
    Module(Arc<Graph>),
}

impl Work {
    /// The kind of this work.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Static(_) => TaskKind::Static,
            Self::Condition(_) => TaskKind::Condition,
            Self::Subflow(_) => TaskKind::Subflow,
            Self::Module(_) => TaskKind::Module,
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module(graph) => f.debug_tuple("Module").field(&graph.name()).finish(),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Discriminant of [`Work`].
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// See [`Work::Static`].
    #[display("static")]
    Static,
    /// See [`Work::Condition`].
    #[display("condition")]
    Condition,
    /// See [`Work::Subflow`].
    #[display("subflow")]
    Subflow,
    /// See [`Work::Module`].
    #[display("module")]
    Module,
}

/// Control handle passed to a subflow task.
///
/// Dereferences to the nested [`Graph`], so nodes and edges are added with
/// the usual builder methods. By default the nested graph is joined: the
/// subflow node completes only after every nested node finished.
#[derive(Debug, Deref, DerefMut)]
pub struct Subflow {
    #[deref]
    #[deref_mut]
    graph: Graph,
    detached: bool,
}

impl Subflow {
    pub(crate) fn new(name: String) -> Self {
        Self {
            graph: Graph::new(name),
            detached: false,
        }
    }

    /// Let the subflow node complete without waiting for the nested graph.
    ///
    /// The nested graph still belongs to the enclosing run, which resolves
    /// only after it drained.
    pub fn detach(&mut self) {
        self.detached = true;
    }

    /// Wait for the nested graph before the subflow node completes (default).
    pub fn join(&mut self) {
        self.detached = false;
    }

    /// Whether [`detach`](Self::detach) is in effect.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub(crate) fn into_parts(self) -> (Graph, bool) {
        (self.graph, self.detached)
    }
}

/// Read-only description of a node, handed to observers.
#[derive(Debug, Clone, Copy)]
pub struct TaskView<'a> {
    /// Handle of the node in its graph.
    pub id: NodeId,
    /// Node name; the handle's display form if it was never named.
    pub name: &'a str,
    /// Name of the graph the node belongs to.
    pub graph: &'a str,
    /// Kind of work the node carries.
    pub kind: TaskKind,
    /// Scheduling priority of the node.
    pub priority: Priority,
}
