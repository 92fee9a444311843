use crate::{error::BuildError, graph::Graph, types::NodeId};
use std::collections::VecDeque;

/// What a validated graph needs to start a pass.
#[derive(Debug)]
pub(crate) struct Plan {
    /// Nodes without predecessors of either kind, in insertion order.
    pub(crate) sources: Vec<NodeId>,
}

impl Graph {
    /// Kahn's algorithm restricted to strong edges.
    ///
    /// Example:
    ///
    /// ```text
    ///   A ──► B ──► C ◄─┐
    ///               │   │ weak (C is a condition)
    ///               └───┘
    /// ```
    ///
    /// - A has no predecessors => source.
    /// - B, C are peeled off after A; the weak back edge C->C is ignored.
    /// - A strong edge C->B would leave B and C with unresolved predecessors
    ///   forever => cycle.
    pub(super) fn compute_plan(&self) -> Result<Plan, BuildError> {
        let mut remaining: Vec<usize> = self.nodes.iter().map(|n| n.num_strong_preds).collect();
        let mut ready: VecDeque<usize> = remaining
            .iter()
            .enumerate()
            .filter(|&(_, &left)| left == 0)
            .map(|(idx, _)| idx)
            .collect();

        let mut peeled = 0usize;
        while let Some(idx) = ready.pop_front() {
            peeled += 1;
            for &NodeId(child) in &self.nodes[idx].strong_dependents {
                let left = &mut remaining[child];
                *left = left.checked_sub(1).expect("Graph::compute_plan: [1]");
                if *left == 0 {
                    ready.push_back(child);
                }
            }
        }

        if peeled != self.nodes.len() {
            let task = self.nodes[self.node_on_cycle(&remaining)].name.clone();
            return Err(BuildError::Cycle {
                graph: self.name.clone(),
                task,
            });
        }

        let sources = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.num_strong_preds == 0 && node.num_weak_preds == 0)
            .map(|(idx, _)| NodeId(idx))
            .collect();
        Ok(Plan { sources })
    }

    /// Walk unresolved predecessors backwards until a node repeats.
    ///
    /// Every node Kahn couldn't peel has at least one unpeeled strong
    /// predecessor, so the walk never gets stuck and must revisit a node
    /// that lies on a cycle.
    fn node_on_cycle(&self, remaining: &[usize]) -> usize {
        let mut parents = vec![None; self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            if remaining[idx] == 0 {
                continue;
            }
            for &NodeId(child) in &node.strong_dependents {
                if remaining[child] != 0 {
                    parents[child].get_or_insert(idx);
                }
            }
        }

        let mut seen = vec![false; self.nodes.len()];
        let mut current = remaining
            .iter()
            .position(|&left| left != 0)
            .expect("Graph::node_on_cycle: [1]");
        while !seen[current] {
            seen[current] = true;
            current = parents[current].expect("Graph::node_on_cycle: [2]");
        }
        current
    }
}
