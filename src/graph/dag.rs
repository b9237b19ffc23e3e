//! Validated resource graph.
//!
//! Nodes live in an arena and edges are indices into it. Two kinds of edges
//! exist: data dependencies (a node reads values from another) and ordering
//! constraints (a node must start after a sibling finishes). Both take part
//! in the topological order; only data dependencies raise the rank.

use std::collections::HashMap;

use super::node::ResourceNode;

/// A validated directed acyclic graph of resources.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    /// Node arena.
    pub(super) nodes: Vec<ResourceNode>,
    /// Logical identifier to arena index.
    pub(super) index: HashMap<String, usize>,
    /// Data dependencies per node.
    pub(super) dependencies: Vec<Vec<usize>>,
    /// Ordering predecessors per node.
    pub(super) ordering: Vec<Vec<usize>>,
    /// Reverse data edges per node.
    pub(super) dependents: Vec<Vec<usize>>,
    /// Topological order over both edge kinds.
    pub(super) order: Vec<usize>,
    /// Rank per node.
    pub(super) ranks: Vec<usize>,
}

impl ResourceGraph {
    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns all nodes in arena order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Returns the node at `idx`.
    #[must_use]
    pub fn node(&self, idx: usize) -> &ResourceNode {
        &self.nodes[idx]
    }

    /// Looks up a node by logical identifier.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Returns the arena index of a logical identifier.
    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Returns true if the graph contains `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Data dependencies of a node.
    #[must_use]
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    /// Ordering predecessors of a node.
    #[must_use]
    pub fn ordering(&self, idx: usize) -> &[usize] {
        &self.ordering[idx]
    }

    /// Nodes that read values from `idx`.
    #[must_use]
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Topological order; ties are broken by logical identifier.
    #[must_use]
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Rank of a node: the longest data-dependency path from a root.
    ///
    /// A node ordered after a sibling never ranks below it.
    #[must_use]
    pub fn rank(&self, idx: usize) -> usize {
        self.ranks[idx]
    }

    /// Nodes grouped by rank, each batch in topological order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<usize>> {
        let depth = self.ranks.iter().max().map_or(0, |r| r + 1);
        let mut batches = vec![Vec::new(); depth];
        for &idx in &self.order {
            batches[self.ranks[idx]].push(idx);
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::tests::scenario_graph;

    #[test]
    fn test_scenario_ranks() {
        let graph = scenario_graph();
        let rank = |id: &str| graph.rank(graph.index_of(id).unwrap());

        assert_eq!(rank("ecr_repo"), 0);
        assert_eq!(rank("security_group"), 0);
        assert_eq!(rank("task_def"), 1);
        assert_eq!(rank("service"), 2);
    }

    #[test]
    fn test_topological_order_respects_every_edge() {
        let graph = scenario_graph();
        let position: Vec<usize> = {
            let mut pos = vec![0; graph.len()];
            for (p, &idx) in graph.topological_order().iter().enumerate() {
                pos[idx] = p;
            }
            pos
        };

        for idx in 0..graph.len() {
            for &dep in graph.dependencies(idx).iter().chain(graph.ordering(idx)) {
                assert!(position[dep] < position[idx]);
            }
        }
    }

    #[test]
    fn test_batches_group_same_rank() {
        let graph = scenario_graph();
        let names: Vec<Vec<&str>> = graph
            .batches()
            .iter()
            .map(|batch| batch.iter().map(|&i| graph.node(i).id.as_str()).collect())
            .collect();

        assert_eq!(
            names,
            vec![vec!["ecr_repo", "security_group"], vec!["task_def"], vec!["service"]]
        );
    }

    #[test]
    fn test_dependents_are_reverse_edges() {
        let graph = scenario_graph();
        let task_def = graph.index_of("task_def").unwrap();
        let service = graph.index_of("service").unwrap();
        assert_eq!(graph.dependents(task_def), &[service]);
    }
}
