//! ProcessFlow: the immutable, compiled DAG a [`crate::coordinator::Coordinator`]
//! runs. Built only by [`crate::compiler::Compiler`]; every query here is
//! pure and side-effect free.

use std::collections::{HashMap, HashSet, VecDeque};

use globset::{Glob, GlobSet, GlobSetBuilder};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::model::{Dependency, Node};

pub type Graph = DiGraph<Node, Dependency>;

/// The compiled, acyclic flow of steps and groups.
#[derive(Debug, Clone)]
pub struct ProcessFlow {
    graph: Graph,
    by_name: HashMap<String, NodeIndex>,
}

impl ProcessFlow {
    pub(crate) fn new(graph: Graph, by_name: HashMap<String, NodeIndex>) -> Self {
        ProcessFlow { graph, by_name }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.graph[idx]
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    pub fn steps(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Nodes with no incoming edges.
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, Direction::Incoming).next().is_none())
            .collect()
    }

    /// Nodes with no outgoing edges.
    pub fn leaves(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, Direction::Outgoing).next().is_none())
            .collect()
    }

    /// Direct prerequisites of `node`, paired with whether the edge is soft.
    pub fn prerequisites(&self, node: NodeIndex) -> Vec<(NodeIndex, Dependency)> {
        self.graph
            .edges_directed(node, Direction::Incoming)
            .map(|e| (e.source(), *e.weight()))
            .collect()
    }

    /// Direct dependents of `node`.
    pub fn dependents(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .map(|e| e.target())
            .collect()
    }

    /// Steps downstream of any pattern in `from` (inclusive), intersected
    /// with steps upstream of any pattern in `to` (inclusive). An empty
    /// `from` means "from the roots"; an empty `to` means "to the leaves".
    pub fn subgraph(&self, from: &[String], to: &[String]) -> Result<HashSet<NodeIndex>, globset::Error> {
        let from_seeds = if from.is_empty() {
            self.roots()
        } else {
            self.matching(from)?
        };
        let to_seeds = if to.is_empty() {
            self.leaves()
        } else {
            self.matching(to)?
        };

        let downstream = self.reachable(&from_seeds, Direction::Outgoing);
        let upstream = self.reachable(&to_seeds, Direction::Incoming);

        Ok(downstream.intersection(&upstream).copied().collect())
    }

    fn matching(&self, patterns: &[String]) -> Result<Vec<NodeIndex>, globset::Error> {
        let set = build_globset(patterns)?;
        Ok(self
            .graph
            .node_indices()
            .filter(|&idx| set.is_match(&self.graph[idx].name))
            .collect())
    }

    /// BFS closure over `seeds` following `direction`, including the seeds.
    fn reachable(&self, seeds: &[NodeIndex], direction: Direction) -> HashSet<NodeIndex> {
        let mut seen: HashSet<NodeIndex> = seeds.iter().copied().collect();
        let mut queue: VecDeque<NodeIndex> = seeds.iter().copied().collect();
        while let Some(idx) = queue.pop_front() {
            for edge in self.graph.edges_directed(idx, direction) {
                let next = match direction {
                    Direction::Outgoing => edge.target(),
                    Direction::Incoming => edge.source(),
                };
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p)?);
    }
    builder.build()
}
