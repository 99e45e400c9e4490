//! Static dependency graph used to validate a flow before it runs

use crate::error::{FlowError, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use tracing::warn;

/// Directed graph of node keys, edges point from dependency to dependent
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
}

impl DependencyGraph {
    /// Build the graph from `(key, dependencies)` pairs.
    ///
    /// Dependencies naming an unknown key are left out of the graph; at run
    /// time such a node simply never becomes ready.
    pub fn build<'a, I>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let nodes: Vec<_> = nodes.into_iter().collect();
        let mut graph = DiGraph::new();
        let mut indices = HashMap::with_capacity(nodes.len());

        for (key, _) in &nodes {
            let index = graph.add_node(key.to_string());
            indices.insert(*key, index);
        }

        for (key, deps) in &nodes {
            let index = indices[key];
            for dep in deps.iter() {
                match indices.get(dep.as_str()) {
                    Some(&dep_index) => {
                        graph.add_edge(dep_index, index, ());
                    }
                    None => {
                        warn!(
                            "Node '{}' depends on unregistered node '{}', it will never run",
                            key, dep
                        );
                    }
                }
            }
        }

        let engine = Self { graph };
        engine.validate_acyclic()?;
        Ok(engine)
    }

    /// Validate that the graph is acyclic
    pub fn validate_acyclic(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            let cycle_info = self.find_cycle();
            return Err(FlowError::CycleDetected(cycle_info));
        }
        Ok(())
    }

    fn find_cycle(&self) -> String {
        let mut visited = HashMap::new();
        let mut path = Vec::new();

        for node in self.graph.node_indices() {
            if !visited.contains_key(&node) {
                if let Some(cycle) = self.dfs_find_cycle(node, &mut visited, &mut path) {
                    return cycle;
                }
            }
        }

        "Unknown cycle".to_string()
    }

    fn dfs_find_cycle(
        &self,
        node: NodeIndex,
        visited: &mut HashMap<NodeIndex, bool>,
        path: &mut Vec<String>,
    ) -> Option<String> {
        if let Some(&in_path) = visited.get(&node) {
            if in_path {
                path.push(self.graph[node].clone());
                return Some(path.join(" -> "));
            }
            return None;
        }

        visited.insert(node, true);
        path.push(self.graph[node].clone());

        for neighbor in self.graph.neighbors(node) {
            if let Some(cycle) = self.dfs_find_cycle(neighbor, visited, path) {
                return Some(cycle);
            }
        }

        path.pop();
        visited.insert(node, false);
        None
    }

    /// Node keys in an order where every dependency precedes its dependents
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let sorted_indices = toposort(&self.graph, None).map_err(|_| {
            FlowError::CycleDetected("Cycle detected during topological sort".to_string())
        })?;

        Ok(sorted_indices
            .iter()
            .map(|&idx| self.graph[idx].clone())
            .collect())
    }

    /// Keys grouped by the round they run in when every node succeeds.
    /// Level 0 is what `seed` runs, level N what the N-th `advance` runs.
    pub fn parallel_levels(&self) -> Vec<Vec<String>> {
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut node_levels: HashMap<NodeIndex, usize> = HashMap::new();

        for node in self.graph.node_indices() {
            let level = self.calculate_node_level(node, &mut node_levels);
            node_levels.insert(node, level);
        }

        // Registration order within a level
        let mut ordered: Vec<_> = node_levels.into_iter().collect();
        ordered.sort_by_key(|(node, _)| node.index());

        for (node, level) in ordered {
            while levels.len() <= level {
                levels.push(Vec::new());
            }
            levels[level].push(self.graph[node].clone());
        }

        levels
    }

    fn calculate_node_level(
        &self,
        node: NodeIndex,
        cache: &mut HashMap<NodeIndex, usize>,
    ) -> usize {
        if let Some(&level) = cache.get(&node) {
            return level;
        }

        let mut max_dep_level = 0;
        for parent in self
            .graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
        {
            let parent_level = self.calculate_node_level(parent, cache);
            max_dep_level = max_dep_level.max(parent_level + 1);
        }

        cache.insert(node, max_dep_level);
        max_dep_level
    }
}
