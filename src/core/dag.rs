//! Dependency graph over named nodes.
//!
//! Used twice: once over task names to drive scheduling, and once over
//! component names to order rollbacks. An edge `a -> b` means `a` must
//! finish before `b` may start, so `b` depends on `a`.

use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Directed dependency graph keyed by name, preserving insertion order.
#[derive(Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from `(name, dependencies)` pairs.
    ///
    /// Every dependency must name a node in the set. Cycles are not
    /// checked here; call [`DependencyGraph::validate_acyclic`].
    pub fn from_entries<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let entries: Vec<(&str, &[String])> = entries.into_iter().collect();
        let mut graph = Self::new();
        for (name, _) in &entries {
            if graph.contains(name) {
                return Err(Error::DuplicateTaskName(name.to_string()));
            }
            graph.add_node(name);
        }
        for (name, deps) in &entries {
            for dep in deps.iter() {
                if !graph.contains(dep) {
                    return Err(Error::UnknownDependency {
                        task: name.to_string(),
                        dependency: dep.clone(),
                    });
                }
                graph.add_dependency(name, dep)?;
            }
        }
        Ok(graph)
    }

    /// Add a node. Adding an existing name returns its index.
    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(&index) = self.index.get(name) {
            return index;
        }
        let index = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), index);
        index
    }

    /// Record that `name` depends on `dependency`. Both must exist.
    pub fn add_dependency(&mut self, name: &str, dependency: &str) -> Result<()> {
        let to = self
            .node(name)
            .ok_or_else(|| Error::TaskNotFound(name.to_string()))?;
        let from = self
            .node(dependency)
            .ok_or_else(|| Error::UnknownDependency {
                task: name.to_string(),
                dependency: dependency.to_string(),
            })?;
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
        Ok(())
    }

    fn node(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Names in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.graph.node_weights().map(String::as_str).collect()
    }

    fn sorted_names(&self, nodes: impl Iterator<Item = NodeIndex>) -> Vec<&str> {
        let mut nodes: Vec<NodeIndex> = nodes.collect();
        nodes.sort();
        nodes.into_iter().map(|n| self.graph[n].as_str()).collect()
    }

    /// Direct dependencies of `name`, in insertion order.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        match self.node(name) {
            Some(n) => self.sorted_names(self.graph.neighbors_directed(n, Direction::Incoming)),
            None => Vec::new(),
        }
    }

    /// Nodes that directly depend on `name`, in insertion order.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        match self.node(name) {
            Some(n) => self.sorted_names(self.graph.neighbors_directed(n, Direction::Outgoing)),
            None => Vec::new(),
        }
    }

    /// Every node that depends on `name`, directly or transitively.
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let Some(start) = self.node(name) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        self.sorted_names(seen.into_iter())
    }

    /// Find a dependency cycle with a depth-first search that tracks the
    /// current recursion stack.
    ///
    /// The returned path reads "depends on" left to right and repeats its
    /// first node at the end, e.g. `a -> b -> c -> a`.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut stack = Vec::new();
        for node in self.graph.node_indices() {
            if marks[node.index()] == Mark::Unvisited {
                if let Some(cycle) = self.visit(node, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        marks: &mut [Mark],
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<String>> {
        marks[node.index()] = Mark::OnStack;
        stack.push(node);

        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        deps.sort();

        for dep in deps {
            match marks[dep.index()] {
                Mark::OnStack => {
                    let start = stack.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|n| self.graph[*n].clone()).collect();
                    cycle.push(self.graph[dep].clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(dep, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node.index()] = Mark::Done;
        None
    }

    pub fn validate_acyclic(&self) -> Result<()> {
        match self.find_cycle() {
            Some(cycle) => Err(Error::CyclicDependency { cycle }),
            None => Ok(()),
        }
    }

    /// Dependencies before dependents; ties broken by insertion order.
    pub fn topological_order(&self) -> Result<Vec<&str>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(self.graph[node].as_str());
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() != self.len() {
            self.validate_acyclic()?;
        }
        Ok(order)
    }

    /// Order in which to undo `subset`: dependents before their dependencies,
    /// independent nodes newest first. Names not in the graph go first.
    pub fn rollback_order(&self, subset: &[String]) -> Result<Vec<String>> {
        let wanted: HashSet<&str> = subset.iter().map(String::as_str).collect();
        let mut order: Vec<String> = subset
            .iter()
            .filter(|name| !self.contains(name))
            .cloned()
            .collect();
        let mut known: Vec<String> = self
            .topological_order()?
            .into_iter()
            .filter(|name| wanted.contains(name))
            .map(str::to_string)
            .collect();
        known.reverse();
        order.extend(known);
        Ok(order)
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}
