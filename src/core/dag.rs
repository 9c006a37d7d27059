//! Directed acyclic precedence graphs.
//!
//! [`DependencyGraph`] is the shared shape behind both levels of the engine:
//! tasks inside a [`TaskGroup`](super::group::TaskGroup) and groups inside a
//! [`PipelineGraph`](super::graph::PipelineGraph). Nodes keep insertion order
//! so that topological order is deterministic for equal-rank nodes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use thiserror::Error;

/// Errors that can occur when working with dependency graphs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    /// A cycle was detected in the graph.
    #[error("cycle detected involving: {0}")]
    CycleDetected(String),

    /// A dependency references a node that doesn't exist.
    #[error("missing dependency: '{from}' depends on non-existent '{to}'")]
    MissingDependency { from: String, to: String },

    /// Attempted to add a duplicate node.
    #[error("duplicate node: {0}")]
    DuplicateNode(String),

    /// Node not found in the graph.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A node was declared to depend on itself.
    #[error("'{0}' cannot depend on itself")]
    SelfDependency(String),
}

/// A precedence graph over keys of type `K`.
///
/// An edge `from -> to` recorded with [`add_dependency`](Self::add_dependency)
/// means `to` must complete before `from` may start.
#[derive(Debug, Clone)]
pub struct DependencyGraph<K> {
    order: Vec<K>,
    dependencies: HashMap<K, Vec<K>>,
}

impl<K> DependencyGraph<K>
where
    K: Clone + Eq + Hash + Display,
{
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            dependencies: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.dependencies.contains_key(key)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[K] {
        &self.order
    }

    /// Add a node with no dependencies.
    pub fn add_node(&mut self, key: K) -> Result<(), DagError> {
        if self.dependencies.contains_key(&key) {
            return Err(DagError::DuplicateNode(key.to_string()));
        }
        self.dependencies.insert(key.clone(), Vec::new());
        self.order.push(key);
        Ok(())
    }

    /// Add a dependency: `from` depends on `to` (to must complete before from).
    pub fn add_dependency(&mut self, from: &K, to: &K) -> Result<(), DagError> {
        if from == to {
            return Err(DagError::SelfDependency(from.to_string()));
        }
        if !self.dependencies.contains_key(to) {
            return Err(DagError::MissingDependency {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let deps = self
            .dependencies
            .get_mut(from)
            .ok_or_else(|| DagError::NodeNotFound(from.to_string()))?;
        if !deps.contains(to) {
            deps.push(to.clone());
        }
        Ok(())
    }

    /// Direct predecessors of a node.
    pub fn dependencies(&self, key: &K) -> &[K] {
        self.dependencies
            .get(key)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Direct successors of a node, in insertion order.
    pub fn dependents(&self, key: &K) -> Vec<K> {
        self.order
            .iter()
            .filter(|node| self.dependencies(node).contains(key))
            .cloned()
            .collect()
    }

    /// Nodes without predecessors.
    pub fn roots(&self) -> Vec<K> {
        self.order
            .iter()
            .filter(|node| self.dependencies(node).is_empty())
            .cloned()
            .collect()
    }

    /// Nodes nothing else depends on.
    pub fn terminals(&self) -> Vec<K> {
        self.order
            .iter()
            .filter(|node| self.dependents(node).is_empty())
            .cloned()
            .collect()
    }

    /// Every node transitively reachable downstream of `key`.
    pub fn descendants(&self, key: &K) -> HashSet<K> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<K> = self.dependents(key).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents(&next));
            }
        }
        seen
    }

    /// Every node `key` transitively depends on.
    pub fn ancestors(&self, key: &K) -> HashSet<K> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<K> = self.dependencies(key).iter().cloned().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependencies(&next).iter().cloned());
            }
        }
        seen
    }

    /// Return nodes in topological order, or the first node found on a cycle.
    pub fn topological_sort(&self) -> Result<Vec<K>, DagError> {
        // Kahn's algorithm, seeded in insertion order
        let mut in_degree: HashMap<&K, usize> = self
            .order
            .iter()
            .map(|k| (k, self.dependencies(k).len()))
            .collect();

        let mut queue: VecDeque<&K> = self
            .order
            .iter()
            .filter(|k| in_degree.get(k) == Some(&0))
            .collect();

        let mut result = Vec::with_capacity(self.order.len());
        while let Some(id) = queue.pop_front() {
            result.push(id.clone());
            for next in &self.order {
                if !self.dependencies(next).contains(id) {
                    continue;
                }
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if result.len() != self.order.len() {
            let cycle_node = self
                .order
                .iter()
                .find(|k| in_degree.get(k).is_some_and(|d| *d > 0))
                .map(|k| k.to_string())
                .unwrap_or_default();
            return Err(DagError::CycleDetected(cycle_node));
        }

        Ok(result)
    }

    /// Validate the graph structure.
    pub fn validate(&self) -> Result<(), DagError> {
        for (from, deps) in &self.dependencies {
            for to in deps {
                if !self.dependencies.contains_key(to) {
                    return Err(DagError::MissingDependency {
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
            }
        }
        self.topological_sort()?;
        Ok(())
    }
}

impl<K> Default for DependencyGraph<K>
where
    K: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}
