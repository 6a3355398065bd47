//! Step dependency graph.
//!
//! A [`StepGraph`] describes a workflow as named steps with dependency
//! edges. Each step is a task factory: when all of a step's dependencies
//! have succeeded, it is built from their outputs and submitted. The
//! scheduler that drives it lives in `orchestration::scheduler`.

use crate::core::task::{Payload, Task};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Builds a step's task from the outputs of its dependencies, keyed by
/// dependency step name.
pub type StepBuilder<V, E> = Arc<dyn Fn(&HashMap<String, V>) -> Task<V, E> + Send + Sync>;

struct StepNode<V, E> {
    name: String,
    build: StepBuilder<V, E>,
}

impl<V, E> Clone for StepNode<V, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            build: Arc::clone(&self.build),
        }
    }
}

/// Named steps connected by "must finish before" edges.
///
/// An edge `from -> to` means `to` receives `from`'s output and does not
/// start until `from` succeeded. Cycles are rejected when the edge is added.
pub struct StepGraph<V, E> {
    name: String,
    graph: DiGraph<StepNode<V, E>, ()>,
    /// Index from step name to node for fast lookups.
    index: HashMap<String, NodeIndex>,
}

impl<V, E> Clone for StepGraph<V, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            graph: self.graph.clone(),
            index: self.index.clone(),
        }
    }
}

impl<V, E> std::fmt::Debug for StepGraph<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepGraph")
            .field("name", &self.name)
            .field("steps", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}

impl<V: Payload, E: Payload> StepGraph<V, E> {
    /// Create an empty graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add a step. Step names are unique within a graph.
    pub fn add_step<F>(&mut self, name: impl Into<String>, build: F) -> Result<()>
    where
        F: Fn(&HashMap<String, V>) -> Task<V, E> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(Error::StepExists(name));
        }
        let node = self.graph.add_node(StepNode {
            name: name.clone(),
            build: Arc::new(build),
        });
        self.index.insert(name, node);
        Ok(())
    }

    /// Add a dependency: `from` must succeed before `to` can start.
    ///
    /// # Errors
    /// Returns an error if either step is unknown or if the edge would
    /// create a cycle (the graph is left unchanged).
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<()> {
        let from_index = self.node(from)?;
        let to_index = self.node(to)?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "dependency from {} to {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }

    /// Build the task for `name`. `None` if there is no such step.
    pub(crate) fn build_step(&self, name: &str, inputs: &HashMap<String, V>) -> Option<Task<V, E>> {
        let node = self.index.get(name)?;
        Some((self.graph[*node].build)(inputs))
    }
}

impl<V, E> StepGraph<V, E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains_step(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Names of all steps, in insertion order.
    pub fn steps(&self) -> Vec<&str> {
        self.graph
            .node_weights()
            .map(|node| node.name.as_str())
            .collect()
    }

    /// Steps that `name` depends on directly, sorted by name.
    pub fn dependencies(&self, name: &str) -> Result<Vec<&str>> {
        let index = self.node(name)?;
        let mut deps: Vec<&str> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|dep| self.graph[dep].name.as_str())
            .collect();
        deps.sort_unstable();
        Ok(deps)
    }

    /// Steps whose dependencies have all completed and that are neither
    /// completed nor in flight themselves.
    pub fn ready_steps(
        &self,
        completed: &HashSet<String>,
        in_flight: &HashSet<String>,
    ) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let node = &self.graph[index];
                if completed.contains(&node.name) || in_flight.contains(&node.name) {
                    return None;
                }

                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| completed.contains(&self.graph[dep].name));

                deps_satisfied.then_some(node.name.as_str())
            })
            .collect()
    }

    /// Check whether every step is in the completed set.
    pub fn all_complete(&self, completed: &HashSet<String>) -> bool {
        self.index.keys().all(|name| completed.contains(name))
    }

    /// Steps ordered so that each one comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&str>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            Error::Validation(format!(
                "cycle detected at step: {}",
                self.graph[cycle.node_id()].name
            ))
        })?;
        Ok(sorted
            .into_iter()
            .map(|index| self.graph[index].name.as_str())
            .collect())
    }

    fn node(&self, name: &str) -> Result<NodeIndex> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::StepNotFound(name.to_string()))
    }
}
