//! Task dependency graph.
//!
//! This module provides the TaskGraph structure that represents task
//! dependencies as a directed acyclic graph. Edges run from a dependency to
//! its dependent, so topological order is a valid start order and the
//! downstream closure of a task is the set to restart when it changes.

use crate::core::task::Task;
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::HashMap;

/// The task dependency graph.
///
/// Nodes are tasks, keyed by their unique name. Tasks are inserted in
/// sorted name order so every derived ordering is deterministic.
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    index: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    /// Build a graph from a set of tasks.
    ///
    /// # Errors
    /// Returns an error if a task depends on an unknown task or if the
    /// dependencies form a cycle. Both are configuration errors and fatal
    /// at startup.
    pub fn new(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        let mut tasks = tasks;
        tasks.sort_by(|a, b| a.name.cmp(&b.name));

        for task in &tasks {
            let node = graph.add_node(task.clone());
            index.insert(task.name.clone(), node);
        }

        for task in &tasks {
            let to = index[&task.name];
            for dep in &task.depends_on {
                let from = *index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(from, to, ());
            }
        }

        let built = Self { graph, index };
        // Reject cycles at construction; name one of the offending tasks.
        if is_cyclic_directed(&built.graph) {
            let task = toposort(&built.graph, None)
                .err()
                .and_then(|cycle| built.graph.node_weight(cycle.node_id()))
                .map(|t| t.name.clone())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::Cycle(task));
        }
        Ok(built)
    }

    /// Get a task by name.
    pub fn get(&self, name: &str) -> Option<&Task> {
        self.index.get(name).and_then(|&i| self.graph.node_weight(i))
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

    /// All tasks, in deterministic (sorted-name) node order.
    pub fn tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// Names of the tasks `name` directly depends on.
    pub fn dependencies_of(&self, name: &str) -> Vec<&Task> {
        self.neighbors(name, petgraph::Direction::Incoming)
    }

    /// Names of the tasks that directly depend on `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<&Task> {
        self.neighbors(name, petgraph::Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, dir: petgraph::Direction) -> Vec<&Task> {
        match self.index.get(name) {
            Some(&i) => self
                .graph
                .neighbors_directed(i, dir)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tasks in dependency order (every task after all of its dependencies).
    ///
    /// Deterministic for a given task set: nodes are inserted sorted by name
    /// and petgraph's toposort visits them in index order.
    pub fn start_order(&self) -> Vec<&Task> {
        // Cycles were rejected at construction, toposort cannot fail here.
        toposort(&self.graph, None)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i))
            .collect()
    }

    /// The task and all of its transitive dependents, in dependency order.
    ///
    /// This is the set to restart when the task's inputs change.
    /// Dependencies are never included.
    pub fn restart_closure(&self, name: &str) -> Result<Vec<&Task>> {
        let start = *self
            .index
            .get(name)
            .ok_or_else(|| Error::TaskNotFound(name.to_string()))?;

        let mut reachable = std::collections::HashSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(node) = bfs.next(&self.graph) {
            reachable.insert(node);
        }

        Ok(self
            .start_order()
            .into_iter()
            .filter(|t| reachable.contains(&self.index[&t.name]))
            .collect())
    }

    /// Union of restart closures for several tasks, in dependency order.
    pub fn restart_closure_all<'a, I>(&self, names: I) -> Result<Vec<&Task>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut reachable = std::collections::HashSet::new();
        for name in names {
            let start = *self
                .index
                .get(name)
                .ok_or_else(|| Error::TaskNotFound(name.to_string()))?;
            let mut bfs = Bfs::new(&self.graph, start);
            while let Some(node) = bfs.next(&self.graph) {
                reachable.insert(node);
            }
        }

        Ok(self
            .start_order()
            .into_iter()
            .filter(|t| reachable.contains(&self.index[&t.name]))
            .collect())
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
