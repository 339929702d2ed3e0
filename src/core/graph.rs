//! Dependency graph over ledger tasks.
//!
//! Nodes are task ids and an edge `a -> b` means `b` depends on `a`. Edges
//! may only point at tasks that already exist, so the graph stays acyclic by
//! construction; the cycle check is kept as a guard for replayed journals.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::task::TaskId;
use crate::{Error, Result};

/// Directed graph of declared task dependencies.
#[derive(Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that `id` may be inserted with `dependencies`, without mutating.
    pub fn check_insert<'a, I>(&self, id: &TaskId, dependencies: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a TaskId>,
    {
        if self.task_index.contains_key(id) {
            return Err(Error::DuplicateId(id.clone()));
        }
        for dep in dependencies {
            if dep == id {
                return Err(Error::Validation(format!("Task {} depends on itself", id)));
            }
            if !self.task_index.contains_key(dep) {
                return Err(Error::UnknownDependency {
                    task: id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        Ok(())
    }

    /// Insert a task node and its dependency edges.
    pub fn insert<'a, I>(&mut self, id: &TaskId, dependencies: I) -> Result<NodeIndex>
    where
        I: IntoIterator<Item = &'a TaskId> + Clone,
    {
        self.check_insert(id, dependencies.clone())?;

        let index = self.graph.add_node(id.clone());
        self.task_index.insert(id.clone(), index);
        for dep in dependencies {
            if let Some(&dep_index) = self.task_index.get(dep) {
                self.graph.add_edge(dep_index, index, ());
            }
        }

        if is_cyclic_directed(&self.graph) {
            return Err(Error::Validation(format!(
                "Adding task {} would create a dependency cycle",
                id
            )));
        }
        Ok(index)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check for a dependency edge between two tasks in either direction.
    pub fn has_edge_between(&self, a: &TaskId, b: &TaskId) -> bool {
        match (self.task_index.get(a), self.task_index.get(b)) {
            (Some(&ia), Some(&ib)) => {
                self.graph.find_edge(ia, ib).is_some() || self.graph.find_edge(ib, ia).is_some()
            }
            _ => false,
        }
    }

    /// Direct dependents of `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Direct dependencies of `id`.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Every task that transitively depends on `id`, in breadth-first order.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if seen.insert(next) {
                    order.push(self.graph[next].clone());
                    queue.push_back(next);
                }
            }
        }
        order
    }

    /// Task ids ordered so that every task follows its dependencies.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            Error::Validation(format!(
                "Cycle detected at task: {}",
                self.graph[cycle.node_id()]
            ))
        })?;
        Ok(sorted
            .into_iter()
            .map(|index| self.graph[index].clone())
            .collect())
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
