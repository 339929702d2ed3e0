//! Immutable ledger views for scheduling passes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::core::{DependencyGraph, Task, TaskId, TaskStatus};

/// A point-in-time copy of every task, ordered by insertion.
///
/// The scheduler plans against a snapshot so the ledger can keep changing
/// while a pass runs.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    taken_at: DateTime<Utc>,
}

impl LedgerSnapshot {
    pub fn new(mut tasks: Vec<Task>) -> Self {
        tasks.sort_by_key(|t| t.seq);
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        Self {
            tasks,
            index,
            taken_at: Utc::now(),
        }
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks ordered so that each one follows its dependencies.
    ///
    /// Falls back to insertion order if the recorded dependencies do not
    /// form a graph.
    pub fn in_dependency_order(&self) -> Vec<&Task> {
        let mut graph = DependencyGraph::new();
        let ordered = self
            .tasks
            .iter()
            .try_for_each(|task| graph.insert(&task.id, &task.dependencies).map(|_| ()))
            .and_then(|_| graph.topological_order());
        match ordered {
            Ok(ids) => ids.iter().filter_map(|id| self.get(id)).collect(),
            Err(_) => self.tasks.iter().collect(),
        }
    }

    fn dependencies_done(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|dep| self.get(dep).map(Task::is_done).unwrap_or(false))
    }

    /// Tasks whose dependencies are all `Done` and whose status is
    /// `Planned`, `SpecReady` or `Ready`, by priority then insertion order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_schedulable() && !t.is_assigned())
            .filter(|t| self.dependencies_done(t))
            .collect();
        ready.sort_by_key(|t| (t.priority, t.seq));
        ready
    }

    /// Tasks currently holding a worker or awaiting merge.
    pub fn in_flight(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_in_flight())
            .collect()
    }

    pub fn with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.status == status).collect()
    }

    /// Whether either task declares the other as a dependency.
    pub fn has_dependency_edge(&self, a: &TaskId, b: &TaskId) -> bool {
        let declares = |from: &TaskId, to: &TaskId| {
            self.get(from)
                .map(|t| t.dependencies.contains(to))
                .unwrap_or(false)
        };
        declares(a, b) || declares(b, a)
    }

    /// Counts per status, for status reporting.
    pub fn status_counts(&self) -> Vec<(TaskStatus, usize)> {
        use TaskStatus::*;
        [
            Planned,
            SpecReady,
            Ready,
            Running,
            AwaitingMerge,
            Done,
            Failed,
            Blocked,
        ]
        .into_iter()
        .map(|s| (s, self.tasks.iter().filter(|t| t.status == s).count()))
        .filter(|(_, n)| *n > 0)
        .collect()
    }

    /// Every task is `Done`, or stuck in `Failed`/`Blocked`.
    pub fn is_settled(&self) -> bool {
        self.tasks.iter().all(|t| {
            matches!(
                t.status,
                TaskStatus::Done | TaskStatus::Failed | TaskStatus::Blocked
            )
        })
    }
}
