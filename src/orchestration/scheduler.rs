//! Batch selection for parallel task execution.
//!
//! The `TaskScheduler` turns a ledger snapshot into a [`WorkItemBatch`]: the
//! ready tasks that can run side by side without touching each other's
//! declared resources. Selection is a greedy walk in priority order, so the
//! same snapshot always yields the same batch.
//!
//! Tasks that declare no resources cannot be checked. They never join a
//! parallel batch; they wait in a solo queue and run alone once nothing else
//! is in flight.

use std::collections::{HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::{Task, TaskId};
use crate::ledger::LedgerSnapshot;
use crate::{clog_debug, clog_warn, Error};

/// Why two tasks were judged safe to run together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndependenceEvidence {
    pub first: TaskId,
    pub second: TaskId,
    pub note: String,
}

/// Why a ready task was left out of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    /// Parallelism cap reached.
    Capacity,
    /// Dependency edge with a batch member or in-flight task.
    DependsOn(TaskId),
    /// Declared resources overlap with a batch member or in-flight task.
    ResourceOverlap { with: TaskId, resource: String },
    /// No resource ownership declared; queued to run alone.
    IndependenceUnknown,
    /// Waiting out restart backoff.
    BackingOff,
    /// Holding dispatch until in-flight work finishes.
    Draining,
}

/// Tasks chosen to run concurrently in one scheduling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkItemBatch {
    /// In dispatch order.
    pub tasks: Vec<TaskId>,
    /// One entry per pair of batch members.
    pub evidence: Vec<IndependenceEvidence>,
    /// The batch is a single task of unknown ownership running alone.
    pub solo: bool,
    pub deferred: Vec<(TaskId, DeferReason)>,
}

impl WorkItemBatch {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn deferral(&self, id: &TaskId) -> Option<&DeferReason> {
        self.deferred.iter().find(|(t, _)| t == id).map(|(_, r)| r)
    }
}

pub struct TaskScheduler {
    parallelism: usize,
    solo_queue: VecDeque<TaskId>,
}

impl TaskScheduler {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            solo_queue: VecDeque::new(),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Tasks of unknown ownership waiting to run alone.
    pub fn solo_queue(&self) -> impl Iterator<Item = &TaskId> {
        self.solo_queue.iter()
    }

    /// Plan the next batch.
    ///
    /// Tasks already in flight count against the parallelism cap, and new
    /// batch members must be independent of them as well as of each other.
    pub fn plan(&mut self, snapshot: &LedgerSnapshot) -> WorkItemBatch {
        let now = Utc::now();
        let ready = snapshot.ready_tasks();
        let in_flight = snapshot.in_flight();
        let mut batch = WorkItemBatch::default();

        let ready_ids: HashSet<&TaskId> = ready.iter().map(|t| &t.id).collect();
        self.solo_queue.retain(|id| ready_ids.contains(id));

        if let Some(running) = in_flight.iter().find(|t| t.resources.is_none()) {
            clog_debug!("Task {} is running alone, holding dispatch", running.id);
            batch.deferred = ready
                .iter()
                .map(|t| (t.id.clone(), DeferReason::Draining))
                .collect();
            return batch;
        }

        let solo = self
            .solo_queue
            .iter()
            .filter_map(|id| snapshot.get(id))
            .find(|t| !t.is_backing_off(now))
            .map(|t| t.id.clone());
        if let Some(solo) = solo {
            if in_flight.is_empty() {
                self.solo_queue.retain(|id| *id != solo);
                clog_debug!("Dispatching {} alone (ownership unknown)", solo);
                batch.deferred = ready
                    .iter()
                    .filter(|t| t.id != solo)
                    .map(|t| (t.id.clone(), DeferReason::Draining))
                    .collect();
                batch.tasks.push(solo);
                batch.solo = true;
            } else {
                clog_debug!(
                    "Draining {} in-flight task(s) before running {} alone",
                    in_flight.len(),
                    solo
                );
                batch.deferred = ready
                    .iter()
                    .map(|t| (t.id.clone(), DeferReason::Draining))
                    .collect();
            }
            return batch;
        }

        let capacity = self.parallelism.saturating_sub(in_flight.len());
        let mut chosen: Vec<&Task> = Vec::new();
        for task in ready {
            if task.is_backing_off(now) {
                batch.deferred.push((task.id.clone(), DeferReason::BackingOff));
                continue;
            }
            if task.resources.is_none() {
                if !self.solo_queue.contains(&task.id) {
                    clog_warn!("{}; it will run alone", Error::IndependenceUnknown(task.id.clone()));
                    self.solo_queue.push_back(task.id.clone());
                }
                batch
                    .deferred
                    .push((task.id.clone(), DeferReason::IndependenceUnknown));
                continue;
            }
            if chosen.len() >= capacity {
                batch.deferred.push((task.id.clone(), DeferReason::Capacity));
                continue;
            }
            let conflict = in_flight
                .iter()
                .chain(chosen.iter())
                .find_map(|other| conflict_between(task, other));
            if let Some(reason) = conflict {
                batch.deferred.push((task.id.clone(), reason));
                continue;
            }
            for other in &chosen {
                batch.evidence.push(IndependenceEvidence {
                    first: other.id.clone(),
                    second: task.id.clone(),
                    note: evidence_note(other, task),
                });
            }
            chosen.push(task);
        }

        batch.tasks = chosen.iter().map(|t| t.id.clone()).collect();
        if !batch.is_empty() {
            clog_debug!(
                "Planned batch {:?} ({} in flight, {} deferred)",
                batch.tasks.iter().map(TaskId::as_str).collect::<Vec<_>>(),
                in_flight.len(),
                batch.deferred.len()
            );
        }
        batch
    }
}

/// Reason `task` cannot run alongside `other`, if any.
fn conflict_between(task: &Task, other: &Task) -> Option<DeferReason> {
    if task.dependencies.contains(&other.id) || other.dependencies.contains(&task.id) {
        return Some(DeferReason::DependsOn(other.id.clone()));
    }
    let (Some(mine), Some(theirs)) = (&task.resources, &other.resources) else {
        return Some(DeferReason::IndependenceUnknown);
    };
    mine.iter()
        .find(|r| theirs.iter().any(|o| resources_overlap(r, o)))
        .map(|r| DeferReason::ResourceOverlap {
            with: other.id.clone(),
            resource: r.clone(),
        })
}

/// Equal paths, or one a directory prefix of the other.
pub fn resources_overlap(a: &str, b: &str) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    a.starts_with(&b) || b.starts_with(&a)
}

fn normalize(resource: &str) -> PathBuf {
    Path::new(resource)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn evidence_note(a: &Task, b: &Task) -> String {
    let list = |t: &Task| {
        t.resources
            .as_ref()
            .map(|r| r.iter().cloned().collect::<Vec<_>>().join(", "))
            .unwrap_or_default()
    };
    format!(
        "no dependency edge; disjoint resources {{{}}} and {{{}}}",
        list(a),
        list(b)
    )
}
