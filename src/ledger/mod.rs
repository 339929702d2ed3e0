//! The task ledger: single source of truth for task state.
//!
//! All task changes go through [`TaskLedger`], which validates them against
//! the status state machine, journals them as [`LedgerEvent`]s and only then
//! applies them. The ledger has exactly one writer, the supervisor; other
//! processes reach it through the inbox.

pub mod event;
pub mod journal;
pub mod snapshot;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;

use crate::core::{DependencyGraph, ExecutionContext, Task, TaskId, TaskStatus, DEFAULT_ROLE};
use crate::orchestration::WorkerId;
use crate::{clog, clog_debug, clog_warn, Error, Result};

pub use event::{JournalEntry, LedgerEvent, StatusChange};
pub use journal::{Checkpoint, Journal};
pub use snapshot::LedgerSnapshot;

/// Retry budget and checkpoint cadence.
#[derive(Debug, Clone, Copy)]
pub struct LedgerOptions {
    /// A `Failed` task with more failures than this is terminal.
    pub max_restarts: u32,
    /// Journal entries between checkpoints.
    pub snapshot_every: u64,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            snapshot_every: 64,
        }
    }
}

pub struct TaskLedger {
    tasks: HashMap<TaskId, Task>,
    graph: DependencyGraph,
    role_failures: BTreeMap<String, u32>,
    next_task_seq: u64,
    journal: Option<Journal>,
    journal_seq: u64,
    since_checkpoint: u64,
    options: LedgerOptions,
    changes: Vec<StatusChange>,
}

impl TaskLedger {
    /// A ledger with no durable state.
    pub fn in_memory(options: LedgerOptions) -> Self {
        Self {
            tasks: HashMap::new(),
            graph: DependencyGraph::new(),
            role_failures: BTreeMap::new(),
            next_task_seq: 0,
            journal: None,
            journal_seq: 0,
            since_checkpoint: 0,
            options,
            changes: Vec::new(),
        }
    }

    /// Open the durable ledger in `state_dir`, replaying its change log.
    ///
    /// A torn write at the end of the log is cut off first so the entries
    /// appended from now on stay readable.
    pub fn open(state_dir: &Path, options: LedgerOptions) -> Result<Self> {
        let journal = Journal::new(state_dir)?;
        journal.repair_tail()?;
        let mut ledger = Self::replay(&journal, options)?;
        ledger.journal = Some(journal);
        Ok(ledger)
    }

    /// Read the durable ledger without taking ownership of its journal.
    pub fn inspect(state_dir: &Path) -> Result<LedgerSnapshot> {
        let journal = Journal::new(state_dir)?;
        Ok(Self::replay(&journal, LedgerOptions::default())?.snapshot())
    }

    fn replay(journal: &Journal, options: LedgerOptions) -> Result<Self> {
        let checkpoint = journal.load_checkpoint()?;
        let entries = journal.entries_after(checkpoint.seq)?;

        let mut ledger = Self::in_memory(options);
        ledger.restore(checkpoint);
        for entry in &entries {
            if let Err(e) = ledger.apply(&entry.event) {
                clog_warn!("Skipping journal entry {}: {}", entry.seq, e);
            }
            ledger.journal_seq = entry.seq;
        }
        ledger.since_checkpoint = entries.len() as u64;

        clog!(
            "Ledger opened: {} tasks, journal seq {} ({} replayed)",
            ledger.tasks.len(),
            ledger.journal_seq,
            entries.len()
        );
        Ok(ledger)
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.journal_seq = checkpoint.seq;
        self.next_task_seq = checkpoint.next_task_seq;
        self.role_failures = checkpoint.role_failures;
        let mut tasks = checkpoint.tasks;
        tasks.sort_by_key(|t| t.seq);
        for task in tasks {
            if let Err(e) = self.graph.insert(&task.id, &task.dependencies) {
                clog_warn!("Checkpoint task {} not indexed: {}", task.id, e);
            }
            self.next_task_seq = self.next_task_seq.max(task.seq + 1);
            self.tasks.insert(task.id.clone(), task);
        }
    }

    pub fn options(&self) -> LedgerOptions {
        self.options
    }

    pub fn journal_seq(&self) -> u64 {
        self.journal_seq
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Immutable view for a scheduling pass.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot::new(self.tasks.values().cloned().collect())
    }

    /// Ready tasks ordered by priority, then insertion order.
    pub fn get_ready_tasks(&self) -> Vec<Task> {
        self.snapshot().ready_tasks().into_iter().cloned().collect()
    }

    /// Whether `task` can never change again.
    pub fn is_terminal(&self, task: &Task) -> bool {
        match task.status {
            TaskStatus::Done => true,
            TaskStatus::Failed => task.failures > self.options.max_restarts,
            _ => false,
        }
    }

    pub fn role_failures(&self, role: &str) -> u32 {
        self.role_failures.get(role).copied().unwrap_or(0)
    }

    /// Add a task from the planning collaborator.
    ///
    /// Dependencies must name tasks that are already in the ledger.
    pub fn add_task(&mut self, mut task: Task) -> Result<TaskId> {
        task.id.validate()?;
        if self.tasks.contains_key(&task.id) {
            return Err(Error::DuplicateId(task.id));
        }
        self.graph.check_insert(&task.id, &task.dependencies)?;
        if !task.status.is_schedulable() {
            return Err(Error::Validation(format!(
                "Task {} cannot enter the ledger as {}",
                task.id, task.status
            )));
        }
        if task.role.trim().is_empty() {
            task.role = DEFAULT_ROLE.to_string();
        }

        let now = Utc::now();
        task.seq = self.next_task_seq;
        task.worker_id = None;
        task.worker_pid = None;
        task.context = None;
        task.failures = 0;
        task.status_reason = None;
        task.not_before = None;
        task.created_at = now;
        task.updated_at = now;

        let id = task.id.clone();
        clog!(
            "Task {} added: '{}' priority={} deps={}",
            id,
            task.title,
            task.priority,
            task.dependencies.len()
        );
        self.record(LedgerEvent::TaskAdded { task })?;
        Ok(id)
    }

    /// Move a task along one edge of the status state machine.
    pub fn update_status(&mut self, id: &TaskId, to: TaskStatus) -> Result<()> {
        self.transition(id, to, None)
    }

    /// Like [`update_status`](Self::update_status), keeping `reason` on the task.
    pub fn update_status_with_reason(
        &mut self,
        id: &TaskId,
        to: TaskStatus,
        reason: &str,
    ) -> Result<()> {
        self.transition(id, to, Some(reason.to_string()))
    }

    /// Put a ready task into `Running`, bound to `worker` and `context`.
    pub fn start_task(
        &mut self,
        id: &TaskId,
        worker: WorkerId,
        context: ExecutionContext,
    ) -> Result<()> {
        if &context.task_id != id {
            return Err(Error::Validation(format!(
                "Context {} belongs to task {}, not {}",
                context.id, context.task_id, id
            )));
        }
        self.transition(id, TaskStatus::Running, None)?;
        self.record(LedgerEvent::Assigned {
            id: id.clone(),
            worker,
            context,
        })
    }

    /// Record the process id of the worker bound to a running task.
    pub fn record_worker_pid(&mut self, id: &TaskId, pid: u32) -> Result<()> {
        let task = self.tasks.get(id).ok_or_else(|| Error::UnknownTask(id.clone()))?;
        if task.status != TaskStatus::Running || !task.is_assigned() {
            return Err(Error::Validation(format!(
                "Task {} has no running worker to attach pid {} to",
                id, pid
            )));
        }
        self.record(LedgerEvent::ProcessStarted {
            id: id.clone(),
            pid,
        })
    }

    /// Status transitions recorded since the last call, oldest first.
    pub fn take_changes(&mut self) -> Vec<StatusChange> {
        std::mem::take(&mut self.changes)
    }

    /// Explicit retry: `Failed -> Ready`, resetting the failure count.
    ///
    /// Dependents blocked by this task return to `Planned`.
    pub fn retry(&mut self, id: &TaskId) -> Result<()> {
        let task = self.tasks.get(id).ok_or_else(|| Error::UnknownTask(id.clone()))?;
        match task.status {
            TaskStatus::Failed if !self.is_terminal(task) => {}
            TaskStatus::Failed | TaskStatus::Done => {
                return Err(Error::TerminalState {
                    task: id.clone(),
                    status: task.status,
                })
            }
            other => {
                return Err(Error::InvalidTransition {
                    task: id.clone(),
                    from: other,
                    to: TaskStatus::Ready,
                })
            }
        }

        self.record(LedgerEvent::FailureRecorded {
            id: id.clone(),
            failures: 0,
            not_before: None,
            reason: None,
        })?;
        self.record(LedgerEvent::StatusChanged {
            id: id.clone(),
            from: TaskStatus::Failed,
            to: TaskStatus::Ready,
            reason: Some("retry".to_string()),
            at: Utc::now(),
        })?;
        clog!("Task {} retried", id);
        self.unblock_dependents(id)
    }

    /// Count one more failure against `id` and hold it back for `backoff`.
    /// Returns the new failure count.
    pub fn record_failure(&mut self, id: &TaskId, reason: &str, backoff: Duration) -> Result<u32> {
        let task = self.tasks.get(id).ok_or_else(|| Error::UnknownTask(id.clone()))?;
        let failures = task.failures + 1;
        let not_before = if backoff.is_zero() {
            None
        } else {
            let delay = chrono::Duration::from_std(backoff)
                .map_err(|e| Error::Validation(format!("backoff out of range: {}", e)))?;
            Some(Utc::now() + delay)
        };
        clog_debug!(
            "Task {} failure #{} ({}), backoff {:?}",
            id,
            failures,
            reason,
            backoff
        );
        self.record(LedgerEvent::FailureRecorded {
            id: id.clone(),
            failures,
            not_before,
            reason: Some(reason.to_string()),
        })?;
        Ok(failures)
    }

    /// Update the consecutive-failure counter of a worker role.
    /// Any success resets it to zero. Returns the new value.
    pub fn record_role_outcome(&mut self, role: &str, success: bool) -> Result<u32> {
        let current = self.role_failures(role);
        let next = if success { 0 } else { current + 1 };
        if next != current {
            self.record(LedgerEvent::RoleOutcome {
                role: role.to_string(),
                consecutive_failures: next,
            })?;
        }
        Ok(next)
    }

    /// Write a checkpoint now and truncate the change log.
    pub fn checkpoint(&mut self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let checkpoint = Checkpoint {
            seq: self.journal_seq,
            next_task_seq: self.next_task_seq,
            tasks: self.tasks().into_iter().cloned().collect(),
            role_failures: self.role_failures.clone(),
        };
        journal.write_checkpoint(&checkpoint)?;
        self.since_checkpoint = 0;
        Ok(())
    }

    fn transition(&mut self, id: &TaskId, to: TaskStatus, reason: Option<String>) -> Result<()> {
        let task = self.tasks.get(id).ok_or_else(|| Error::UnknownTask(id.clone()))?;
        let from = task.status;
        if self.is_terminal(task) {
            return Err(Error::TerminalState {
                task: id.clone(),
                status: from,
            });
        }
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from,
                to,
            });
        }
        if to == TaskStatus::Running {
            let deps_done = task.dependencies.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .map(Task::is_done)
                    .unwrap_or(false)
            });
            if !deps_done || task.is_assigned() {
                return Err(Error::InvalidTransition {
                    task: id.clone(),
                    from,
                    to,
                });
            }
        }
        let release = task.is_assigned() && from.is_in_flight() && !to.is_in_flight();

        clog_debug!("Task {} {} -> {}", id, from, to);
        self.record(LedgerEvent::StatusChanged {
            id: id.clone(),
            from,
            to,
            reason,
            at: Utc::now(),
        })?;
        if release {
            self.record(LedgerEvent::Released { id: id.clone() })?;
        }
        if to == TaskStatus::Failed {
            self.block_dependents(id)?;
        }
        Ok(())
    }

    fn block_dependents(&mut self, id: &TaskId) -> Result<()> {
        let reason = format!("dependency {} failed", id);
        for dependent in self.graph.transitive_dependents(id) {
            let schedulable = self
                .tasks
                .get(&dependent)
                .map(|t| t.status.is_schedulable())
                .unwrap_or(false);
            if schedulable {
                self.transition(&dependent, TaskStatus::Blocked, Some(reason.clone()))?;
            }
        }
        Ok(())
    }

    fn unblock_dependents(&mut self, id: &TaskId) -> Result<()> {
        for dependent in self.graph.transitive_dependents(id) {
            let Some(task) = self.tasks.get(&dependent) else {
                continue;
            };
            if task.status != TaskStatus::Blocked {
                continue;
            }
            let still_blocked = task.dependencies.iter().any(|dep| {
                self.tasks
                    .get(dep)
                    .map(|d| matches!(d.status, TaskStatus::Failed | TaskStatus::Blocked))
                    .unwrap_or(false)
            });
            if !still_blocked {
                let reason = format!("dependency {} retried", id);
                self.transition(&dependent, TaskStatus::Planned, Some(reason))?;
            }
        }
        Ok(())
    }

    /// Journal `event`, then apply it.
    fn record(&mut self, event: LedgerEvent) -> Result<()> {
        let change = match &event {
            LedgerEvent::StatusChanged {
                id,
                from,
                to,
                reason,
                ..
            } => Some(StatusChange {
                task: id.clone(),
                from: *from,
                to: *to,
                reason: reason.clone(),
            }),
            _ => None,
        };

        if let Some(journal) = &self.journal {
            let entry = JournalEntry {
                seq: self.journal_seq + 1,
                recorded_at: Utc::now(),
                event,
            };
            journal.append(&entry)?;
            self.journal_seq = entry.seq;
            self.apply(&entry.event)?;
            self.since_checkpoint += 1;
            if self.since_checkpoint >= self.options.snapshot_every {
                self.checkpoint()?;
            }
        } else {
            self.apply(&event)?;
        }

        self.changes.extend(change);
        Ok(())
    }

    /// The only place task state is mutated; used both live and for replay.
    fn apply(&mut self, event: &LedgerEvent) -> Result<()> {
        match event {
            LedgerEvent::TaskAdded { task } => {
                self.graph.insert(&task.id, &task.dependencies)?;
                self.next_task_seq = self.next_task_seq.max(task.seq + 1);
                self.tasks.insert(task.id.clone(), task.clone());
            }
            LedgerEvent::StatusChanged {
                id, to, reason, at, ..
            } => {
                let task = self.task_mut(id)?;
                task.status = *to;
                task.status_reason = reason.clone();
                task.updated_at = *at;
            }
            LedgerEvent::Assigned {
                id,
                worker,
                context,
            } => {
                let task = self.task_mut(id)?;
                task.worker_id = Some(*worker);
                task.worker_pid = None;
                task.context = Some(context.clone());
            }
            LedgerEvent::ProcessStarted { id, pid } => {
                self.task_mut(id)?.worker_pid = Some(*pid);
            }
            LedgerEvent::Released { id } => {
                let task = self.task_mut(id)?;
                task.worker_id = None;
                task.worker_pid = None;
                task.context = None;
            }
            LedgerEvent::FailureRecorded {
                id,
                failures,
                not_before,
                reason,
            } => {
                let task = self.task_mut(id)?;
                task.failures = *failures;
                task.not_before = *not_before;
                if reason.is_some() {
                    task.status_reason = reason.clone();
                }
            }
            LedgerEvent::RoleOutcome {
                role,
                consecutive_failures,
            } => {
                if *consecutive_failures == 0 {
                    self.role_failures.remove(role);
                } else {
                    self.role_failures
                        .insert(role.clone(), *consecutive_failures);
                }
            }
        }
        Ok(())
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| Error::UnknownTask(id.clone()))
    }
}
