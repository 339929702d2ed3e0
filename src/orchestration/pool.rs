//! Worker pool.
//!
//! The `WorkerPool` owns every live [`WorkerHandle`], enforces the worker
//! limit and provides lifecycle operations over the whole set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::bus::MessageBus;
use crate::core::{ExecutionContext, Task, TaskId};
use crate::orchestration::{WorkerCommand, WorkerHandle, WorkerId};
use crate::{clog, clog_warn, Error, Result};

/// Manages the set of running workers.
///
/// # Example
///
/// ```ignore
/// let bus = Arc::new(MessageBus::new(256));
/// let pool = WorkerPool::new(3, bus, log_dir, Duration::from_secs(5));
///
/// assert!(pool.has_capacity());
/// assert_eq!(pool.active_count(), 0);
/// ```
pub struct WorkerPool {
    workers: HashMap<WorkerId, WorkerHandle>,
    max_workers: usize,
    bus: Arc<MessageBus>,
    log_dir: PathBuf,
    /// How long a worker gets between SIGTERM and SIGKILL.
    grace: Duration,
}

impl WorkerPool {
    pub fn new(max_workers: usize, bus: Arc<MessageBus>, log_dir: PathBuf, grace: Duration) -> Self {
        Self {
            workers: HashMap::new(),
            max_workers,
            bus,
            log_dir,
            grace,
        }
    }

    /// Start a worker for `task` in `context`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStart` if the pool is full or the process cannot be
    /// launched.
    pub fn spawn(
        &mut self,
        id: WorkerId,
        command: &WorkerCommand,
        task: &Task,
        context: &ExecutionContext,
    ) -> Result<WorkerId> {
        if !self.has_capacity() {
            return Err(Error::WorkerStart {
                role: command.role().to_string(),
                reason: format!("pool is at capacity ({} workers)", self.max_workers),
            });
        }
        let handle = WorkerHandle::start(
            id,
            command,
            task,
            context,
            Arc::clone(&self.bus),
            &self.log_dir,
        )?;
        self.workers.insert(id, handle);
        Ok(id)
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &WorkerId) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(id)
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    /// Worker currently executing `task`, if any.
    pub fn find_by_task(&self, task: &TaskId) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|w| w.task_id() == task)
            .map(|w| w.id())
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.workers.len() < self.max_workers
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerHandle> {
        self.workers.values_mut()
    }

    /// Stop a worker and remove it from the pool.
    pub async fn stop(&mut self, id: &WorkerId, graceful: bool) -> Result<WorkerHandle> {
        let mut handle = self.workers.remove(id).ok_or(Error::WorkerNotFound(*id))?;
        handle.stop(graceful, self.grace).await?;
        Ok(handle)
    }

    /// Stop every worker: SIGTERM all at once, wait up to `drain`, then kill
    /// whatever is left. Returns the number of workers that had to be killed.
    pub async fn shutdown(&mut self, drain: Duration) -> usize {
        if self.workers.is_empty() {
            return 0;
        }
        clog!("Stopping {} worker(s)", self.workers.len());
        let mut handles: Vec<WorkerHandle> = self.workers.drain().map(|(_, h)| h).collect();
        for handle in handles.iter_mut() {
            handle.request_stop().await;
        }

        let deadline = tokio::time::Instant::now() + drain;
        let exited = join_all(handles.iter_mut().map(|h| h.wait_until(deadline))).await;

        let mut forced = 0;
        for (handle, exited) in handles.iter_mut().zip(exited) {
            if !exited {
                forced += 1;
                clog_warn!(
                    "Worker {} (task {}) did not exit within {:?}, killing",
                    handle.id(),
                    handle.task_id(),
                    drain
                );
            }
            if let Err(e) = handle.stop(false, Duration::ZERO).await {
                clog_warn!("Failed to stop worker {}: {}", handle.id(), e);
            }
        }
        forced
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("active", &self.workers.len())
            .field("max_workers", &self.max_workers)
            .finish()
    }
}
