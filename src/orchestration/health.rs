//! Health monitoring for workers.
//!
//! The `HealthMonitor` polls every worker in the pool on a fixed interval and
//! reports two kinds of trouble: processes that exited, and processes that
//! have been silent for longer than the unresponsive timeout. It also owns
//! the restart policy: how many failures a task may accumulate before it is
//! given up on, and how long to back off between attempts.

use std::time::{Duration, Instant};

use crate::config::HealthSettings;
use crate::core::TaskId;
use crate::orchestration::{WorkerId, WorkerPool, WorkerState};
use crate::{clog_debug, clog_warn};

/// Default number of restarts before a task is marked failed.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Configuration for health monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// How often workers are polled.
    pub poll_interval: Duration,
    /// Silence after which a worker is considered unresponsive.
    pub unresponsive_timeout: Duration,
    /// Restarts allowed per task.
    pub max_restarts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Time between SIGTERM and SIGKILL when stopping a worker.
    pub grace_period: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from(&HealthSettings::default())
    }
}

impl From<&HealthSettings> for HealthConfig {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            unresponsive_timeout: Duration::from_secs(settings.unresponsive_timeout_secs),
            max_restarts: settings.max_restarts,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
            grace_period: Duration::from_millis(settings.grace_period_ms),
        }
    }
}

/// Trouble found by a health poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// No output for longer than the unresponsive timeout.
    Unresponsive {
        worker: WorkerId,
        task: TaskId,
        idle: Duration,
    },
    /// The process is gone.
    Exited {
        worker: WorkerId,
        task: TaskId,
        /// `None` when killed by a signal.
        code: Option<i32>,
    },
}

impl HealthEvent {
    pub fn worker(&self) -> WorkerId {
        match self {
            HealthEvent::Unresponsive { worker, .. } | HealthEvent::Exited { worker, .. } => {
                *worker
            }
        }
    }

    pub fn task(&self) -> &TaskId {
        match self {
            HealthEvent::Unresponsive { task, .. } | HealthEvent::Exited { task, .. } => task,
        }
    }
}

/// What to do with a task whose worker failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Requeue the task, not before `backoff` has elapsed.
    Restart { backoff: Duration },
    /// Restart budget exhausted; mark the task failed.
    GiveUp,
}

pub struct HealthMonitor {
    config: HealthConfig,
    last_poll: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            last_poll: None,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Whether a poll interval has passed since the last check.
    pub fn due(&self) -> bool {
        self.last_poll
            .map(|t| t.elapsed() >= self.config.poll_interval)
            .unwrap_or(true)
    }

    /// Poll every worker in the pool.
    ///
    /// Silent workers are marked `Unresponsive` and reported once; exited
    /// workers are reported on every poll until removed from the pool.
    pub fn check(&mut self, pool: &mut WorkerPool) -> Vec<HealthEvent> {
        self.last_poll = Some(Instant::now());
        let mut events = Vec::new();
        for worker in pool.iter_mut() {
            if !worker.is_alive() {
                events.push(HealthEvent::Exited {
                    worker: worker.id(),
                    task: worker.task_id().clone(),
                    code: worker.exit_code(),
                });
                continue;
            }
            if worker.state() == WorkerState::Unresponsive {
                continue;
            }
            let idle = worker.idle_duration();
            if idle > self.config.unresponsive_timeout {
                clog_warn!(
                    "Worker {} (task {}) silent for {:?}",
                    worker.id(),
                    worker.task_id(),
                    idle
                );
                worker.mark_unresponsive();
                events.push(HealthEvent::Unresponsive {
                    worker: worker.id(),
                    task: worker.task_id().clone(),
                    idle,
                });
            }
        }
        if !events.is_empty() {
            clog_debug!("Health poll found {} event(s)", events.len());
        }
        events
    }

    /// Policy for a task that has now failed `failures` times.
    pub fn decide(&self, failures: u32) -> RecoveryAction {
        if failures > self.config.max_restarts {
            RecoveryAction::GiveUp
        } else {
            RecoveryAction::Restart {
                backoff: self.backoff(failures),
            }
        }
    }

    /// Exponential backoff: `base * 2^(failures-1)`, capped at the maximum.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.config
            .backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.config.backoff_max)
    }
}
