//! Orchestration layer: everything between the ledger and the worker
//! processes.
//!
//! The [`Supervisor`] composes the [`TaskScheduler`] (what may run now), the
//! [`WorkerPool`] and [`HealthMonitor`] (processes and their liveness) and
//! the [`WorktreeCoordinator`] (isolated contexts and merging).

mod coordinator;
mod health;
mod inbox;
mod pool;
mod role;
mod scheduler;
mod supervisor;
mod worker;

pub use coordinator::{ConflictFile, LineRange, MergeOutcome, WorktreeCoordinator, TASK_BRANCH_PREFIX};
pub use health::{HealthConfig, HealthEvent, HealthMonitor, RecoveryAction, DEFAULT_MAX_RESTARTS};
pub use inbox::{Inbox, InboxRequest};
pub use pool::WorkerPool;
pub use role::WorkerCommand;
pub use scheduler::{resources_overlap, DeferReason, IndependenceEvidence, TaskScheduler, WorkItemBatch};
pub use supervisor::{Subscription, Supervisor, SupervisorHandle, SupervisorState};
pub use worker::{
    process_alive, terminate_pid, WorkerEnvelope, WorkerHandle, WorkerId, WorkerReport,
    WorkerState,
};
