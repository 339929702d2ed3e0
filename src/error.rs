use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::task::{TaskId, TaskStatus};
use crate::orchestration::{ConflictFile, WorkerId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("File watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Task already exists: {0}")]
    DuplicateId(TaskId),

    #[error("Task not found: {0}")]
    UnknownTask(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Invalid transition for task {task} from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task} is in terminal state {status}")]
    TerminalState { task: TaskId, status: TaskStatus },

    #[error("Queue for {recipient} is full (capacity: {capacity})")]
    QueueFull { recipient: String, capacity: usize },

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Failed to start worker for role {role}: {reason}")]
    WorkerStart { role: String, reason: String },

    #[error("Worker {worker} unresponsive for {idle:?}")]
    WorkerUnresponsive { worker: WorkerId, idle: Duration },

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Merge conflict for task {task} in {}", conflict_paths(.conflicts))]
    MergeConflict {
        task: TaskId,
        conflicts: Vec<ConflictFile>,
    },

    #[error("Independence unknown for task {0}: no resource ownership declared")]
    IndependenceUnknown(TaskId),

    #[error("Supervisor already running (lock file {0})")]
    SupervisorLocked(PathBuf),

    #[error("Supervisor is not running")]
    SupervisorStopped,
}

impl Error {
    /// Process lifecycle and backpressure failures that a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QueueFull { .. }
                | Error::WorkerStart { .. }
                | Error::WorkerUnresponsive { .. }
        )
    }
}

fn conflict_paths(conflicts: &[ConflictFile]) -> String {
    conflicts
        .iter()
        .map(|c| c.path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
