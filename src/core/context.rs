//! Execution context records.
//!
//! An execution context is the isolated working copy one task runs in. The
//! record is what the ledger persists; the git worktree behind it is owned by
//! the worktree coordinator.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::TaskId;

/// Unique identifier for an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, used in branch and directory names.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An isolated copy of the baseline bound to exactly one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub id: ContextId,
    pub task_id: TaskId,
    /// Working directory of the worktree.
    pub path: PathBuf,
    /// Branch the task commits to.
    pub branch: String,
    /// Baseline commit the context was branched from.
    pub base_revision: String,
    /// Whether uncommitted changes were seen at the last inspection.
    #[serde(default)]
    pub dirty: bool,
    pub created_at: DateTime<Utc>,
}
