//! Ledger change events.
//!
//! Every ledger mutation is expressed as one event. Events are journaled
//! before they are applied, and replaying the journal over the last
//! checkpoint reproduces the ledger exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ExecutionContext, Task, TaskId, TaskStatus};
use crate::orchestration::WorkerId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    TaskAdded {
        task: Task,
    },
    StatusChanged {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    Assigned {
        id: TaskId,
        worker: WorkerId,
        context: ExecutionContext,
    },
    ProcessStarted {
        id: TaskId,
        pid: u32,
    },
    Released {
        id: TaskId,
    },
    FailureRecorded {
        id: TaskId,
        failures: u32,
        #[serde(default)]
        not_before: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RoleOutcome {
        role: String,
        consecutive_failures: u32,
    },
}

impl LedgerEvent {
    /// Task the event concerns, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            LedgerEvent::TaskAdded { task } => Some(&task.id),
            LedgerEvent::StatusChanged { id, .. }
            | LedgerEvent::Assigned { id, .. }
            | LedgerEvent::ProcessStarted { id, .. }
            | LedgerEvent::Released { id }
            | LedgerEvent::FailureRecorded { id, .. } => Some(id),
            LedgerEvent::RoleOutcome { .. } => None,
        }
    }
}

/// A status transition, as published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub task: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One line of the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: LedgerEvent,
}
