//! Task data model for the ledger.
//!
//! Tasks are the atomic units of work handed to workers. Each task tracks
//! its status, priority, declared dependencies and resource ownership, the
//! worker and execution context bound to it, and its failure history.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::context::ExecutionContext;
use crate::orchestration::WorkerId;
use crate::{Error, Result};

/// Role used when a task does not name one.
pub const DEFAULT_ROLE: &str = "default";

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("task id pattern is valid")
    })
}

/// Identifier assigned to a task by the planning collaborator.
///
/// Ids are short human-chosen strings (`T1`, `auth-model`). They are checked
/// against the allowed character set when a task enters the ledger, because
/// they end up in branch and directory names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Parse and validate a task id.
    pub fn parse(s: &str) -> Result<Self> {
        let id = Self(s.to_string());
        id.validate()?;
        Ok(id)
    }

    /// Check the id against the allowed character set.
    pub fn validate(&self) -> Result<()> {
        if id_pattern().is_match(&self.0) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "invalid task id '{}': use 1-64 characters from [A-Za-z0-9._-]",
                self.0
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Task status in its lifecycle.
///
/// ```text
/// Planned -> SpecReady -> Ready -> Running -> AwaitingMerge -> Done
///    |           |          |        |  \-> Done              \-> Failed
///    +-----------+----------+-> Blocked  \-> Failed
///                                    \-> Ready (requeue)
/// Blocked -> Planned
/// Failed  -> Ready (explicit retry only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task recorded by the planner, no specification yet.
    #[default]
    Planned,
    /// Task specification written.
    SpecReady,
    /// Task can be picked up once its dependencies are done.
    Ready,
    /// A worker is executing the task in its own context.
    Running,
    /// The worker finished; the context waits to be merged.
    AwaitingMerge,
    /// Work merged into the baseline. Immutable.
    Done,
    /// Task failed; visible with its reason until retried.
    Failed,
    /// Task cannot proceed because a dependency failed.
    Blocked,
}

impl TaskStatus {
    /// Whether the state machine has an edge from `self` to `next`.
    ///
    /// `Failed -> Ready` is deliberately absent: it is only reachable
    /// through the ledger's explicit retry action.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Planned, SpecReady)
                | (Planned, Blocked)
                | (SpecReady, Ready)
                | (SpecReady, Blocked)
                | (Ready, Running)
                | (Ready, Blocked)
                // could not be dispatched within the restart budget
                | (Ready, Failed)
                | (Blocked, Planned)
                | (Running, AwaitingMerge)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Ready)
                | (AwaitingMerge, Done)
                | (AwaitingMerge, Failed)
        )
    }

    /// Statuses the scheduler may pick a task up from.
    pub fn is_schedulable(self) -> bool {
        matches!(
            self,
            TaskStatus::Planned | TaskStatus::SpecReady | TaskStatus::Ready
        )
    }

    /// Statuses in which a task owns a worker and/or a context.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::AwaitingMerge)
    }

    /// Intermediate statuses needed to walk a schedulable task to `Ready`.
    pub fn path_to_ready(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Planned => &[TaskStatus::SpecReady, TaskStatus::Ready],
            TaskStatus::SpecReady => &[TaskStatus::Ready],
            _ => &[],
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Planned => "planned",
            TaskStatus::SpecReady => "spec_ready",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingMerge => "awaiting_merge",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

/// A unit of planned work in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier chosen by the planner.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// Prompt handed to the worker.
    #[serde(default)]
    pub description: String,
    /// Worker role that executes this task.
    #[serde(default = "default_role")]
    pub role: String,
    /// Current status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Priority rank; lower is more urgent.
    pub priority: u32,
    /// Tasks that must be `Done` before this one may run.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Declared resource ownership (file paths, data entities).
    /// `None` means the planner did not declare any and independence is unknown.
    #[serde(default)]
    pub resources: Option<BTreeSet<String>>,
    /// Ledger insertion order, assigned by the ledger.
    #[serde(default)]
    pub seq: u64,
    /// Worker currently bound to the task.
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    /// Process id of that worker, once spawned.
    #[serde(default)]
    pub worker_pid: Option<u32>,
    /// Execution context while `Running`/`AwaitingMerge`.
    #[serde(default)]
    pub context: Option<ExecutionContext>,
    /// Failures recorded against this task (worker crashes, hangs, conflicts).
    #[serde(default)]
    pub failures: u32,
    /// Reason attached to the latest status change.
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Earliest time the scheduler may dispatch the task again.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a planned task with no dependencies and unknown ownership.
    pub fn new(id: impl Into<TaskId>, title: &str, priority: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.to_string(),
            description: String::new(),
            role: default_role(),
            status: TaskStatus::Planned,
            priority,
            dependencies: BTreeSet::new(),
            resources: None,
            seq: 0,
            worker_id: None,
            worker_pid: None,
            context: None,
            failures: 0,
            status_reason: None,
            not_before: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = role.to_string();
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = Some(resources.into_iter().map(Into::into).collect());
        self
    }

    /// Check if the task is `Done`.
    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    /// Check if the task is assigned to a worker.
    pub fn is_assigned(&self) -> bool {
        self.worker_id.is_some()
    }

    /// Check if the task is still backing off at `now`.
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map(|t| t > now).unwrap_or(false)
    }

    /// Prompt passed to the worker: the description, or the title when empty.
    pub fn prompt(&self) -> &str {
        if self.description.trim().is_empty() {
            &self.title
        } else {
            &self.description
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // TaskId tests

    #[test]
    fn test_task_id_parse_valid() {
        assert!(TaskId::parse("T1").is_ok());
        assert!(TaskId::parse("auth-model_v2.1").is_ok());
    }

    #[test]
    fn test_task_id_parse_invalid() {
        assert!(TaskId::parse("").is_err());
        assert!(TaskId::parse("-leading").is_err());
        assert!(TaskId::parse("has space").is_err());
        assert!(TaskId::parse("a/b").is_err());
        assert!(TaskId::parse(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_task_id_from_str() {
        let id: TaskId = "T42".parse().unwrap();
        assert_eq!(id.as_str(), "T42");
        assert_eq!(id.to_string(), "T42");
    }

    #[test]
    fn test_task_id_serialization_is_transparent() {
        let json = serde_json::to_string(&TaskId::from("T1")).unwrap();
        assert_eq!(json, "\"T1\"");
    }

    // TaskStatus tests

    #[test]
    fn test_task_status_default() {
        assert_eq!(TaskStatus::default(), TaskStatus::Planned);
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::SpecReady.to_string(), "spec_ready");
        assert_eq!(TaskStatus::AwaitingMerge.to_string(), "awaiting_merge");
    }

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::AwaitingMerge).unwrap();
        assert_eq!(json, "\"awaiting_merge\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::AwaitingMerge);
    }

    #[test]
    fn test_main_line_transitions_allowed() {
        use TaskStatus::*;
        let path = [Planned, SpecReady, Ready, Running, AwaitingMerge, Done];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
        assert!(Running.can_transition_to(Done));
        assert!(Running.can_transition_to(Failed));
        assert!(AwaitingMerge.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Failed));
    }

    #[test]
    fn test_skipping_transitions_rejected() {
        use TaskStatus::*;
        assert!(!Planned.can_transition_to(Running));
        assert!(!Planned.can_transition_to(Done));
        assert!(!Ready.can_transition_to(Done));
        assert!(!Ready.can_transition_to(AwaitingMerge));
        assert!(!AwaitingMerge.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_statuses_have_no_edges() {
        use TaskStatus::*;
        let all = [
            Planned,
            SpecReady,
            Ready,
            Running,
            AwaitingMerge,
            Done,
            Failed,
            Blocked,
        ];
        for next in all {
            assert!(!Done.can_transition_to(next));
            assert!(!Failed.can_transition_to(next), "retry is not an edge");
        }
    }

    #[test]
    fn test_path_to_ready() {
        assert_eq!(
            TaskStatus::Planned.path_to_ready(),
            &[TaskStatus::SpecReady, TaskStatus::Ready]
        );
        assert_eq!(TaskStatus::SpecReady.path_to_ready(), &[TaskStatus::Ready]);
        assert!(TaskStatus::Ready.path_to_ready().is_empty());
    }

    #[test]
    fn test_schedulable_and_in_flight() {
        assert!(TaskStatus::Planned.is_schedulable());
        assert!(TaskStatus::Ready.is_schedulable());
        assert!(!TaskStatus::Blocked.is_schedulable());
        assert!(TaskStatus::Running.is_in_flight());
        assert!(TaskStatus::AwaitingMerge.is_in_flight());
        assert!(!TaskStatus::Done.is_in_flight());
    }

    // Task tests

    #[test]
    fn test_task_new() {
        let task = Task::new("T1", "Create user model", 1);
        assert_eq!(task.id, TaskId::from("T1"));
        assert_eq!(task.status, TaskStatus::Planned);
        assert_eq!(task.role, DEFAULT_ROLE);
        assert!(task.dependencies.is_empty());
        assert!(task.resources.is_none());
        assert!(!task.is_assigned());
        assert_eq!(task.failures, 0);
    }

    #[test]
    fn test_task_builders() {
        let task = Task::new("T4", "Wire API", 2)
            .with_description("Expose the user model over HTTP")
            .with_role("implementer")
            .with_dependencies(["T1"])
            .with_resources(["src/api.py"]);
        assert!(task.dependencies.contains(&TaskId::from("T1")));
        assert!(task.resources.as_ref().unwrap().contains("src/api.py"));
        assert_eq!(task.role, "implementer");
        assert_eq!(task.prompt(), "Expose the user model over HTTP");
    }

    #[test]
    fn test_prompt_falls_back_to_title() {
        let task = Task::new("T1", "Create user model", 1);
        assert_eq!(task.prompt(), "Create user model");
    }

    #[test]
    fn test_is_backing_off() {
        let mut task = Task::new("T1", "t", 1);
        let now = Utc::now();
        assert!(!task.is_backing_off(now));
        task.not_before = Some(now + chrono::Duration::seconds(5));
        assert!(task.is_backing_off(now));
        assert!(!task.is_backing_off(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_task_deserializes_planner_toml() {
        let toml_src = r#"
            id = "T2"
            title = "Add login form"
            priority = 2
            dependencies = ["T1"]
            resources = ["web/login.html"]
        "#;
        let task: Task = toml::from_str(toml_src).unwrap();
        assert_eq!(task.id, TaskId::from("T2"));
        assert_eq!(task.status, TaskStatus::Planned);
        assert_eq!(task.role, DEFAULT_ROLE);
        assert_eq!(task.dependencies.len(), 1);
        assert!(task.resources.is_some());
    }

    #[test]
    fn test_task_without_resources_deserializes_as_unknown() {
        let task: Task =
            serde_json::from_str(r#"{"id":"T3","title":"x","priority":1}"#).unwrap();
        assert!(task.resources.is_none());
    }
}
