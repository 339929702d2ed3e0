//! Core domain models for convoy orchestration.
//!
//! Tasks, their execution contexts, and the dependency graph between them.

pub mod context;
pub mod graph;
pub mod task;

pub use context::{ContextId, ExecutionContext};
pub use graph::DependencyGraph;
pub use task::{Task, TaskId, TaskStatus, DEFAULT_ROLE};
