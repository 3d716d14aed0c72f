//! Core domain models for orchestration.
//!
//! Tasks and the dependency graph over them. Everything here is plain data
//! and synchronous computation; execution lives in `orchestration`.

pub mod dag;
pub mod task;

pub use dag::{CriticalPath, DependencyGraph, GraphSummary};
pub use task::{Role, Task, TaskId, TaskSpec, TaskStatus};
