use thiserror::Error;

use crate::core::{Role, TaskId};
use crate::orchestration::{InterventionId, InterventionStatus, PlanStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Cycle detected in dependencies: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("No agent capacity for role {0}")]
    NoCapacityForRole(Role),

    #[error("Intervention not found: {0}")]
    InterventionNotFound(InterventionId),

    #[error("Intervention {id} already resolved ({status})")]
    AlreadyResolved {
        id: InterventionId,
        status: InterventionStatus,
    },

    #[error("Invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("Intervention {0} is no longer tracked")]
    InterventionClosed(InterventionId),

    #[error("Plan already finished ({status})")]
    PlanTerminal { status: PlanStatus },

    #[error("Invalid plan transition from {from} to {to}")]
    InvalidPlanTransition { from: PlanStatus, to: PlanStatus },

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}
