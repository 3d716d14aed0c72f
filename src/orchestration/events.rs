//! Progress events emitted by the engine.
//!
//! Events go out on a `tokio::sync::broadcast` channel. The engine never
//! waits on delivery: a lagging subscriber loses the oldest events, and a
//! plan with no subscribers runs the same as one with many.

use crate::agent::AgentId;
use crate::core::{Role, TaskId};
use crate::orchestration::engine::PlanStatus;
use crate::orchestration::intervention::{InterventionId, InterventionKind, InterventionStatus};
use crate::orchestration::scheduler::{Progress, Strategy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ProgressEvent {
    PlanStarted {
        session_id: String,
        strategy: Strategy,
        total: usize,
    },
    TaskStarted {
        task_id: TaskId,
        role: Role,
        agent_id: AgentId,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: String,
    },
    InterventionCreated {
        intervention_id: InterventionId,
        task_id: TaskId,
        kind: InterventionKind,
        title: String,
    },
    InterventionResolved {
        intervention_id: InterventionId,
        task_id: TaskId,
        status: InterventionStatus,
    },
    ProgressUpdated {
        progress: Progress,
    },
    PlanPaused,
    PlanResumed,
    PlanFinished {
        status: PlanStatus,
        progress: Progress,
    },
}

impl ProgressEvent {
    /// The task the event is about, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            ProgressEvent::TaskStarted { task_id, .. }
            | ProgressEvent::TaskCompleted { task_id }
            | ProgressEvent::TaskFailed { task_id, .. }
            | ProgressEvent::TaskSkipped { task_id, .. }
            | ProgressEvent::InterventionCreated { task_id, .. }
            | ProgressEvent::InterventionResolved { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}
