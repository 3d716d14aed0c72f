//! Orchestration layer for the MemNexus multi-agent system.
//!
//! This module turns a task graph into an execution plan and drives it:
//! the scheduler picks phases and capacity, the agent pool hands out agent
//! slots, the intervention system collects human decisions, and the engine
//! ties them together in a single coordinating loop.

mod engine;
mod events;
mod intervention;
mod pool;
mod scheduler;

pub use engine::{EngineConfig, EngineHandle, OrchestratorEngine, PlanReport, PlanStatus};
pub use events::ProgressEvent;
pub use intervention::{
    ConditionOperator, ErrorSeverity, InterventionId, InterventionKind, InterventionPoint,
    InterventionPolicy, InterventionRequest, InterventionStatus, InterventionSystem, Resolution,
    ResolutionAction, TriggerCondition, SYSTEM_RESOLVER,
};
pub use pool::{AgentHandle, AgentPool};
pub use scheduler::{
    AgentCapacity, Bottleneck, ExecutionPlan, PlanAnalysis, PlanRequest, Progress, Strategy,
    Suggestion, SuggestionKind, TaskScheduler,
};
