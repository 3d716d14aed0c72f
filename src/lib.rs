//! MemNexus: coordinates AI agents working through a graph of dependent tasks.
//!
//! Planning flows one way: a [`core::DependencyGraph`] is validated and
//! turned into an [`orchestration::ExecutionPlan`] by the
//! [`orchestration::TaskScheduler`]. Execution is driven by the
//! [`orchestration::OrchestratorEngine`], which dispatches tasks to an
//! [`agent::AgentExecutor`] and pauses for humans through the
//! [`orchestration::InterventionSystem`].

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use error::{Error, Result};
