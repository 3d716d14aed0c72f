//! Agent abstraction.
//!
//! The orchestration core never spawns agent processes itself. It hands each
//! dispatched task to an [`AgentExecutor`] together with a [`TaskContext`]
//! and receives a [`TaskResult`] back. The protocol an executor speaks to the
//! real agent is its own business.

use crate::core::{Task, TaskId};
use crate::error::Result;
use crate::orchestration::Strategy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an agent slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// What an agent slot is doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum AgentStatus {
    Idle,
    Running { task_id: TaskId },
}

/// An option a human may pick when a task asks for a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub effect: OptionEffect,
}

impl DecisionOption {
    pub fn new(id: &str, label: &str, effect: OptionEffect) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            effect,
        }
    }
}

/// What the engine does with a task once an option is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionEffect {
    /// Accept the output as is.
    #[default]
    Complete,
    /// Run the task again with the choice in its context.
    Redispatch,
    /// Treat the task as failed.
    Fail,
}

/// Outcome of one agent execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub requires_intervention: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Choices offered to the human; a non-empty list turns the
    /// intervention into a decision.
    #[serde(default)]
    pub options: Vec<DecisionOption>,
}

impl TaskResult {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn needs_approval(output: Value) -> Self {
        Self {
            success: true,
            output,
            requires_intervention: true,
            ..Default::default()
        }
    }

    pub fn needs_decision(output: Value, options: Vec<DecisionOption>) -> Self {
        Self {
            success: true,
            output,
            requires_intervention: true,
            options,
            ..Default::default()
        }
    }
}

/// Everything an agent is told about the task it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub session_id: String,
    pub strategy: Strategy,
    /// Outputs of the task's completed prerequisites.
    pub previous_results: BTreeMap<TaskId, Value>,
    /// Option chosen by a human when the task is dispatched again.
    pub decision: Option<String>,
    /// Changes a human asked for when sending the task back.
    #[serde(default)]
    pub modifications: Option<Map<String, Value>>,
    /// The prompt with prerequisite outputs appended.
    pub prompt: String,
}

impl TaskContext {
    pub fn new(
        session_id: &str,
        strategy: Strategy,
        task: &Task,
        previous_results: BTreeMap<TaskId, Value>,
        decision: Option<String>,
    ) -> Self {
        let prompt = render_prompt(task, &previous_results, decision.as_deref());
        Self {
            session_id: session_id.to_string(),
            strategy,
            previous_results,
            decision,
            modifications: None,
            prompt,
        }
    }

    /// Attach requested changes and list them at the end of the prompt.
    pub fn with_modifications(mut self, modifications: Map<String, Value>) -> Self {
        self.prompt.push_str("\n\n## Requested changes");
        for (field, value) in &modifications {
            self.prompt.push_str(&format!("\n- {}: {}", field, value_text(value)));
        }
        self.modifications = Some(modifications);
        self
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_prompt(task: &Task, previous: &BTreeMap<TaskId, Value>, decision: Option<&str>) -> String {
    let mut prompt = if task.prompt.is_empty() {
        task.name.clone()
    } else {
        task.prompt.clone()
    };

    if !task.description.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&task.description);
    }

    if !previous.is_empty() {
        prompt.push_str("\n\n## Context from previous tasks");
        for (id, output) in previous {
            prompt.push_str(&format!("\n\n### {}\n{}", id, value_text(output)));
        }
    }

    if let Some(choice) = decision {
        prompt.push_str(&format!("\n\n## Decision\n{}", choice));
    }

    prompt
}

/// Runs a task on an agent.
///
/// Implementations must be cancel safe: the engine drops the future when the
/// plan is cancelled or the execution times out.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, agent: AgentId, task: &Task, context: &TaskContext) -> Result<TaskResult>;
}

/// Executor that succeeds immediately without contacting any agent.
///
/// Tasks whose metadata sets `requires_approval = true` come back flagged
/// for intervention.
#[derive(Debug, Clone, Default)]
pub struct DryRunAgent;

#[async_trait]
impl AgentExecutor for DryRunAgent {
    async fn execute(&self, agent: AgentId, task: &Task, context: &TaskContext) -> Result<TaskResult> {
        tracing::debug!(task = %task.id, agent = %agent, "dry run");
        let output = serde_json::json!({
            "task": task.id,
            "role": task.role,
            "prompt": context.prompt,
        });
        let needs_approval = task
            .metadata
            .get("requires_approval")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if needs_approval {
            Ok(TaskResult::needs_approval(output))
        } else {
            Ok(TaskResult::success(output))
        }
    }
}
