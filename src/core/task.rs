//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of work assigned to agents. Each task
//! tracks its role, prerequisites, status, assignment, and result.

use crate::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of a task within a plan.
///
/// Task ids are supplied by the plan author (`design`, `backend`, ...) and
/// are ordered, so every tie-break on task identity is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a task identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role an agent plays, and therefore the kind of agent a task needs.
///
/// The well-known roles are closed variants so role-based dispatch is
/// checked exhaustively; `Other` carries any role the plan invents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Architect,
    Backend,
    Frontend,
    Tester,
    Reviewer,
    Devops,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Architect => "architect",
            Role::Backend => "backend",
            Role::Frontend => "frontend",
            Role::Tester => "tester",
            Role::Reviewer => "reviewer",
            Role::Devops => "devops",
            Role::Other(name) => name,
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "architect" => Role::Architect,
            "backend" => Role::Backend,
            "frontend" => Role::Frontend,
            "tester" => Role::Tester,
            "reviewer" => Role::Reviewer,
            "devops" => Role::Devops,
            _ => Role::Other(s),
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Role::from(s.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl std::str::FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Role::from(s))
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task status in its lifecycle.
///
/// `Completed`, `Failed` and `Skipped` are terminal. Only `Completed`
/// satisfies a dependent's prerequisite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for prerequisites.
    #[default]
    Pending,
    /// Every prerequisite is completed; waiting for an agent.
    Ready,
    /// Being executed by an agent.
    Running,
    /// Execution finished but a human has to settle the outcome.
    WaitingForApproval,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Never attempted.
    Skipped {
        /// Why the task was not attempted.
        reason: String,
    },
}

impl TaskStatus {
    /// Check if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }

    /// Short name of the status without its payload.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::WaitingForApproval => "waiting_for_approval",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Skipped { .. } => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A single task in the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable name for the task.
    pub name: String,
    /// Detailed description of what the task should accomplish.
    pub description: String,
    /// Role of the agent that has to run this task.
    pub role: Role,
    /// Instructions handed to the agent.
    pub prompt: String,
    /// Prerequisite tasks, in declaration order.
    pub dependencies: Vec<TaskId>,
    /// Declared duration in abstract units. Unit cost when absent.
    pub duration: Option<u32>,
    /// Free-form metadata carried through to the agent.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Current execution status.
    pub status: TaskStatus,
    /// Agent currently or last assigned to this task.
    pub agent_id: Option<AgentId>,
    /// Output of the last execution.
    pub result: Option<Value>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task last started execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task with no prerequisites.
    pub fn new(id: impl Into<TaskId>, name: &str, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            description: String::new(),
            role,
            prompt: String::new(),
            dependencies: Vec::new(),
            duration: None,
            metadata: Map::new(),
            status: TaskStatus::Pending,
            agent_id: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = prompt.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_duration(mut self, duration: u32) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Cost of the task on the critical path.
    pub fn weight(&self) -> u64 {
        u64::from(self.duration.unwrap_or(1))
    }

    /// Transition to Ready. Callers guarantee every prerequisite is completed.
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Start execution on the given agent.
    pub fn start(&mut self, agent_id: AgentId) {
        self.status = TaskStatus::Running;
        self.agent_id = Some(agent_id);
        self.started_at = Some(Utc::now());
    }

    /// Park the task until a human settles its outcome.
    pub fn await_approval(&mut self) {
        self.status = TaskStatus::WaitingForApproval;
    }

    /// Put the task back in line for another execution.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Mark the task as successfully completed.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as failed with an error message.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as skipped without running it.
    pub fn skip(&mut self, reason: &str) {
        self.status = TaskStatus::Skipped {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the task can still be dispatched (Pending or Ready).
    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }
}

/// Task descriptor as supplied by the plan author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub name: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "deps")]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TaskSpec {
    pub fn new(id: &str, role: Role) -> Self {
        Self {
            id: TaskId::from(id),
            name: None,
            role,
            prompt: String::new(),
            description: String::new(),
            dependencies: Vec::new(),
            duration: None,
            metadata: Map::new(),
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| TaskId::from(*d)).collect();
        self
    }

    pub fn with_duration(mut self, duration: u32) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Build the live task. The name defaults to the id.
    pub fn into_task(self) -> Task {
        let name = self.name.unwrap_or_else(|| self.id.to_string());
        let mut task = Task::new(self.id, &name, self.role)
            .with_prompt(&self.prompt)
            .with_description(&self.description);
        task.dependencies = self.dependencies;
        task.duration = self.duration;
        task.metadata = self.metadata;
        task
    }
}
