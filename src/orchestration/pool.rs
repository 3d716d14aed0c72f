//! Agent pool for multi-agent management.
//!
//! The `AgentPool` holds one slot per agent the plan may use, grouped by
//! role and sized from the plan's effective capacity. The engine acquires
//! the first idle slot of a role when it dispatches a task and releases it
//! when the execution settles. Under the sequential strategy a global limit
//! of one busy slot applies on top of the per-role capacity.

use crate::agent::{AgentId, AgentStatus};
use crate::core::{Role, TaskId};
use crate::orchestration::scheduler::AgentCapacity;
use std::collections::{BTreeMap, HashMap};

/// A slot in the pool.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    /// Unique identifier for this agent.
    pub id: AgentId,
    /// Display name, e.g. `backend-2`.
    pub name: String,
    pub role: Role,
    /// Current status of the agent.
    pub status: AgentStatus,
}

impl AgentHandle {
    /// Create an idle agent handle.
    pub fn new(role: Role, name: String) -> Self {
        Self {
            id: AgentId::new(),
            name,
            role,
            status: AgentStatus::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.status, AgentStatus::Idle)
    }

    /// The task this agent is working on, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match &self.status {
            AgentStatus::Running { task_id } => Some(task_id),
            AgentStatus::Idle => None,
        }
    }
}

/// Agent slots by role.
///
/// # Example
///
/// ```ignore
/// let capacity = AgentCapacity::new().with(Role::Backend, 2);
/// let mut pool = AgentPool::new(&capacity, None);
/// let agent = pool.acquire(&Role::Backend, &task_id).unwrap();
/// pool.release(&agent);
/// ```
#[derive(Debug)]
pub struct AgentPool {
    /// Slots per role, in creation order.
    slots: BTreeMap<Role, Vec<AgentHandle>>,
    /// Role of each agent, for release.
    roles: HashMap<AgentId, Role>,
    /// System-wide cap on busy agents.
    global_limit: Option<usize>,
}

impl AgentPool {
    /// Create a pool with `capacity` slots per role.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Per-role slot counts
    /// * `global_limit` - Optional cap on busy agents across all roles
    pub fn new(capacity: &AgentCapacity, global_limit: Option<usize>) -> Self {
        let mut slots = BTreeMap::new();
        let mut roles = HashMap::new();
        for (role, &count) in capacity.iter() {
            let handles: Vec<AgentHandle> = (1..=count)
                .map(|n| AgentHandle::new(role.clone(), format!("{}-{}", role, n)))
                .collect();
            for handle in &handles {
                roles.insert(handle.id, role.clone());
            }
            slots.insert(role.clone(), handles);
        }
        Self {
            slots,
            roles,
            global_limit,
        }
    }

    /// Take the first idle agent of a role for the given task.
    ///
    /// Returns `None` when the role is saturated or the global limit is hit.
    pub fn acquire(&mut self, role: &Role, task_id: &TaskId) -> Option<AgentId> {
        if let Some(limit) = self.global_limit {
            if self.active_count() >= limit {
                return None;
            }
        }
        let handle = self.slots.get_mut(role)?.iter_mut().find(|h| h.is_idle())?;
        handle.status = AgentStatus::Running {
            task_id: task_id.clone(),
        };
        Some(handle.id)
    }

    /// Return an agent to the idle set. Unknown ids are ignored.
    pub fn release(&mut self, id: &AgentId) {
        let Some(role) = self.roles.get(id) else {
            return;
        };
        if let Some(handle) = self
            .slots
            .get_mut(role)
            .and_then(|handles| handles.iter_mut().find(|h| &h.id == id))
        {
            handle.status = AgentStatus::Idle;
        }
    }

    /// Whether an agent of the role could be acquired right now.
    pub fn has_capacity(&self, role: &Role) -> bool {
        let under_global = self
            .global_limit
            .map_or(true, |limit| self.active_count() < limit);
        under_global && self.idle_count(role) > 0
    }

    /// Get an agent by ID.
    pub fn get(&self, id: &AgentId) -> Option<&AgentHandle> {
        let role = self.roles.get(id)?;
        self.slots.get(role)?.iter().find(|h| &h.id == id)
    }

    /// Number of busy agents across all roles.
    pub fn active_count(&self) -> usize {
        self.slots
            .values()
            .flatten()
            .filter(|h| !h.is_idle())
            .count()
    }

    /// Number of busy agents of a role.
    pub fn busy_count(&self, role: &Role) -> usize {
        self.slots
            .get(role)
            .map_or(0, |handles| handles.iter().filter(|h| !h.is_idle()).count())
    }

    pub fn idle_count(&self, role: &Role) -> usize {
        self.slots
            .get(role)
            .map_or(0, |handles| handles.iter().filter(|h| h.is_idle()).count())
    }

    /// Total number of slots.
    pub fn size(&self) -> usize {
        self.roles.len()
    }

    /// All agents, grouped by role.
    pub fn agents(&self) -> impl Iterator<Item = &AgentHandle> {
        self.slots.values().flatten()
    }
}
