//! Human-in-the-loop gating.
//!
//! An `InterventionPoint` is a question put to a human: approve this task's
//! output, pick one of these options, review this content, acknowledge this
//! checkpoint or error. The
//! `InterventionSystem` owns every point and its resolution. Callers get an
//! id back immediately and may suspend on [`InterventionSystem::wait_for_resolution`]
//! until the point reaches a terminal status.
//!
//! Points resolve exactly once. Resolution, expiry and cancellation all go
//! through the same lock, and each point publishes its state on a `watch`
//! channel so every waiter observes the same terminal snapshot.
//!
//! Deadlines are wall clock. A timer task per point fires them even when
//! nobody is looking, and every access also checks lazily.

use crate::agent::{DecisionOption, OptionEffect};
use crate::core::TaskId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Name recorded as the resolver of automatic approvals.
pub const SYSTEM_RESOLVER: &str = "system";

const EVENT_BUFFER: usize = 256;

/// Unique identifier for an intervention point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterventionId(pub Uuid);

impl InterventionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for InterventionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InterventionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    /// Yes or no on a task's outcome.
    Approval,
    /// Pick one of several options.
    Decision,
    /// Look over content; approve, reject or request changes.
    Review,
    /// Progress report the human acknowledges.
    Checkpoint,
    /// An error that needs attention.
    Error,
}

impl fmt::Display for InterventionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterventionKind::Approval => "approval",
            InterventionKind::Decision => "decision",
            InterventionKind::Review => "review",
            InterventionKind::Checkpoint => "checkpoint",
            InterventionKind::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    /// Created ahead of time; not yet shown to a human.
    Pending,
    WaitingForHuman,
    Approved,
    Rejected,
    /// Sent back with changes to apply.
    Modified,
    /// The deadline passed without a resolution.
    Expired,
    /// Released by plan cancellation or shutdown.
    Cancelled,
}

impl InterventionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            InterventionStatus::Pending | InterventionStatus::WaitingForHuman
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionStatus::Pending => "pending",
            InterventionStatus::WaitingForHuman => "waiting_for_human",
            InterventionStatus::Approved => "approved",
            InterventionStatus::Rejected => "rejected",
            InterventionStatus::Modified => "modified",
            InterventionStatus::Expired => "expired",
            InterventionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InterventionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the human decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ResolutionAction {
    Approve,
    Reject,
    /// Choose one of the point's options.
    Select { option_id: String },
    /// Send the task back with changes.
    Modify { modifications: Map<String, Value> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    #[serde(flatten)]
    pub action: ResolutionAction,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
    pub note: Option<String>,
}

/// A request for human input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionPoint {
    pub id: InterventionId,
    pub session_id: String,
    pub task_id: TaskId,
    pub kind: InterventionKind,
    pub title: String,
    pub description: String,
    pub options: Vec<DecisionOption>,
    pub context: Map<String, Value>,
    pub status: InterventionStatus,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    /// When a policy approves the point on the human's behalf.
    pub auto_approve_at: Option<DateTime<Utc>>,
    /// Policies that raised this point.
    pub policies: Vec<String>,
    pub resolution: Option<Resolution>,
}

impl InterventionPoint {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |deadline| Utc::now() >= deadline)
    }

    /// Time left until the deadline; zero once it has passed.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn option(&self, option_id: &str) -> Option<&DecisionOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    /// Changes requested by a `Modify` resolution.
    pub fn modifications(&self) -> Option<&Map<String, Value>> {
        match self.resolution.as_ref().map(|r| &r.action) {
            Some(ResolutionAction::Modify { modifications }) => Some(modifications),
            _ => None,
        }
    }

    /// The option chosen by the resolution, if any.
    pub fn selected_option(&self) -> Option<&DecisionOption> {
        match self.resolution.as_ref().map(|r| &r.action) {
            Some(ResolutionAction::Select { option_id }) => self.option(option_id),
            _ => None,
        }
    }
}

/// Everything needed to raise an intervention point.
#[derive(Debug, Clone)]
pub struct InterventionRequest {
    pub session_id: String,
    pub task_id: TaskId,
    pub kind: InterventionKind,
    pub title: String,
    pub description: String,
    pub options: Vec<DecisionOption>,
    pub context: Map<String, Value>,
    pub deadline: Option<DateTime<Utc>>,
    pub auto_approve_after: Option<Duration>,
    pub policies: Vec<String>,
}

impl InterventionRequest {
    fn new(kind: InterventionKind, session_id: &str, task_id: &TaskId, title: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            task_id: task_id.clone(),
            kind,
            title: title.to_string(),
            description: String::new(),
            options: Vec::new(),
            context: Map::new(),
            deadline: None,
            auto_approve_after: None,
            policies: Vec::new(),
        }
    }

    pub fn approval(session_id: &str, task_id: &TaskId, title: &str) -> Self {
        Self::new(InterventionKind::Approval, session_id, task_id, title)
    }

    pub fn decision(
        session_id: &str,
        task_id: &TaskId,
        title: &str,
        options: Vec<DecisionOption>,
    ) -> Self {
        Self {
            options,
            ..Self::new(InterventionKind::Decision, session_id, task_id, title)
        }
    }

    pub fn review(session_id: &str, task_id: &TaskId, title: &str) -> Self {
        Self {
            options: review_options(),
            ..Self::new(InterventionKind::Review, session_id, task_id, title)
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Expire the point this long after creation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(instant_after(Utc::now(), timeout));
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_auto_approve_after(mut self, after: Duration) -> Self {
        self.auto_approve_after = Some(after);
        self
    }
}

fn review_options() -> Vec<DecisionOption> {
    vec![
        DecisionOption::new("approve", "Approve", OptionEffect::Complete),
        DecisionOption::new("reject", "Reject", OptionEffect::Fail),
        DecisionOption::new("modify", "Request Changes", OptionEffect::Redispatch),
    ]
}

/// How bad a reported error is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Warning,
    #[default]
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// At most `max` characters of `text`.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// `start + after`, saturating at the latest representable instant.
fn instant_after(start: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|after| start.checked_add_signed(after))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ========== Policies ==========

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[default]
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
}

/// One test against a context field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub field: String,
    #[serde(default)]
    pub operator: ConditionOperator,
    pub value: Value,
}

impl TriggerCondition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn matches(&self, context: &Map<String, Value>) -> bool {
        let actual = context.get(&self.field);
        match self.operator {
            ConditionOperator::Equals => actual.map_or(self.value.is_null(), |a| a == &self.value),
            ConditionOperator::NotEquals => actual.map_or(!self.value.is_null(), |a| a != &self.value),
            ConditionOperator::Contains => {
                let needle = value_text(&self.value);
                actual.map_or(false, |a| value_text(a).contains(&needle))
            }
            ConditionOperator::GreaterThan => {
                compare(actual, &self.value) == Some(std::cmp::Ordering::Greater)
            }
            ConditionOperator::LessThan => {
                compare(actual, &self.value) == Some(std::cmp::Ordering::Less)
            }
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

/// When to raise an intervention automatically, and whether it may approve
/// itself after a while.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionPolicy {
    pub name: String,
    /// Any matching condition triggers the policy.
    pub conditions: Vec<TriggerCondition>,
    /// Seconds after which the point is approved by the system.
    #[serde(default)]
    pub auto_approve_after_secs: Option<u64>,
}

impl InterventionPolicy {
    pub fn new(name: &str, conditions: Vec<TriggerCondition>) -> Self {
        Self {
            name: name.to_string(),
            conditions,
            auto_approve_after_secs: None,
        }
    }

    pub fn with_auto_approve_after(mut self, secs: u64) -> Self {
        self.auto_approve_after_secs = Some(secs);
        self
    }

    pub fn auto_approve_after(&self) -> Option<Duration> {
        self.auto_approve_after_secs.map(Duration::from_secs)
    }

    pub fn should_intervene(&self, context: &Map<String, Value>) -> bool {
        self.conditions.iter().any(|c| c.matches(context))
    }

    /// The built-in policies: destructive operations, expensive operations
    /// (approved automatically after five minutes) and error escalation.
    pub fn defaults() -> Vec<Self> {
        use serde_json::json;
        vec![
            Self::new(
                "destructive_ops",
                vec![
                    TriggerCondition::new("operation_type", ConditionOperator::Equals, json!("delete")),
                    TriggerCondition::new("operation_type", ConditionOperator::Equals, json!("drop")),
                ],
            ),
            Self::new(
                "expensive_ops",
                vec![TriggerCondition::new(
                    "estimated_cost",
                    ConditionOperator::GreaterThan,
                    json!(100),
                )],
            )
            .with_auto_approve_after(300),
            Self::new(
                "error_escalation",
                vec![TriggerCondition::new(
                    "error_count",
                    ConditionOperator::GreaterThan,
                    json!(3),
                )],
            ),
        ]
    }
}

// ========== The system ==========

struct Entry {
    point: InterventionPoint,
    seq: u64,
    tx: watch::Sender<InterventionPoint>,
}

struct Inner {
    entries: Mutex<HashMap<InterventionId, Entry>>,
    policies: Mutex<BTreeMap<String, InterventionPolicy>>,
    events: broadcast::Sender<InterventionPoint>,
    shutdown: CancellationToken,
    next_seq: Mutex<u64>,
}

enum Timer {
    Deadline,
    AutoApprove,
}

/// Owner of every intervention point.
///
/// Cheap to clone; clones share the same points.
#[derive(Clone)]
pub struct InterventionSystem {
    inner: Arc<Inner>,
}

impl InterventionSystem {
    /// A system with the default policies installed.
    pub fn new() -> Self {
        let system = Self::without_policies();
        for policy in InterventionPolicy::defaults() {
            system.add_policy(policy);
        }
        system
    }

    /// A system with no policies.
    pub fn without_policies() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                policies: Mutex::new(BTreeMap::new()),
                events,
                shutdown: CancellationToken::new(),
                next_seq: Mutex::new(0),
            }),
        }
    }

    // ---------- Raising points ----------

    /// Ask for a yes/no on a task. Returns as soon as the point is registered.
    pub fn request_approval(
        &self,
        session_id: &str,
        task_id: &TaskId,
        title: &str,
        description: &str,
        timeout: Option<Duration>,
    ) -> Result<InterventionId> {
        let mut request = InterventionRequest::approval(session_id, task_id, title)
            .with_description(description);
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }
        self.request(request)
    }

    /// Ask the human to pick one of `options`.
    pub fn request_decision(
        &self,
        session_id: &str,
        task_id: &TaskId,
        title: &str,
        question: &str,
        options: Vec<DecisionOption>,
        timeout: Option<Duration>,
    ) -> Result<InterventionId> {
        if options.is_empty() {
            return Err(Error::InvalidResolution(
                "a decision needs at least one option".to_string(),
            ));
        }
        let mut request =
            InterventionRequest::decision(session_id, task_id, title, options).with_description(question);
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }
        self.request(request)
    }

    /// Ask for a review of `content`.
    pub fn request_review(
        &self,
        session_id: &str,
        task_id: &TaskId,
        title: &str,
        content: &str,
    ) -> Result<InterventionId> {
        self.request(InterventionRequest::review(session_id, task_id, title).with_description(content))
    }

    /// Report progress on a task. `progress` is a fraction in `0.0..=1.0`
    /// and is recorded under `progress` in the context.
    pub fn create_checkpoint(
        &self,
        session_id: &str,
        task_id: &TaskId,
        title: &str,
        progress: f64,
        context: Map<String, Value>,
    ) -> Result<InterventionId> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(Error::Validation(format!(
                "checkpoint progress {} is outside 0.0..=1.0",
                progress
            )));
        }
        let mut merged = Map::new();
        merged.insert("progress".to_string(), Value::from(progress));
        merged.extend(context);

        let request = InterventionRequest::new(InterventionKind::Checkpoint, session_id, task_id, title)
            .with_description(&format!("Progress: {:.1}%", progress * 100.0))
            .with_context(merged);
        self.request(request)
    }

    /// Raise an error for a human to look at. The title carries the first
    /// 50 characters of `error`; the full text goes in the description.
    pub fn report_error(
        &self,
        session_id: &str,
        task_id: &TaskId,
        error: &str,
        severity: ErrorSeverity,
        context: Map<String, Value>,
    ) -> Result<InterventionId> {
        let mut merged = Map::new();
        merged.insert("severity".to_string(), Value::from(severity.as_str()));
        merged.extend(context);

        let title = format!("Error: {}", truncate_chars(error, 50));
        let request = InterventionRequest::new(InterventionKind::Error, session_id, task_id, &title)
            .with_description(error)
            .with_context(merged);
        self.request(request)
    }

    /// Register a point that waits for a human right away.
    pub fn request(&self, request: InterventionRequest) -> Result<InterventionId> {
        self.register(request, InterventionStatus::WaitingForHuman)
    }

    /// Register a point ahead of time, in `Pending`.
    pub fn create_pending(&self, request: InterventionRequest) -> Result<InterventionId> {
        self.register(request, InterventionStatus::Pending)
    }

    /// Show a pending point to the human.
    pub fn open(&self, id: InterventionId) -> Result<InterventionPoint> {
        let mut entries = self.inner.entries.lock();
        let entry = entries.get_mut(&id).ok_or(Error::InterventionNotFound(id))?;
        self.settle_due(entry);
        match entry.point.status {
            InterventionStatus::Pending => {
                entry.point.status = InterventionStatus::WaitingForHuman;
                self.publish(entry);
                Ok(entry.point.clone())
            }
            InterventionStatus::WaitingForHuman => Ok(entry.point.clone()),
            status => Err(Error::AlreadyResolved { id, status }),
        }
    }

    fn register(&self, request: InterventionRequest, status: InterventionStatus) -> Result<InterventionId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Validation("intervention system is closed".to_string()));
        }

        let now = Utc::now();
        let point = InterventionPoint {
            id: InterventionId::new(),
            session_id: request.session_id,
            task_id: request.task_id,
            kind: request.kind,
            title: request.title,
            description: request.description,
            options: request.options,
            context: request.context,
            status,
            created_at: now,
            deadline: request.deadline,
            auto_approve_at: request.auto_approve_after.map(|after| instant_after(now, after)),
            policies: request.policies,
            resolution: None,
        };
        let id = point.id;

        let seq = {
            let mut next = self.inner.next_seq.lock();
            *next += 1;
            *next
        };
        let (tx, _rx) = watch::channel(point.clone());
        let entry = Entry {
            point: point.clone(),
            seq,
            tx,
        };

        tracing::debug!(
            intervention = %id,
            kind = %point.kind,
            task = %point.task_id,
            session = %point.session_id,
            "intervention registered"
        );

        {
            let mut entries = self.inner.entries.lock();
            entries.insert(id, entry);
            let _ = self.inner.events.send(point.clone());
        }

        if let Some(deadline) = point.deadline {
            self.spawn_timer(id, deadline, Timer::Deadline);
        }
        if let Some(at) = point.auto_approve_at {
            self.spawn_timer(id, at, Timer::AutoApprove);
        }

        Ok(id)
    }

    /// Fire a wall-clock timer for the point. Outside a runtime only the
    /// lazy checks apply.
    fn spawn_timer(&self, id: InterventionId, at: DateTime<Utc>, timer: Timer) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        handle.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        let system = InterventionSystem { inner };
                        match timer {
                            Timer::Deadline => system.expire(id),
                            Timer::AutoApprove => system.auto_approve(id),
                        }
                    }
                }
            }
        });
    }

    // ---------- Transitions ----------

    /// Settle a point whose deadline or auto-approval instant has passed.
    fn settle_due(&self, entry: &mut Entry) {
        if entry.point.is_terminal() {
            return;
        }
        let now = Utc::now();
        let auto_due = entry.point.auto_approve_at.map_or(false, |at| now >= at);
        let expired = entry.point.deadline.map_or(false, |at| now >= at);
        match (auto_due, expired) {
            (true, true) => {
                // Whichever instant came first wins.
                if entry.point.auto_approve_at < entry.point.deadline {
                    self.approve_by_system(entry);
                } else {
                    self.mark_expired(entry);
                }
            }
            (true, false) => self.approve_by_system(entry),
            (false, true) => self.mark_expired(entry),
            (false, false) => {}
        }
    }

    fn mark_expired(&self, entry: &mut Entry) {
        tracing::warn!(intervention = %entry.point.id, task = %entry.point.task_id, "intervention expired");
        entry.point.status = InterventionStatus::Expired;
        self.publish(entry);
    }

    fn approve_by_system(&self, entry: &mut Entry) {
        tracing::info!(intervention = %entry.point.id, task = %entry.point.task_id, "intervention auto-approved");
        entry.point.status = InterventionStatus::Approved;
        entry.point.resolution = Some(Resolution {
            action: ResolutionAction::Approve,
            resolved_by: SYSTEM_RESOLVER.to_string(),
            resolved_at: Utc::now(),
            note: Some("auto-approved by policy".to_string()),
        });
        self.publish(entry);
    }

    fn expire(&self, id: InterventionId) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&id) {
            if !entry.point.is_terminal() {
                self.mark_expired(entry);
            }
        }
    }

    fn auto_approve(&self, id: InterventionId) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&id) {
            if !entry.point.is_terminal() {
                self.approve_by_system(entry);
            }
        }
    }

    fn publish(&self, entry: &Entry) {
        entry.tx.send_replace(entry.point.clone());
        let _ = self.inner.events.send(entry.point.clone());
    }

    /// Settle a point. Exactly one resolution is ever accepted.
    ///
    /// # Errors
    /// `InterventionNotFound` for unknown ids, `AlreadyResolved` for terminal
    /// points (expired ones included), `InvalidResolution` when the selected
    /// option does not exist or a modification carries no changes. State is
    /// unchanged on error.
    pub fn resolve(
        &self,
        id: InterventionId,
        action: ResolutionAction,
        resolved_by: &str,
        note: Option<&str>,
    ) -> Result<InterventionPoint> {
        let mut entries = self.inner.entries.lock();
        let entry = entries.get_mut(&id).ok_or(Error::InterventionNotFound(id))?;
        self.settle_due(entry);

        if entry.point.is_terminal() {
            return Err(Error::AlreadyResolved {
                id,
                status: entry.point.status,
            });
        }

        let status = match &action {
            ResolutionAction::Approve => InterventionStatus::Approved,
            ResolutionAction::Reject => InterventionStatus::Rejected,
            ResolutionAction::Select { option_id } => {
                let option = entry.point.option(option_id).ok_or_else(|| {
                    Error::InvalidResolution(format!("unknown option '{}' for {}", option_id, id))
                })?;
                if option.effect == OptionEffect::Fail {
                    InterventionStatus::Rejected
                } else {
                    InterventionStatus::Approved
                }
            }
            ResolutionAction::Modify { modifications } => {
                if modifications.is_empty() {
                    return Err(Error::InvalidResolution(format!(
                        "modification of {} carries no changes",
                        id
                    )));
                }
                InterventionStatus::Modified
            }
        };

        entry.point.status = status;
        entry.point.resolution = Some(Resolution {
            action,
            resolved_by: resolved_by.to_string(),
            resolved_at: Utc::now(),
            note: note.map(str::to_string),
        });
        tracing::info!(intervention = %id, %status, by = resolved_by, "intervention resolved");
        self.publish(entry);

        Ok(entry.point.clone())
    }

    /// Release a single point with `Cancelled`.
    pub fn cancel(&self, id: InterventionId) -> Result<InterventionPoint> {
        let mut entries = self.inner.entries.lock();
        let entry = entries.get_mut(&id).ok_or(Error::InterventionNotFound(id))?;
        if entry.point.is_terminal() {
            return Err(Error::AlreadyResolved {
                id,
                status: entry.point.status,
            });
        }
        entry.point.status = InterventionStatus::Cancelled;
        self.publish(entry);
        Ok(entry.point.clone())
    }

    /// Cancel every open point of a session. Returns how many were cancelled.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let mut entries = self.inner.entries.lock();
        let mut cancelled = 0;
        for entry in entries.values_mut() {
            if entry.point.session_id == session_id && !entry.point.is_terminal() {
                entry.point.status = InterventionStatus::Cancelled;
                self.publish(entry);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(session = session_id, cancelled, "session interventions cancelled");
        }
        cancelled
    }

    /// Cancel every open point and stop the timers. New requests fail.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        let mut entries = self.inner.entries.lock();
        for entry in entries.values_mut() {
            if !entry.point.is_terminal() {
                entry.point.status = InterventionStatus::Cancelled;
                self.publish(entry);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Forget every settled point of a session. Open points stay. Returns
    /// how many were removed.
    pub fn prune_session(&self, session_id: &str) -> usize {
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            self.settle_due(entry);
            entry.point.session_id != session_id || !entry.point.is_terminal()
        });
        let pruned = before - entries.len();
        if pruned > 0 {
            tracing::debug!(session = session_id, pruned, "settled interventions pruned");
        }
        pruned
    }

    /// Number of points held, settled or not.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---------- Waiting ----------

    /// Suspend until the point is terminal and return its final state.
    ///
    /// Every waiter of the same point sees the same snapshot. Already
    /// terminal points return immediately.
    pub async fn wait_for_resolution(&self, id: InterventionId) -> Result<InterventionPoint> {
        let mut rx = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.get_mut(&id).ok_or(Error::InterventionNotFound(id))?;
            self.settle_due(entry);
            entry.tx.subscribe()
        };
        let point = rx
            .wait_for(|point| point.is_terminal())
            .await
            .map_err(|_| Error::InterventionClosed(id))?
            .clone();
        Ok(point)
    }

    /// Like [`wait_for_resolution`](Self::wait_for_resolution) but gives up
    /// after `timeout`, returning `None`. The point itself is untouched.
    pub async fn wait_timeout(
        &self,
        id: InterventionId,
        timeout: Duration,
    ) -> Result<Option<InterventionPoint>> {
        match tokio::time::timeout(timeout, self.wait_for_resolution(id)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    // ---------- Queries ----------

    pub fn get(&self, id: InterventionId) -> Option<InterventionPoint> {
        let mut entries = self.inner.entries.lock();
        let entry = entries.get_mut(&id)?;
        self.settle_due(entry);
        Some(entry.point.clone())
    }

    /// Points of a session, newest first, optionally filtered by status.
    pub fn session_interventions(
        &self,
        session_id: &str,
        status: Option<InterventionStatus>,
    ) -> Vec<InterventionPoint> {
        let mut entries = self.inner.entries.lock();
        let mut points: Vec<(u64, InterventionPoint)> = entries
            .values_mut()
            .filter(|entry| entry.point.session_id == session_id)
            .map(|entry| {
                self.settle_due(entry);
                (entry.seq, entry.point.clone())
            })
            .filter(|(_, point)| status.map_or(true, |s| point.status == s))
            .collect();
        points.sort_by(|a, b| {
            b.1.created_at
                .cmp(&a.1.created_at)
                .then_with(|| b.0.cmp(&a.0))
        });
        points.into_iter().map(|(_, point)| point).collect()
    }

    /// Points still waiting for an answer, oldest first.
    pub fn pending_interventions(&self) -> Vec<InterventionPoint> {
        let mut entries = self.inner.entries.lock();
        let mut points: Vec<(u64, InterventionPoint)> = entries
            .values_mut()
            .filter_map(|entry| {
                self.settle_due(entry);
                (!entry.point.is_terminal()).then(|| (entry.seq, entry.point.clone()))
            })
            .collect();
        points.sort_by_key(|(seq, _)| *seq);
        points.into_iter().map(|(_, point)| point).collect()
    }

    /// Snapshots of every point on each transition.
    pub fn subscribe(&self) -> broadcast::Receiver<InterventionPoint> {
        self.inner.events.subscribe()
    }

    // ---------- Policies ----------

    pub fn add_policy(&self, policy: InterventionPolicy) {
        self.inner.policies.lock().insert(policy.name.clone(), policy);
    }

    pub fn remove_policy(&self, name: &str) -> Option<InterventionPolicy> {
        self.inner.policies.lock().remove(name)
    }

    pub fn policies(&self) -> Vec<InterventionPolicy> {
        self.inner.policies.lock().values().cloned().collect()
    }

    /// Whether the named policy fires for the context. Unknown names never do.
    pub fn check_policy(&self, name: &str, context: &Map<String, Value>) -> bool {
        self.inner
            .policies
            .lock()
            .get(name)
            .map_or(false, |policy| policy.should_intervene(context))
    }

    /// Every policy that fires for the context, by name.
    pub fn matching_policies(&self, context: &Map<String, Value>) -> Vec<InterventionPolicy> {
        self.inner
            .policies
            .lock()
            .values()
            .filter(|policy| policy.should_intervene(context))
            .cloned()
            .collect()
    }
}

impl Default for InterventionSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InterventionSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterventionSystem")
            .field("points", &self.inner.entries.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
