//! The orchestrator engine.
//!
//! `OrchestratorEngine::run` walks an `ExecutionPlan` to completion. A single
//! coordinating loop owns the plan, the agent pool and every task status. It
//! dispatches ready tasks, then waits on whichever happens first:
//!
//! - an agent execution or an intervention wait finishes (both live in one
//!   `JoinSet`),
//! - a pause/resume request arrives from an [`EngineHandle`],
//! - the plan is cancelled.
//!
//! Nothing outside the loop mutates plan state, so the ready set can be
//! recomputed from scratch after every event.

use crate::agent::{AgentExecutor, AgentId, OptionEffect, TaskContext, TaskResult};
use crate::core::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::events::ProgressEvent;
use crate::orchestration::intervention::{
    InterventionId, InterventionPoint, InterventionRequest, InterventionStatus, InterventionSystem,
};
use crate::orchestration::pool::AgentPool;
use crate::orchestration::scheduler::{ExecutionPlan, Progress, Strategy};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a plan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Created => "created",
            PlanStatus::Running => "running",
            PlanStatus::Paused => "paused",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Limit on a single agent execution. `None` waits forever.
    pub agent_timeout: Option<Duration>,
    /// Deadline for interventions raised on task results.
    pub intervention_timeout: Option<Duration>,
    /// Deadline for review-gate waivers.
    pub review_gate_timeout: Option<Duration>,
    /// Capacity of the progress event channel.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Some(Duration::from_secs(600)),
            intervention_timeout: None,
            review_gate_timeout: None,
            event_buffer: 1024,
        }
    }
}

/// Final state of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub session_id: String,
    pub status: PlanStatus,
    pub strategy: Strategy,
    pub phases: Vec<Vec<TaskId>>,
    pub progress: Progress,
    pub tasks: BTreeMap<TaskId, Task>,
    /// Failed tasks that a review waiver let through.
    pub waived: Vec<TaskId>,
    pub interventions: Vec<InterventionPoint>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PlanReport {
    pub fn task_status(&self, id: &str) -> Option<&TaskStatus> {
        self.tasks.get(&TaskId::from(id)).map(|t| &t.status)
    }
}

enum Control {
    Pause(oneshot::Sender<Result<()>>),
    Resume(oneshot::Sender<Result<()>>),
}

/// Remote control for a running engine. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    control: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
    status: watch::Receiver<PlanStatus>,
    events: broadcast::Sender<ProgressEvent>,
}

impl EngineHandle {
    pub fn status(&self) -> PlanStatus {
        *self.status.borrow()
    }

    /// Stop dispatching new tasks. In-flight work runs to completion.
    ///
    /// Requests made before the run starts are applied once it does.
    ///
    /// # Errors
    /// `InvalidPlanTransition` if the plan is already paused, `PlanTerminal`
    /// once it has finished.
    pub async fn pause(&self) -> Result<()> {
        self.send(Control::Pause).await
    }

    /// Resume dispatching after a pause.
    pub async fn resume(&self) -> Result<()> {
        self.send(Control::Resume).await
    }

    /// Cancel the plan: outstanding agent executions and intervention waits
    /// are released and every unfinished task is skipped.
    pub fn cancel(&self) -> Result<()> {
        let status = self.status();
        if status.is_terminal() || self.cancel.is_cancelled() {
            return Err(Error::PlanTerminal {
                status: if status.is_terminal() {
                    status
                } else {
                    PlanStatus::Cancelled
                },
            });
        }
        self.cancel.cancel();
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Wait until the plan reaches `status` or any terminal status.
    pub async fn wait_for(&self, status: PlanStatus) -> PlanStatus {
        let mut rx = self.status.clone();
        let result = rx
            .wait_for(|current| *current == status || current.is_terminal())
            .await
            .map(|current| *current);
        result.unwrap_or_else(|_| *self.status.borrow())
    }

    async fn send(&self, make: fn(oneshot::Sender<Result<()>>) -> Control) -> Result<()> {
        let terminal = || Error::PlanTerminal {
            status: *self.status.borrow(),
        };
        if self.status().is_terminal() {
            return Err(terminal());
        }
        let (tx, rx) = oneshot::channel();
        self.control.send(make(tx)).map_err(|_| terminal())?;
        rx.await.map_err(|_| terminal())?
    }
}

/// Why the engine is waiting on an intervention.
enum Gate {
    /// The task's own result needs sign-off; `output` is kept until then.
    Outcome { output: Value },
    /// A failed task blocks its review gate.
    Waiver,
}

enum Completion {
    Execution {
        task_id: TaskId,
        agent_id: AgentId,
        outcome: Result<TaskResult>,
    },
    Intervention {
        task_id: TaskId,
        gate: Gate,
        point: Result<InterventionPoint>,
    },
}

/// Runs one execution plan.
pub struct OrchestratorEngine {
    plan: ExecutionPlan,
    executor: Arc<dyn AgentExecutor>,
    interventions: InterventionSystem,
    config: EngineConfig,
    pool: AgentPool,
    events: broadcast::Sender<ProgressEvent>,
    status: watch::Sender<PlanStatus>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    cancel: CancellationToken,
    /// Interventions raised during the run, in order.
    raised: Vec<InterventionId>,
    /// Options chosen for tasks that go round again.
    decisions: HashMap<TaskId, String>,
    /// Changes requested for tasks sent back by a human.
    modifications: HashMap<TaskId, Map<String, Value>>,
    /// Set once a waiver is refused; nothing further is dispatched.
    gate_closed: bool,
}

impl OrchestratorEngine {
    pub fn new(
        plan: ExecutionPlan,
        executor: Arc<dyn AgentExecutor>,
        interventions: InterventionSystem,
        config: EngineConfig,
    ) -> Self {
        let global_limit = (plan.effective_strategy == Strategy::Sequential).then_some(1);
        let pool = AgentPool::new(&plan.capacity, global_limit);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (status, _) = watch::channel(PlanStatus::Created);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Self {
            plan,
            executor,
            interventions,
            config,
            pool,
            events,
            status,
            control_tx,
            control_rx,
            cancel: CancellationToken::new(),
            raised: Vec::new(),
            decisions: HashMap::new(),
            modifications: HashMap::new(),
            gate_closed: false,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            control: self.control_tx.clone(),
            cancel: self.cancel.clone(),
            status: self.status.subscribe(),
            events: self.events.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn status(&self) -> PlanStatus {
        *self.status.borrow()
    }

    /// Drive the plan until every task is terminal.
    pub async fn run(mut self) -> Result<PlanReport> {
        let started_at = Utc::now();
        let session = self.plan.session_id.clone();
        let cancel = self.cancel.clone();

        tracing::info!(
            session = %session,
            strategy = %self.plan.effective_strategy,
            tasks = self.plan.task_count(),
            "plan started"
        );
        self.set_status(PlanStatus::Running);
        self.emit(ProgressEvent::PlanStarted {
            session_id: session.clone(),
            strategy: self.plan.effective_strategy,
            total: self.plan.task_count(),
        });

        let mut in_flight: JoinSet<Completion> = JoinSet::new();
        let mut paused = false;
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                self.begin_cancel();
            }
            // Control requests already queued apply before anything is dispatched.
            while let Ok(control) = self.control_rx.try_recv() {
                self.apply_control(control, &mut paused, cancelled);
            }
            if !paused && !cancelled && !self.gate_closed {
                self.dispatch(&mut in_flight);
            }
            if in_flight.is_empty() && (cancelled || !paused) {
                break;
            }

            // Cancellation is seen before any completion it caused.
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    self.begin_cancel();
                }
                Some(control) = self.control_rx.recv() => {
                    self.apply_control(control, &mut paused, cancelled);
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok(completion) => self.on_completion(completion, cancelled, &mut in_flight),
                        Err(e) => tracing::warn!(error = %e, "engine task ended abnormally"),
                    }
                }
                else => break,
            }
        }

        let reason = if cancelled {
            "plan cancelled"
        } else {
            "no longer reachable"
        };
        self.skip_unfinished(reason);

        let status = if cancelled {
            PlanStatus::Cancelled
        } else if self.plan.unwaived_failures().is_empty() {
            PlanStatus::Completed
        } else {
            PlanStatus::Failed
        };
        self.set_status(status);

        let progress = self.plan.progress();
        self.emit(ProgressEvent::PlanFinished { status, progress });
        tracing::info!(
            session = %session,
            %status,
            completed = progress.completed,
            failed = progress.failed,
            skipped = progress.skipped,
            "plan finished"
        );

        let report = self.report(status, started_at);
        self.interventions.prune_session(&session);
        Ok(report)
    }

    fn report(&self, status: PlanStatus, started_at: DateTime<Utc>) -> PlanReport {
        PlanReport {
            session_id: self.plan.session_id.clone(),
            status,
            strategy: self.plan.effective_strategy,
            phases: self.plan.phases.clone(),
            progress: self.plan.progress(),
            tasks: self
                .plan
                .tasks()
                .into_iter()
                .map(|t| (t.id.clone(), t.clone()))
                .collect(),
            waived: self
                .plan
                .tasks()
                .into_iter()
                .filter(|t| self.plan.is_waived(&t.id))
                .map(|t| t.id.clone())
                .collect(),
            interventions: self
                .raised
                .iter()
                .filter_map(|id| self.interventions.get(*id))
                .collect(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn set_status(&self, status: PlanStatus) {
        self.status.send_replace(status);
    }

    fn emit(&self, event: ProgressEvent) {
        let _ = self.events.send(event);
    }

    fn emit_progress(&self) {
        self.emit(ProgressEvent::ProgressUpdated {
            progress: self.plan.progress(),
        });
    }

    fn apply_control(&mut self, control: Control, paused: &mut bool, cancelled: bool) {
        let (reply, want_paused) = match control {
            Control::Pause(reply) => (reply, true),
            Control::Resume(reply) => (reply, false),
        };

        let current = if *paused {
            PlanStatus::Paused
        } else {
            PlanStatus::Running
        };
        let target = if want_paused {
            PlanStatus::Paused
        } else {
            PlanStatus::Running
        };

        let result = if cancelled {
            Err(Error::PlanTerminal {
                status: PlanStatus::Cancelled,
            })
        } else if current == target {
            Err(Error::InvalidPlanTransition {
                from: current,
                to: target,
            })
        } else {
            *paused = want_paused;
            self.set_status(target);
            if want_paused {
                tracing::info!(session = %self.plan.session_id, "plan paused");
                self.emit(ProgressEvent::PlanPaused);
            } else {
                tracing::info!(session = %self.plan.session_id, "plan resumed");
                self.emit(ProgressEvent::PlanResumed);
            }
            Ok(())
        };
        let _ = reply.send(result);
    }

    fn begin_cancel(&mut self) {
        tracing::info!(session = %self.plan.session_id, "plan cancelling");
        for id in &self.raised {
            // Already settled points are left alone.
            let _ = self.interventions.cancel(*id);
        }
    }

    // ========== Dispatch ==========

    fn dispatch(&mut self, in_flight: &mut JoinSet<Completion>) {
        for task_id in self.plan.ready_set() {
            let Some(task) = self.plan.task(&task_id) else {
                continue;
            };
            let role = task.role.clone();

            let Some(agent_id) = self.pool.acquire(&role, &task_id) else {
                if let Some(task) = self.plan.task_mut(&task_id) {
                    if task.status == TaskStatus::Pending {
                        task.mark_ready();
                    }
                }
                continue;
            };

            let previous_results: BTreeMap<TaskId, Value> = self
                .plan
                .graph()
                .get_dependencies(&task_id)
                .into_iter()
                .filter_map(|dep| {
                    let result = self.plan.task(&dep)?.result.clone()?;
                    Some((dep, result))
                })
                .collect();
            let decision = self.decisions.remove(&task_id);
            let modifications = self.modifications.remove(&task_id);

            let Some(task) = self.plan.task_mut(&task_id) else {
                self.pool.release(&agent_id);
                continue;
            };
            task.start(agent_id);
            let task = task.clone();
            let mut context = TaskContext::new(
                &self.plan.session_id,
                self.plan.effective_strategy,
                &task,
                previous_results,
                decision,
            );
            if let Some(modifications) = modifications {
                context = context.with_modifications(modifications);
            }

            tracing::debug!(task = %task_id, %role, agent = %agent_id, "task dispatched");
            self.emit(ProgressEvent::TaskStarted {
                task_id: task_id.clone(),
                role,
                agent_id,
            });

            let executor = Arc::clone(&self.executor);
            let token = self.cancel.child_token();
            let limit = self.config.agent_timeout;
            in_flight.spawn(async move {
                let outcome = tokio::select! {
                    _ = token.cancelled() => Err(Error::Agent("cancelled".to_string())),
                    outcome = execute(executor, agent_id, &task, &context, limit) => outcome,
                };
                Completion::Execution {
                    task_id: task.id.clone(),
                    agent_id,
                    outcome,
                }
            });
        }
    }

    // ========== Completions ==========

    fn on_completion(&mut self, completion: Completion, cancelled: bool, in_flight: &mut JoinSet<Completion>) {
        match completion {
            Completion::Execution {
                task_id,
                agent_id,
                outcome,
            } => {
                self.pool.release(&agent_id);
                if cancelled {
                    self.skip_task(&task_id, "plan cancelled");
                    return;
                }
                self.on_execution(task_id, outcome, in_flight);
            }
            Completion::Intervention {
                task_id,
                gate,
                point,
            } => {
                if let Ok(point) = &point {
                    self.emit(ProgressEvent::InterventionResolved {
                        intervention_id: point.id,
                        task_id: task_id.clone(),
                        status: point.status,
                    });
                }
                if cancelled {
                    self.skip_task(&task_id, "plan cancelled");
                    return;
                }
                match gate {
                    Gate::Outcome { output } => self.on_outcome_resolved(&task_id, output, point),
                    Gate::Waiver => self.on_waiver_resolved(&task_id, point),
                }
            }
        }
        self.emit_progress();
    }

    fn on_execution(&mut self, task_id: TaskId, outcome: Result<TaskResult>, in_flight: &mut JoinSet<Completion>) {
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                self.fail_task(&task_id, &e.to_string(), in_flight);
                return;
            }
        };

        if !result.success {
            let error = result
                .error
                .unwrap_or_else(|| "agent reported failure".to_string());
            self.fail_task(&task_id, &error, in_flight);
            return;
        }

        if result.requires_intervention {
            let request = self.outcome_request(&task_id, &result);
            self.raise(task_id, request, Gate::Outcome { output: result.output }, in_flight);
            return;
        }

        if let Value::Object(context) = &result.output {
            if let Some(request) = self.policy_request(&task_id, context) {
                self.raise(task_id, request, Gate::Outcome { output: result.output }, in_flight);
                return;
            }
        }

        self.complete_task(&task_id, result.output);
    }

    fn outcome_request(&self, task_id: &TaskId, result: &TaskResult) -> InterventionRequest {
        let name = self
            .plan
            .task(task_id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| task_id.to_string());
        let description = match &result.output {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let session = &self.plan.session_id;

        let mut request = if result.options.is_empty() {
            InterventionRequest::approval(session, task_id, &format!("Approve result of {}", name))
        } else {
            InterventionRequest::decision(
                session,
                task_id,
                &format!("Decision needed for {}", name),
                result.options.clone(),
            )
        }
        .with_description(&description);
        if let Value::Object(context) = &result.output {
            request = request.with_context(context.clone());
        }
        if let Some(timeout) = self.config.intervention_timeout {
            request = request.with_timeout(timeout);
        }
        request
    }

    /// An approval request if any policy fires on the output.
    ///
    /// The point approves itself only if every matching policy allows it,
    /// after the longest of their delays.
    fn policy_request(&self, task_id: &TaskId, context: &Map<String, Value>) -> Option<InterventionRequest> {
        let matching = self.interventions.matching_policies(context);
        if matching.is_empty() {
            return None;
        }
        let names: Vec<String> = matching.iter().map(|p| p.name.clone()).collect();
        let auto_approve = matching
            .iter()
            .map(|p| p.auto_approve_after())
            .collect::<Option<Vec<Duration>>>()
            .and_then(|delays| delays.into_iter().max());

        let mut request = InterventionRequest::approval(
            &self.plan.session_id,
            task_id,
            &format!("Policy check for {}: {}", task_id, names.join(", ")),
        )
        .with_context(context.clone());
        request.policies = names;
        if let Some(after) = auto_approve {
            request = request.with_auto_approve_after(after);
        }
        if let Some(timeout) = self.config.intervention_timeout {
            request = request.with_timeout(timeout);
        }
        Some(request)
    }

    fn raise(
        &mut self,
        task_id: TaskId,
        request: InterventionRequest,
        gate: Gate,
        in_flight: &mut JoinSet<Completion>,
    ) {
        let kind = request.kind;
        let title = request.title.clone();
        let id = match self.interventions.request(request) {
            Ok(id) => id,
            Err(e) => {
                // The intervention system is gone; nobody can approve.
                match gate {
                    Gate::Outcome { .. } => self.fail_task(&task_id, &e.to_string(), in_flight),
                    Gate::Waiver => self.close_gate(&task_id),
                }
                return;
            }
        };
        self.raised.push(id);

        if let Gate::Outcome { .. } = gate {
            if let Some(task) = self.plan.task_mut(&task_id) {
                task.await_approval();
            }
        }
        tracing::info!(task = %task_id, intervention = %id, %kind, "waiting for human");
        self.emit(ProgressEvent::InterventionCreated {
            intervention_id: id,
            task_id: task_id.clone(),
            kind,
            title,
        });

        let system = self.interventions.clone();
        in_flight.spawn(async move {
            let point = system.wait_for_resolution(id).await;
            Completion::Intervention {
                task_id,
                gate,
                point,
            }
        });
    }

    fn on_outcome_resolved(&mut self, task_id: &TaskId, output: Value, point: Result<InterventionPoint>) {
        let point = match point {
            Ok(point) => point,
            Err(e) => {
                self.fail_task_without_gate(task_id, &e.to_string());
                return;
            }
        };

        match point.status {
            InterventionStatus::Approved => match point.selected_option() {
                Some(option) if option.effect == OptionEffect::Redispatch => {
                    tracing::debug!(task = %task_id, option = %option.id, "task re-dispatched");
                    self.decisions.insert(task_id.clone(), option.id.clone());
                    if let Some(task) = self.plan.task_mut(task_id) {
                        task.requeue();
                    }
                }
                _ => self.complete_task(task_id, output),
            },
            InterventionStatus::Modified => {
                let changes = point.modifications().cloned().unwrap_or_default();
                tracing::debug!(task = %task_id, changes = changes.len(), "task sent back with changes");
                self.modifications.insert(task_id.clone(), changes);
                if let Some(task) = self.plan.task_mut(task_id) {
                    task.requeue();
                }
            }
            InterventionStatus::Rejected => {
                let by = point
                    .resolution
                    .as_ref()
                    .map(|r| r.resolved_by.as_str())
                    .unwrap_or("unknown");
                let mut error = format!("rejected by {}", by);
                if let Some(note) = point.resolution.as_ref().and_then(|r| r.note.as_deref()) {
                    error.push_str(&format!(": {}", note));
                }
                self.fail_task_without_gate(task_id, &error);
            }
            InterventionStatus::Expired => {
                self.fail_task_without_gate(task_id, "intervention expired without a resolution");
            }
            InterventionStatus::Cancelled => self.skip_task(task_id, "intervention cancelled"),
            InterventionStatus::Pending | InterventionStatus::WaitingForHuman => {}
        }
    }

    fn on_waiver_resolved(&mut self, task_id: &TaskId, point: Result<InterventionPoint>) {
        match point.map(|p| p.status) {
            Ok(InterventionStatus::Approved) => {
                tracing::info!(task = %task_id, "failure waived");
                self.plan.waive(task_id);
            }
            Ok(InterventionStatus::Cancelled) => {}
            _ => self.close_gate(task_id),
        }
    }

    // ========== Task transitions ==========

    fn complete_task(&mut self, task_id: &TaskId, output: Value) {
        if let Some(task) = self.plan.task_mut(task_id) {
            task.result = Some(output);
            task.complete();
        }
        tracing::debug!(task = %task_id, "task completed");
        self.emit(ProgressEvent::TaskCompleted {
            task_id: task_id.clone(),
        });
    }

    /// Fail a task, skip everything downstream and, under review, ask
    /// whether the failure may be waived.
    fn fail_task(&mut self, task_id: &TaskId, error: &str, in_flight: &mut JoinSet<Completion>) {
        self.fail_task_without_gate(task_id, error);

        if self.plan.effective_strategy == Strategy::Review && !self.gate_closed {
            let phase = self.plan.phase_of(task_id).unwrap_or(0);
            let mut request = InterventionRequest::approval(
                &self.plan.session_id,
                task_id,
                &format!("Waive failure of {}?", task_id),
            )
            .with_description(&format!("Phase {} review gate is blocked: {}", phase, error));
            if let Some(timeout) = self.config.review_gate_timeout {
                request = request.with_timeout(timeout);
            }
            self.raise(task_id.clone(), request, Gate::Waiver, in_flight);
        }
    }

    fn fail_task_without_gate(&mut self, task_id: &TaskId, error: &str) {
        if let Some(task) = self.plan.task_mut(task_id) {
            task.fail(error);
        }
        tracing::warn!(task = %task_id, error, "task failed");
        self.emit(ProgressEvent::TaskFailed {
            task_id: task_id.clone(),
            error: error.to_string(),
        });

        let reason = format!("dependency {} failed", task_id);
        for dependent in self.plan.graph().get_all_dependents(task_id) {
            self.skip_task(&dependent, &reason);
        }
    }

    fn skip_task(&mut self, task_id: &TaskId, reason: &str) {
        let Some(task) = self.plan.task_mut(task_id) else {
            return;
        };
        if task.is_finished() {
            return;
        }
        task.skip(reason);
        tracing::debug!(task = %task_id, reason, "task skipped");
        self.emit(ProgressEvent::TaskSkipped {
            task_id: task_id.clone(),
            reason: reason.to_string(),
        });
    }

    /// A waiver was refused: nothing else gets dispatched.
    fn close_gate(&mut self, task_id: &TaskId) {
        tracing::warn!(task = %task_id, "review gate closed");
        self.gate_closed = true;
        let reason = format!("review gate closed after {} failed", task_id);
        let waiting: Vec<TaskId> = self
            .plan
            .tasks()
            .into_iter()
            .filter(|t| t.can_start())
            .map(|t| t.id.clone())
            .collect();
        for id in waiting {
            self.skip_task(&id, &reason);
        }
    }

    fn skip_unfinished(&mut self, reason: &str) {
        let unfinished: Vec<TaskId> = self
            .plan
            .tasks()
            .into_iter()
            .filter(|t| !t.is_finished())
            .map(|t| t.id.clone())
            .collect();
        for id in unfinished {
            self.skip_task(&id, reason);
        }
    }
}

impl fmt::Debug for OrchestratorEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorEngine")
            .field("plan", &self.plan)
            .field("status", &self.status())
            .field("config", &self.config)
            .finish()
    }
}

/// Run the executor with the configured time limit, turning panics into
/// errors.
async fn execute(
    executor: Arc<dyn AgentExecutor>,
    agent_id: AgentId,
    task: &Task,
    context: &TaskContext,
    limit: Option<Duration>,
) -> Result<TaskResult> {
    let run = AssertUnwindSafe(executor.execute(agent_id, task, context)).catch_unwind();
    let joined = match limit {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => run.await,
    };
    joined.unwrap_or_else(|panic| Err(Error::TaskJoin(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("agent panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("agent panicked: {}", s)
    } else {
        "agent panicked".to_string()
    }
}
