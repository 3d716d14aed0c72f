//! Human-in-the-loop tests.
//!
//! These tests cover the intervention system on its own (exactly-once
//! resolution, expiry) and the engine's reaction to each way an
//! intervention can settle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use memnexus::agent::{DecisionOption, OptionEffect};
use memnexus::core::{Role, TaskId, TaskStatus};
use memnexus::orchestration::{
    AgentCapacity, ConditionOperator, EngineConfig, ErrorSeverity, InterventionKind,
    InterventionPolicy, InterventionRequest, InterventionStatus, InterventionSystem, PlanStatus,
    ResolutionAction, Strategy, TriggerCondition, SYSTEM_RESOLVER,
};
use memnexus::Error;

use crate::fixtures::{
    build_plan, engine, next_intervention, spec, test_config, Behavior, ScriptedAgent,
};

fn approval_pair() -> Vec<memnexus::core::TaskSpec> {
    vec![spec("deploy", Role::Devops, &[]), spec("verify", Role::Tester, &["deploy"])]
}

/// Test: Exactly one of many concurrent resolutions wins
/// Given one open approval and several waiters
/// When eight resolvers race
/// Then one succeeds, the rest see AlreadyResolved, and every waiter sees
/// the winning snapshot
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_intervention_resolved_exactly_once() {
    let system = InterventionSystem::without_policies();
    let task = TaskId::from("deploy");
    let id = system
        .request(InterventionRequest::approval("s", &task, "Ship it?"))
        .unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let system = system.clone();
            tokio::spawn(async move { system.wait_for_resolution(id).await })
        })
        .collect();

    let resolvers: Vec<_> = (0..8)
        .map(|i| {
            let system = system.clone();
            tokio::spawn(async move {
                let action = if i % 2 == 0 {
                    ResolutionAction::Approve
                } else {
                    ResolutionAction::Reject
                };
                system.resolve(id, action, &format!("human-{}", i), None)
            })
        })
        .collect();

    let mut winners = Vec::new();
    for resolver in resolvers {
        match resolver.await.unwrap() {
            Ok(point) => winners.push(point),
            Err(Error::AlreadyResolved { .. }) => {}
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    assert_eq!(winners.len(), 1);
    let winner = &winners[0];

    for waiter in waiters {
        let seen = waiter.await.unwrap().unwrap();
        assert_eq!(seen.status, winner.status);
        assert_eq!(seen.resolution, winner.resolution);
    }
}

/// Test: A past deadline releases waiters without resolve()
#[tokio::test]
async fn test_past_deadline_expires_waiters() {
    let system = InterventionSystem::without_policies();
    let id = system
        .request(
            InterventionRequest::approval("s", &TaskId::from("t"), "Late")
                .with_deadline(Utc::now() - chrono::Duration::seconds(1)),
        )
        .unwrap();

    let point = tokio::time::timeout(Duration::from_secs(2), system.wait_for_resolution(id))
        .await
        .expect("waiter must be released")
        .unwrap();
    assert_eq!(point.status, InterventionStatus::Expired);
    assert!(point.resolution.is_none());
    assert!(matches!(
        system.resolve(id, ResolutionAction::Approve, "late-human", None),
        Err(Error::AlreadyResolved {
            status: InterventionStatus::Expired,
            ..
        })
    ));
}

/// Test: Approved output completes the task
#[tokio::test]
async fn test_approval_completes_task() {
    let system = InterventionSystem::new();
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), approval_pair());
    let agent = Arc::new(
        ScriptedAgent::instant().with("deploy", Behavior::NeedApproval(json!({"release": "v2"}))),
    );
    let engine = engine(plan, agent.clone(), system.clone(), test_config());
    let mut events = engine.subscribe();
    let run = tokio::spawn(engine.run());

    let (id, task) = next_intervention(&mut events).await;
    assert_eq!(task.as_str(), "deploy");
    let point = system.get(id).unwrap();
    assert_eq!(point.status, InterventionStatus::WaitingForHuman);
    assert_eq!(point.context["release"], json!("v2"));
    assert_eq!(agent.call_count("verify"), 0);

    system
        .resolve(id, ResolutionAction::Approve, "alice", Some("looks good"))
        .unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(
        report.tasks[&TaskId::from("deploy")].result,
        Some(json!({"release": "v2"}))
    );
    assert_eq!(report.interventions.len(), 1);
    assert_eq!(report.interventions[0].status, InterventionStatus::Approved);
    assert_eq!(agent.contexts("verify")[0].previous_results.len(), 1);
}

/// Test: Rejection fails the task and cascades
#[tokio::test]
async fn test_rejection_fails_task() {
    let system = InterventionSystem::new();
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), approval_pair());
    let agent = Arc::new(ScriptedAgent::instant().with("deploy", Behavior::NeedApproval(json!("plan"))));
    let engine = engine(plan, agent.clone(), system.clone(), test_config());
    let mut events = engine.subscribe();
    let run = tokio::spawn(engine.run());

    let (id, _) = next_intervention(&mut events).await;
    system
        .resolve(id, ResolutionAction::Reject, "alice", Some("wrong region"))
        .unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(
        report.task_status("deploy"),
        Some(&TaskStatus::Failed {
            error: "rejected by alice: wrong region".into()
        })
    );
    assert!(matches!(report.task_status("verify"), Some(TaskStatus::Skipped { .. })));
    assert_eq!(agent.call_count("verify"), 0);
}

/// Test: An unanswered intervention expires and fails the task
#[tokio::test]
async fn test_intervention_timeout_fails_task() {
    let system = InterventionSystem::new();
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), approval_pair());
    let agent = Arc::new(ScriptedAgent::instant().with("deploy", Behavior::NeedApproval(json!("plan"))));
    let config = EngineConfig {
        intervention_timeout: Some(Duration::from_millis(100)),
        ..test_config()
    };
    let engine = engine(plan, agent, system.clone(), config);

    let report = tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("plan must finish after expiry")
        .unwrap();
    assert_eq!(report.status, PlanStatus::Failed);
    match report.task_status("deploy") {
        Some(TaskStatus::Failed { error }) => assert!(error.contains("expired")),
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(report.interventions[0].status, InterventionStatus::Expired);
}

/// Test: Policy-triggered intervention approves itself
/// Given a policy on estimated_cost with a one second auto-approval
/// When a task's output crosses the threshold
/// Then an approval is raised and the system approves it
#[tokio::test]
async fn test_policy_intervention_auto_approves() {
    let system = InterventionSystem::without_policies();
    system.add_policy(
        InterventionPolicy::new(
            "big_spend",
            vec![TriggerCondition::new(
                "estimated_cost",
                ConditionOperator::GreaterThan,
                json!(100),
            )],
        )
        .with_auto_approve_after(1),
    );
    let tasks = vec![spec("provision", Role::Devops, &[]), spec("cheap", Role::Backend, &[])];
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), tasks);
    let agent = Arc::new(
        ScriptedAgent::instant()
            .with("provision", Behavior::Output(json!({"estimated_cost": 450})))
            .with("cheap", Behavior::Output(json!({"estimated_cost": 3}))),
    );
    let engine = engine(plan, agent, system.clone(), test_config());

    let report = tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("auto-approval must release the plan")
        .unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.interventions.len(), 1);

    let point = &report.interventions[0];
    assert_eq!(point.task_id.as_str(), "provision");
    assert_eq!(point.policies, vec!["big_spend".to_string()]);
    assert_eq!(point.status, InterventionStatus::Approved);
    assert_eq!(
        point.resolution.as_ref().map(|r| r.resolved_by.as_str()),
        Some(SYSTEM_RESOLVER)
    );
}

/// Test: Default destructive-operation policy waits for a human
#[tokio::test]
async fn test_destructive_output_needs_human() {
    let system = InterventionSystem::new();
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), approval_pair());
    let agent = Arc::new(
        ScriptedAgent::instant().with("deploy", Behavior::Output(json!({"operation_type": "drop"}))),
    );
    let engine = engine(plan, agent, system.clone(), test_config());
    let mut events = engine.subscribe();
    let run = tokio::spawn(engine.run());

    let (id, _) = next_intervention(&mut events).await;
    let point = system.get(id).unwrap();
    assert_eq!(point.policies, vec!["destructive_ops".to_string()]);
    assert!(point.auto_approve_at.is_none());

    system.resolve(id, ResolutionAction::Approve, "dba", None).unwrap();
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
}

fn options() -> Vec<DecisionOption> {
    vec![
        DecisionOption::new("keep", "Keep the current schema", OptionEffect::Complete),
        DecisionOption::new("retry", "Redo with a new schema", OptionEffect::Redispatch),
        DecisionOption::new("abort", "Give up", OptionEffect::Fail),
    ]
}

/// Test: Selecting a redispatch option runs the task again with the choice
#[tokio::test]
async fn test_decision_redispatch() {
    let system = InterventionSystem::new();
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), approval_pair());
    let agent = Arc::new(ScriptedAgent::instant().with("deploy", Behavior::Decide(options())));
    let engine = engine(plan, agent.clone(), system.clone(), test_config());
    let mut events = engine.subscribe();
    let run = tokio::spawn(engine.run());

    let (id, _) = next_intervention(&mut events).await;
    let point = system.get(id).unwrap();
    assert_eq!(point.options.len(), 3);
    system
        .resolve(
            id,
            ResolutionAction::Select {
                option_id: "retry".into(),
            },
            "alice",
            None,
        )
        .unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let contexts = agent.contexts("deploy");
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0].decision, None);
    assert_eq!(contexts[1].decision.as_deref(), Some("retry"));
    assert!(contexts[1].prompt.contains("## Decision\nretry"));
    assert_eq!(
        report.tasks[&TaskId::from("deploy")].result,
        Some(json!({"decision": "retry"}))
    );
}

/// Test: Selecting a failing option fails the task
#[tokio::test]
async fn test_decision_fail_option() {
    let system = InterventionSystem::new();
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), approval_pair());
    let agent = Arc::new(ScriptedAgent::instant().with("deploy", Behavior::Decide(options())));
    let engine = engine(plan, agent.clone(), system.clone(), test_config());
    let mut events = engine.subscribe();
    let run = tokio::spawn(engine.run());

    let (id, _) = next_intervention(&mut events).await;
    let point = system
        .resolve(
            id,
            ResolutionAction::Select {
                option_id: "abort".into(),
            },
            "alice",
            None,
        )
        .unwrap();
    assert_eq!(point.status, InterventionStatus::Rejected);

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Failed);
    assert!(matches!(report.task_status("deploy"), Some(TaskStatus::Failed { .. })));
    assert_eq!(agent.call_count("deploy"), 1);
}

/// Test: Unknown options are refused and leave the point open
#[tokio::test]
async fn test_unknown_option_rejected() {
    let system = InterventionSystem::without_policies();
    let id = system
        .request_decision("s", &TaskId::from("t"), "Pick", "Which schema?", options(), None)
        .unwrap();
    let result = system.resolve(
        id,
        ResolutionAction::Select {
            option_id: "nope".into(),
        },
        "alice",
        None,
    );
    assert!(matches!(result, Err(Error::InvalidResolution(_))));
    assert_eq!(
        system.get(id).unwrap().status,
        InterventionStatus::WaitingForHuman
    );
}

fn changes(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().cloned().expect("object")
}

/// Test: Modifying a result sends the task back with the changes
/// Given a deploy task whose output needs approval
/// When the human resolves it with modifications
/// Then the task runs again with the changes in its context and completes
#[tokio::test]
async fn test_modify_redispatches_with_changes() {
    let system = InterventionSystem::new();
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), approval_pair());
    let agent = Arc::new(
        ScriptedAgent::instant().with("deploy", Behavior::Revise(json!({"region": "us-east-1"}))),
    );
    let engine = engine(plan, agent.clone(), system.clone(), test_config());
    let mut events = engine.subscribe();
    let run = tokio::spawn(engine.run());

    let (id, _) = next_intervention(&mut events).await;
    let point = system
        .resolve(
            id,
            ResolutionAction::Modify {
                modifications: changes(json!({"region": "eu-west-1"})),
            },
            "alice",
            Some("wrong region"),
        )
        .unwrap();
    assert_eq!(point.status, InterventionStatus::Modified);
    assert_eq!(point.modifications().unwrap()["region"], json!("eu-west-1"));

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.interventions[0].status, InterventionStatus::Modified);

    let contexts = agent.contexts("deploy");
    assert_eq!(contexts.len(), 2);
    assert!(contexts[0].modifications.is_none());
    assert_eq!(
        contexts[1].modifications.as_ref().unwrap()["region"],
        json!("eu-west-1")
    );
    assert!(contexts[1].prompt.contains("## Requested changes\n- region: eu-west-1"));
    assert_eq!(
        report.tasks[&TaskId::from("deploy")].result,
        Some(json!({"modifications": {"region": "eu-west-1"}}))
    );
    assert_eq!(agent.call_count("verify"), 1);
}

/// Test: A modification without changes is refused
#[tokio::test]
async fn test_empty_modification_rejected() {
    let system = InterventionSystem::without_policies();
    let id = system
        .request_approval("s", &TaskId::from("t"), "Ship it?", "", None)
        .unwrap();
    let result = system.resolve(
        id,
        ResolutionAction::Modify {
            modifications: serde_json::Map::new(),
        },
        "alice",
        None,
    );
    assert!(matches!(result, Err(Error::InvalidResolution(_))));
    assert_eq!(
        system.get(id).unwrap().status,
        InterventionStatus::WaitingForHuman
    );
}

/// Test: Checkpoints report progress and wait for acknowledgement
#[tokio::test]
async fn test_checkpoint_reports_progress() {
    let system = InterventionSystem::without_policies();
    let task = TaskId::from("migrate");
    let id = system
        .create_checkpoint("s", &task, "Halfway through the migration", 0.25, changes(json!({"rows": 1200})))
        .unwrap();

    let point = system.get(id).unwrap();
    assert_eq!(point.kind, InterventionKind::Checkpoint);
    assert_eq!(point.status, InterventionStatus::WaitingForHuman);
    assert_eq!(point.title, "Halfway through the migration");
    assert_eq!(point.description, "Progress: 25.0%");
    assert_eq!(point.context["progress"], json!(0.25));
    assert_eq!(point.context["rows"], json!(1200));

    let waiter = {
        let system = system.clone();
        tokio::spawn(async move { system.wait_for_resolution(id).await })
    };
    system.resolve(id, ResolutionAction::Approve, "ops", None).unwrap();
    assert_eq!(
        waiter.await.unwrap().unwrap().status,
        InterventionStatus::Approved
    );

    assert!(matches!(
        system.create_checkpoint("s", &task, "Too far", 1.5, serde_json::Map::new()),
        Err(Error::Validation(_))
    ));
}

/// Test: Reported errors carry a short title and the severity
#[test]
fn test_report_error_point() {
    let system = InterventionSystem::without_policies();
    let error = "connection to the primary database was refused after three attempts";
    let id = system
        .report_error(
            "s",
            &TaskId::from("migrate"),
            error,
            ErrorSeverity::Critical,
            changes(json!({"attempts": 3})),
        )
        .unwrap();

    let point = system.get(id).unwrap();
    assert_eq!(point.kind, InterventionKind::Error);
    assert_eq!(
        point.title,
        format!("Error: {}", &error[..50])
    );
    assert_eq!(point.description, error);
    assert_eq!(point.context["severity"], json!("critical"));
    assert_eq!(point.context["attempts"], json!(3));

    let short = system
        .report_error("s", &TaskId::from("t"), "disk full", ErrorSeverity::default(), serde_json::Map::new())
        .unwrap();
    let point = system.get(short).unwrap();
    assert_eq!(point.title, "Error: disk full");
    assert_eq!(point.context["severity"], json!("error"));
}

/// Test: A finished plan releases its settled interventions
/// Given an intervention system shared with another session
/// When a plan that raised an approval finishes
/// Then its settled points are dropped and the other session's open point stays
#[tokio::test]
async fn test_finished_plan_prunes_its_interventions() {
    let system = InterventionSystem::new();
    let other = system
        .request_approval("other-session", &TaskId::from("x"), "Unrelated", "", None)
        .unwrap();

    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), approval_pair());
    let agent = Arc::new(ScriptedAgent::instant().with("deploy", Behavior::NeedApproval(json!("plan"))));
    let engine = engine(plan, agent, system.clone(), test_config());
    let mut events = engine.subscribe();
    let run = tokio::spawn(engine.run());

    let (id, _) = next_intervention(&mut events).await;
    assert_eq!(system.len(), 2);
    system.resolve(id, ResolutionAction::Approve, "alice", None).unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.interventions.len(), 1);
    assert_eq!(system.len(), 1);
    assert!(system.get(id).is_none());
    assert_eq!(
        system.get(other).unwrap().status,
        InterventionStatus::WaitingForHuman
    );
}
