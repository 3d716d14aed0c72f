//! Review gate tests.
//!
//! Under the review strategy a phase opens only once every earlier phase is
//! completed, skipped or waived. A failure asks a human whether to waive it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use memnexus::core::{Role, TaskId, TaskStatus};
use memnexus::orchestration::{
    AgentCapacity, EngineConfig, InterventionStatus, InterventionSystem, PlanStatus,
    ResolutionAction, Strategy,
};

use crate::fixtures::{
    build_plan, engine, next_intervention, spec, test_config, wait_started, Behavior,
    ScriptedAgent,
};

/// a and b in phase 0; c needs only b but sits in phase 1.
fn gated_tasks() -> Vec<memnexus::core::TaskSpec> {
    vec![
        spec("a", Role::Backend, &[]),
        spec("b", Role::Frontend, &[]),
        spec("c", Role::Tester, &["b"]),
    ]
}

/// Test: A phase waits for the whole previous phase
#[tokio::test]
async fn test_review_gate_holds_next_phase() {
    let gate = Arc::new(Notify::new());
    let agent = Arc::new(ScriptedAgent::instant().with("a", Behavior::Gate(gate.clone())));
    let plan = build_plan(Strategy::Review, AgentCapacity::new(), gated_tasks());
    let engine = engine(plan, agent.clone(), InterventionSystem::new(), test_config());
    let mut events = engine.subscribe();
    let run = tokio::spawn(engine.run());

    wait_started(&mut events, "a").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent.call_count("b"), 1);
    assert_eq!(agent.call_count("c"), 0, "c must wait for phase 0 to finish");

    gate.notify_one();
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(
        agent.call_order().last(),
        Some(&TaskId::from("c"))
    );
}

/// Test: Approving the waiver opens the gate
#[tokio::test]
async fn test_review_waiver_approved() {
    let system = InterventionSystem::new();
    let agent = Arc::new(ScriptedAgent::instant().with("a", Behavior::Fail("lint errors".into())));
    let plan = build_plan(Strategy::Review, AgentCapacity::new(), gated_tasks());
    let engine = engine(plan, agent.clone(), system.clone(), test_config());
    let mut events = engine.subscribe();
    let run = tokio::spawn(engine.run());

    let (id, task) = next_intervention(&mut events).await;
    assert_eq!(task.as_str(), "a");
    assert!(system.get(id).unwrap().title.contains("Waive failure of a"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(agent.call_count("c"), 0);

    system
        .resolve(id, ResolutionAction::Approve, "lead", None)
        .unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.waived, vec![TaskId::from("a")]);
    assert!(matches!(report.task_status("a"), Some(TaskStatus::Failed { .. })));
    assert_eq!(report.task_status("c"), Some(&TaskStatus::Completed));
}

/// Test: Rejecting the waiver skips everything behind the gate
#[tokio::test]
async fn test_review_waiver_rejected() {
    let system = InterventionSystem::new();
    let agent = Arc::new(ScriptedAgent::instant().with("a", Behavior::Fail("lint errors".into())));
    let plan = build_plan(Strategy::Review, AgentCapacity::new(), gated_tasks());
    let engine = engine(plan, agent.clone(), system.clone(), test_config());
    let mut events = engine.subscribe();
    let run = tokio::spawn(engine.run());

    let (id, _) = next_intervention(&mut events).await;
    system
        .resolve(id, ResolutionAction::Reject, "lead", None)
        .unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Failed);
    assert!(report.waived.is_empty());
    assert_eq!(report.task_status("b"), Some(&TaskStatus::Completed));
    assert_eq!(
        report.task_status("c"),
        Some(&TaskStatus::Skipped {
            reason: "review gate closed after a failed".into()
        })
    );
    assert_eq!(agent.call_count("c"), 0);
}

/// Test: An expired waiver closes the gate
#[tokio::test]
async fn test_review_waiver_expires() {
    let system = InterventionSystem::new();
    let agent = Arc::new(ScriptedAgent::instant().with("a", Behavior::Fail("lint errors".into())));
    let plan = build_plan(Strategy::Review, AgentCapacity::new(), gated_tasks());
    let config = EngineConfig {
        review_gate_timeout: Some(Duration::from_millis(100)),
        ..test_config()
    };
    let engine = engine(plan, agent, system, config);

    let report = tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("plan must finish after the waiver expires")
        .unwrap();
    assert_eq!(report.status, PlanStatus::Failed);
    assert!(matches!(report.task_status("c"), Some(TaskStatus::Skipped { .. })));
    assert_eq!(report.interventions[0].status, InterventionStatus::Expired);
}
