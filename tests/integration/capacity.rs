//! Capacity enforcement tests.
//!
//! These tests verify that the engine never runs more agents of a role than
//! the plan's capacity allows, and that freed slots are reused.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use memnexus::core::{Role, TaskId};
use memnexus::orchestration::{AgentCapacity, InterventionSystem, PlanStatus, Strategy};

use crate::fixtures::{
    build_plan, engine, independent, test_config, wait_started, Behavior, ScriptedAgent,
};

/// Test: Role capacity 2 with 3 ready tasks
/// Given three independent backend tasks and two backend agents
/// When the plan runs
/// Then only two run until one of them completes
#[tokio::test]
async fn test_capacity_two_three_ready_tasks() {
    let gates: Vec<Arc<Notify>> = (0..3).map(|_| Arc::new(Notify::new())).collect();
    let agent = Arc::new(
        ScriptedAgent::instant()
            .with("backend-1", Behavior::Gate(gates[0].clone()))
            .with("backend-2", Behavior::Gate(gates[1].clone()))
            .with("backend-3", Behavior::Gate(gates[2].clone())),
    );
    let plan = build_plan(
        Strategy::Parallel,
        AgentCapacity::new().with(Role::Backend, 2),
        independent(3, Role::Backend),
    );
    let engine = engine(plan, agent.clone(), InterventionSystem::new(), test_config());
    let mut events = engine.subscribe();
    let run = tokio::spawn(engine.run());

    wait_started(&mut events, "backend-1").await;
    wait_started(&mut events, "backend-2").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent.call_count("backend-3"), 0, "third task must wait for a slot");

    gates[0].notify_one();
    wait_started(&mut events, "backend-3").await;
    gates[1].notify_one();
    gates[2].notify_one();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(agent.max_concurrency_for(&Role::Backend), 2);

    // the freed slot is reused
    let first = report.tasks[&TaskId::from("backend-1")].agent_id;
    let third = report.tasks[&TaskId::from("backend-3")].agent_id;
    assert!(first.is_some());
    assert_eq!(first, third);
}

/// Test: Capacity is tracked per role
#[tokio::test]
async fn test_capacity_per_role() {
    let mut tasks = independent(3, Role::Backend);
    tasks.extend(independent(3, Role::Frontend));
    let plan = build_plan(
        Strategy::Parallel,
        AgentCapacity::new().with(Role::Backend, 1).with(Role::Frontend, 2),
        tasks,
    );
    let agent = Arc::new(ScriptedAgent::new(Duration::from_millis(30)));
    let engine = engine(plan, agent.clone(), InterventionSystem::new(), test_config());

    let report = engine.run().await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(agent.max_concurrency_for(&Role::Backend), 1);
    assert_eq!(agent.max_concurrency_for(&Role::Frontend), 2);
    assert_eq!(agent.max_concurrency(), 3);
}

/// Test: Unlisted roles get one agent
#[tokio::test]
async fn test_default_capacity_is_one() {
    let plan = build_plan(
        Strategy::Parallel,
        AgentCapacity::new(),
        independent(4, Role::Other("docs".into())),
    );
    let agent = Arc::new(ScriptedAgent::new(Duration::from_millis(10)));
    let engine = engine(plan, agent.clone(), InterventionSystem::new(), test_config());

    let report = engine.run().await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(agent.max_concurrency(), 1);
}
