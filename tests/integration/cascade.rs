//! Failure cascade tests.
//!
//! A failed task takes every transitive dependent down with it; independent
//! branches keep running.

use std::sync::Arc;

use memnexus::core::{Role, TaskStatus};
use memnexus::orchestration::{
    AgentCapacity, InterventionSystem, PlanStatus, ProgressEvent, Strategy,
};

use crate::fixtures::{
    build_plan, collect_events, diamond, engine, spec, test_config, Behavior, ScriptedAgent,
};

/// Test: Cascade along a chain
/// Given A -> B -> C
/// When A fails
/// Then B and C are skipped and never run
#[tokio::test]
async fn test_failure_skips_transitive_dependents() {
    let tasks = vec![
        spec("A", Role::Backend, &[]),
        spec("B", Role::Backend, &["A"]),
        spec("C", Role::Backend, &["B"]),
    ];
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), tasks);
    let agent = Arc::new(ScriptedAgent::instant().with("A", Behavior::Fail("compile error".into())));
    let engine = engine(plan, agent.clone(), InterventionSystem::new(), test_config());
    let events = tokio::spawn(collect_events(engine.subscribe()));

    let report = engine.run().await.unwrap();
    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(
        report.task_status("A"),
        Some(&TaskStatus::Failed {
            error: "compile error".into()
        })
    );
    for id in ["B", "C"] {
        assert_eq!(
            report.task_status(id),
            Some(&TaskStatus::Skipped {
                reason: "dependency A failed".into()
            })
        );
        assert_eq!(agent.call_count(id), 0, "{} must never run", id);
    }
    assert_eq!(report.progress.failed, 1);
    assert_eq!(report.progress.skipped, 2);

    let events = events.await.unwrap();
    assert!(!events
        .iter()
        .any(|e| matches!(e, ProgressEvent::TaskStarted { task_id, .. } if task_id.as_str() != "A")));
    let skipped = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::TaskSkipped { .. }))
        .count();
    assert_eq!(skipped, 2);
}

/// Test: Independent branches survive
/// Given the diamond a -> {b, c} -> d
/// When b fails
/// Then c still completes and only d is skipped
#[tokio::test]
async fn test_failure_spares_independent_branch() {
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), diamond());
    let agent = Arc::new(ScriptedAgent::instant().with("b", Behavior::Fail("tests red".into())));
    let engine = engine(plan, agent.clone(), InterventionSystem::new(), test_config());

    let report = engine.run().await.unwrap();
    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(report.task_status("a"), Some(&TaskStatus::Completed));
    assert_eq!(report.task_status("c"), Some(&TaskStatus::Completed));
    assert!(matches!(report.task_status("b"), Some(TaskStatus::Failed { .. })));
    assert!(matches!(report.task_status("d"), Some(TaskStatus::Skipped { .. })));
    assert_eq!(agent.call_count("d"), 0);
}

/// Test: No task is left running when the plan finishes
#[tokio::test]
async fn test_no_task_left_unfinished() {
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), diamond());
    let agent = Arc::new(ScriptedAgent::instant().with("a", Behavior::Panic));
    let engine = engine(plan, agent, InterventionSystem::new(), test_config());

    let report = engine.run().await.unwrap();
    assert!(report.tasks.values().all(|t| t.is_finished()));
    assert_eq!(report.progress.fraction, 1.0);
}
