//! Planning tests: plan files, strategy resolution, structural errors and
//! analysis, all through the public API.

use std::io::Write;

use memnexus::core::{Role, TaskId};
use memnexus::orchestration::{
    AgentCapacity, PlanRequest, Strategy, SuggestionKind, TaskScheduler,
};
use memnexus::Error;

use crate::fixtures::{build_plan, diamond, independent, spec};

const FEATURE_TOML: &str = r#"
strategy = "review"

[[tasks]]
id = "design"
role = "architect"
duration = 2
prompt = "Design the billing API"

[[tasks]]
id = "api"
role = "backend"
deps = ["design"]
duration = 3

[[tasks]]
id = "ui"
role = "frontend"
dependencies = ["design"]

[[tasks]]
id = "e2e"
role = "tester"
deps = ["api", "ui"]
metadata = { requires_approval = true }
"#;

/// Test: Plan files load from TOML and JSON
#[test]
fn test_load_plan_files() {
    let dir = tempfile::tempdir().unwrap();

    let toml_path = dir.path().join("feature.toml");
    std::fs::File::create(&toml_path)
        .unwrap()
        .write_all(FEATURE_TOML.as_bytes())
        .unwrap();
    let request = PlanRequest::load(&toml_path).unwrap();
    assert_eq!(request.strategy, Some(Strategy::Review));
    assert_eq!(request.tasks.len(), 4);
    assert_eq!(request.tasks[2].dependencies, vec![TaskId::from("design")]);
    assert_eq!(request.tasks[3].metadata["requires_approval"], serde_json::json!(true));

    let json_path = dir.path().join("feature.json");
    std::fs::write(&json_path, serde_json::to_string(&request).unwrap()).unwrap();
    assert_eq!(PlanRequest::load(&json_path).unwrap(), request);
}

/// Test: Durations weight the critical path and slack
#[test]
fn test_feature_plan_analysis() {
    let request = PlanRequest::from_toml_str(FEATURE_TOML).unwrap();
    let scheduler = TaskScheduler::default();
    let plan = scheduler.build_plan(request, "analysis").unwrap();

    assert_eq!(plan.strategy, Strategy::Review);
    assert_eq!(plan.effective_strategy, Strategy::Review);
    assert_eq!(
        plan.critical_path.tasks,
        vec![TaskId::from("design"), TaskId::from("api"), TaskId::from("e2e")]
    );
    assert_eq!(plan.critical_path.length, 6);
    assert_eq!(plan.slack_of(&TaskId::from("ui")), 2);
    assert_eq!(plan.slack_of(&TaskId::from("api")), 0);

    let analysis = scheduler.analyze(&plan);
    assert_eq!(analysis.bottlenecks[0].task, TaskId::from("design"));
    assert_eq!(analysis.bottlenecks[0].dependents, 2);
    assert!(analysis
        .suggestions
        .iter()
        .any(|s| s.kind == SuggestionKind::IncreaseParallelism));
}

/// Test: Auto picks parallel only when the widest phase exceeds capacity
#[test]
fn test_auto_strategy_resolution() {
    let narrow = build_plan(
        Strategy::Auto,
        AgentCapacity::new().with(Role::Backend, 3),
        independent(3, Role::Backend),
    );
    assert_eq!(narrow.strategy, Strategy::Auto);
    assert_eq!(narrow.effective_strategy, Strategy::Sequential);

    let wide = build_plan(
        Strategy::Auto,
        AgentCapacity::new().with(Role::Backend, 2),
        independent(3, Role::Backend),
    );
    assert_eq!(wide.effective_strategy, Strategy::Parallel);

    // only the roles in the graph count towards capacity
    let unrelated = build_plan(
        Strategy::Auto,
        AgentCapacity::new().with(Role::Backend, 1).with(Role::Frontend, 10),
        independent(2, Role::Backend),
    );
    assert_eq!(unrelated.effective_strategy, Strategy::Parallel);
}

/// Test: Structural errors surface before execution
#[test]
fn test_structural_errors() {
    let scheduler = TaskScheduler::new(AgentCapacity::new(), Strategy::Parallel);

    let unknown = PlanRequest::new(Strategy::Parallel, vec![spec("a", Role::Backend, &["ghost"])]);
    match scheduler.build_plan(unknown, "s") {
        Err(Error::UnknownDependency { task, dependency }) => {
            assert_eq!(task.as_str(), "a");
            assert_eq!(dependency.as_str(), "ghost");
        }
        other => panic!("unexpected result {:?}", other),
    }

    let cyclic = PlanRequest::new(
        Strategy::Parallel,
        vec![
            spec("A", Role::Backend, &["C"]),
            spec("B", Role::Backend, &["A"]),
            spec("C", Role::Backend, &["B"]),
        ],
    );
    match scheduler.build_plan(cyclic, "s") {
        Err(Error::CyclicDependency { cycle }) => {
            let ids: Vec<&str> = cycle.iter().map(|id| id.as_str()).collect();
            assert_eq!(ids, vec!["A", "B", "C", "A"]);
        }
        other => panic!("unexpected result {:?}", other),
    }

    let duplicate = PlanRequest::new(
        Strategy::Parallel,
        vec![spec("a", Role::Backend, &[]), spec("a", Role::Tester, &[])],
    );
    assert!(matches!(
        scheduler.build_plan(duplicate, "s"),
        Err(Error::DuplicateTask(_))
    ));

    let starved = TaskScheduler::new(AgentCapacity::new().with(Role::Tester, 0), Strategy::Parallel);
    assert!(matches!(
        starved.build_plan(PlanRequest::new(Strategy::Parallel, diamond()), "s"),
        Err(Error::NoCapacityForRole(Role::Tester))
    ));
}

/// Test: Ready-set recomputation is idempotent
#[test]
fn test_ready_set_idempotent() {
    let mut plan = build_plan(Strategy::Parallel, AgentCapacity::new(), diamond());
    assert_eq!(plan.ready_set(), vec![TaskId::from("a")]);
    assert_eq!(plan.ready_set(), plan.ready_set());

    plan.task_mut(&TaskId::from("a")).unwrap().complete();
    let first = plan.ready_set();
    let second = plan.ready_set();
    assert_eq!(first, second);
    assert_eq!(first, vec![TaskId::from("b"), TaskId::from("c")]);
}

/// Test: Adding capacity to the busiest role is suggested
#[test]
fn test_add_capacity_suggestion() {
    let scheduler = TaskScheduler::new(AgentCapacity::new(), Strategy::Parallel);
    let plan = build_plan(Strategy::Parallel, AgentCapacity::new(), independent(4, Role::Backend));
    assert_eq!(plan.estimated_duration, 4);

    let suggestions = scheduler.suggest_optimizations(&plan);
    let add = suggestions
        .iter()
        .find(|s| s.kind == SuggestionKind::AddCapacity)
        .expect("add-capacity suggestion");
    assert_eq!(add.role, Some(Role::Backend));
    assert!(add.description.contains("from 4 to 2"));
    assert!(suggestions
        .iter()
        .any(|s| s.kind == SuggestionKind::AgentScaling && s.role == Some(Role::Backend)));
}
