//! End-to-end plan execution tests.
//!
//! These tests run complete plans through the orchestrator and check the
//! final task states, spend and event stream.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use swarm::core::{Plan, PlanSpec, SkipReason, TaskId, TaskStatus};
use swarm::orchestration::{
    EventRecorder, MemorySink, Orchestrator, RunConfig, RunEvent, Script, SimulatedRunner,
    StopReason,
};
use swarm::Error;

use crate::fixtures::{diamond_plan, ids, test_task, write_plan};

/// Test: Diamond plan, every task succeeds
/// Given A, B independent, C after A and B, D after C, each costing 0.1
/// When the plan runs with 4 slots
/// Then waves are [A, B], [C], [D], all succeed and 0.4 is spent
#[tokio::test]
async fn test_diamond_all_succeed() {
    let sink = Arc::new(MemorySink::new());
    let runner = Arc::new(SimulatedRunner::new(Script::succeed(0.1)));

    let result = Orchestrator::new(diamond_plan(), runner, RunConfig::unlimited(4))
        .with_sink(sink.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Completed);
    assert_eq!(result.waves, vec![ids(&["A", "B"]), ids(&["C"]), ids(&["D"])]);
    assert_eq!(result.succeeded, 4);
    assert!(result.is_success());
    assert!((result.total_cost_usd - 0.4).abs() < 1e-9);

    // C starts only after both A and B completed.
    let events = sink.events();
    let position = |name: &str, id: &str| {
        events
            .iter()
            .position(|e| e.name() == name && e.task_id() == Some(&TaskId::from(id)))
            .unwrap()
    };
    let c_started = position("task_started", "C");
    assert!(position("task_completed", "A") < c_started);
    assert!(position("task_completed", "B") < c_started);
    assert!(position("task_completed", "C") < position("task_started", "D"));
}

/// Test: A failure skips everything downstream
/// Given the diamond plan where A fails
/// When the plan runs
/// Then B succeeds, A fails, C and D are skipped because of A
#[tokio::test]
async fn test_failure_skips_downstream() {
    let runner = Arc::new(SimulatedRunner::new(Script::succeed(0.1)).failing("A"));

    let result = Orchestrator::new(diamond_plan(), runner.clone(), RunConfig::unlimited(4))
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Completed);
    assert_eq!(result.succeeded, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.skipped, 2);
    assert_eq!(result.status_of("B"), Some(&TaskStatus::Succeeded));
    assert!(matches!(result.status_of("A"), Some(TaskStatus::Failed { .. })));

    let because_of_a = TaskStatus::Skipped {
        reason: SkipReason::DependencyFailed {
            task: TaskId::from("A"),
        },
    };
    assert_eq!(result.status_of("C"), Some(&because_of_a));
    assert_eq!(result.status_of("D"), Some(&because_of_a));

    // Skipped tasks never reach the runner; failed cost still counts.
    let executed = runner.executions().await;
    assert!(!executed.contains(&TaskId::from("C")));
    assert!(!executed.contains(&TaskId::from("D")));
    assert!((result.total_cost_usd - 0.2).abs() < 1e-9);
}

/// Test: Budget ceiling stops dispatching
/// Given the diamond plan, each task costing 0.1, and a ceiling of 0.15
/// When A and B have completed (spent 0.2)
/// Then C and D are skipped with reason budget exceeded
#[tokio::test]
async fn test_budget_exceeded_skips_remaining() {
    let sink = Arc::new(MemorySink::new());
    let runner = Arc::new(SimulatedRunner::new(Script::succeed(0.1)));

    let result = Orchestrator::new(
        diamond_plan(),
        runner,
        RunConfig::unlimited(4).with_budget(0.15),
    )
    .with_sink(sink.clone())
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(result.stop_reason, StopReason::BudgetExceeded);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.skipped, 2);
    assert!((result.total_cost_usd - 0.2).abs() < 1e-9);

    let over_budget = TaskStatus::Skipped {
        reason: SkipReason::BudgetExceeded,
    };
    assert_eq!(result.status_of("C"), Some(&over_budget));
    assert_eq!(result.status_of("D"), Some(&over_budget));

    let budget_events = sink
        .events()
        .iter()
        .filter(|e| matches!(e, RunEvent::BudgetExceeded { .. }))
        .count();
    assert_eq!(budget_events, 1);
}

/// Test: Budget exactly reached counts as exceeded
#[tokio::test]
async fn test_budget_reached_exactly_stops() {
    let plan = Plan::build(vec![test_task("A", &[]), test_task("B", &["A"])]).unwrap();
    let runner = Arc::new(SimulatedRunner::new(Script::succeed(0.5)));

    let result = Orchestrator::new(plan, runner, RunConfig::unlimited(1).with_budget(0.5))
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::BudgetExceeded);
    assert_eq!(result.status_of("A"), Some(&TaskStatus::Succeeded));
    assert_eq!(
        result.status_of("B"),
        Some(&TaskStatus::Skipped {
            reason: SkipReason::BudgetExceeded
        })
    );
}

/// Test: Plan file to recorded event log
/// Given a JSON plan using `files_to_modify` and an event recorder
/// When the plan runs
/// Then the log starts with run_started, ends with run_finished and
/// holds one task_completed per task
#[tokio::test]
async fn test_plan_file_with_event_recorder() {
    let dir = tempfile::tempdir().unwrap();
    let plan_path = write_plan(
        dir.path(),
        r#"{
            "prompt": "Add login",
            "tasks": [
                {"id": "schema", "description": "Add users table", "agent_type": "coder",
                 "dependencies": [], "files_to_modify": ["db/schema.sql"]},
                {"id": "api", "description": "Login endpoint", "agent_type": "coder",
                 "dependencies": ["schema"], "files_to_modify": ["src/api.rs"]},
                {"id": "tests", "description": "Login tests", "agent_type": "tester",
                 "dependencies": ["api"], "resources": ["tests/login.rs"]}
            ]
        }"#,
    );
    let events_path = dir.path().join("logs/events.jsonl");

    let plan = Plan::from_spec(PlanSpec::from_file(&plan_path).unwrap()).unwrap();
    assert_eq!(plan.prompt(), "Add login");
    let recorder = Arc::new(EventRecorder::create(&events_path).unwrap());
    let runner = Arc::new(SimulatedRunner::new(Script::succeed(0.01)));

    let result = Orchestrator::new(plan, runner, RunConfig::default())
        .with_sink(recorder)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.succeeded, 3);
    assert_eq!(result.dispatch_order, ids(&["schema", "api", "tests"]));

    let recorded = EventRecorder::load(&events_path).unwrap();
    assert_eq!(recorded.first().unwrap().event.name(), "run_started");
    match &recorded.last().unwrap().event {
        RunEvent::RunFinished {
            stop_reason,
            succeeded,
            ..
        } => {
            assert_eq!(*stop_reason, StopReason::Completed);
            assert_eq!(*succeeded, 3);
        }
        other => panic!("expected run_finished, got {:?}", other),
    }
    let completed = recorded
        .iter()
        .filter(|r| r.event.name() == "task_completed")
        .count();
    assert_eq!(completed, 3);
    assert!(recorded.windows(2).all(|w| w[0].elapsed_ms <= w[1].elapsed_ms));
}

/// Test: Invalid plans are rejected before anything runs
#[test]
fn test_invalid_plans_rejected() {
    let cyclic = Plan::build(vec![
        test_task("A", &["C"]),
        test_task("B", &["A"]),
        test_task("C", &["B"]),
        test_task("D", &[]),
    ]);
    match cyclic {
        Err(Error::Cycle { task }) => assert!(["A", "B", "C"].contains(&task.as_str())),
        other => panic!("expected cycle error, got {:?}", other.map(|p| p.len())),
    }

    let unknown = Plan::build(vec![test_task("A", &["ghost"])]);
    assert!(matches!(
        unknown,
        Err(Error::UnknownDependency { ref dependency, .. }) if dependency.as_str() == "ghost"
    ));

    let unknown_field = PlanSpec::from_json_str(r#"{"tasks": [{"id": "a", "description": "x", "priority": 1}]}"#);
    assert!(unknown_field.is_err());
}

/// Test: Result serializes for `swarm run --json`
#[tokio::test]
async fn test_run_result_json() {
    let runner = Arc::new(SimulatedRunner::new(Script::succeed(0.1)).failing("A"));
    let result = Orchestrator::new(diamond_plan(), runner, RunConfig::unlimited(2))
        .run(CancellationToken::new())
        .await
        .unwrap();

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["stop_reason"], "completed");
    assert_eq!(json["failed"], 1);
    assert_eq!(json["tasks"][2]["status"]["state"], "skipped");
    assert_eq!(json["tasks"][2]["status"]["reason"]["kind"], "dependency_failed");
}
