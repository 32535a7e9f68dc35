//! Resource lock tests.
//!
//! These tests verify that tasks declaring the same resource never run at
//! the same time, that lock acquisition is all-or-nothing, and that locks
//! are released however a task ends.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use swarm::core::{Plan, TaskId, TaskStatus};
use swarm::orchestration::{
    run, MemorySink, Orchestrator, ResourceConflict, RunConfig, RunEvent, Script,
    SimulatedRunner,
};

use crate::fixtures::{ids, resource_task, InstrumentedRunner, PanickingRunner};

/// Test: Shared resource serializes independent tasks
/// Given X and Y both declaring resource `x` and 2 slots
/// When the plan runs
/// Then they never overlap and the conflict is recorded once
#[tokio::test]
async fn test_shared_resource_serializes() {
    let plan = Plan::build(vec![
        resource_task("X", &[], &["x"]),
        resource_task("Y", &[], &["x"]),
    ])
    .unwrap();
    let runner = Arc::new(InstrumentedRunner::new(Duration::from_millis(30), 0.0));
    let sink = Arc::new(MemorySink::new());

    let result = Orchestrator::new(plan, runner.clone(), RunConfig::unlimited(2))
        .with_sink(sink.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.succeeded, 2);
    assert_eq!(runner.max_running(), 1);
    assert!(runner.violations().is_empty());
    assert_eq!(result.dispatch_order, ids(&["X", "Y"]));
    assert_eq!(
        result.conflicts,
        vec![ResourceConflict {
            resource: "x".to_string(),
            holder: TaskId::from("X"),
            waiting: TaskId::from("Y"),
        }]
    );

    let conflict_events = sink
        .events()
        .iter()
        .filter(|e| matches!(e, RunEvent::ResourceConflict { .. }))
        .count();
    assert_eq!(conflict_events, 1);
}

/// Test: Lock acquisition is all-or-nothing
/// Given A holding `x`, B wanting `y` and `x`, C wanting `y`
/// When B cannot get `x`
/// Then B holds nothing, so C gets `y` and runs alongside A
#[tokio::test]
async fn test_partial_locks_not_held() {
    let plan = Plan::build(vec![
        resource_task("A", &[], &["x"]),
        resource_task("B", &[], &["y", "x"]),
        resource_task("C", &[], &["y"]),
    ])
    .unwrap();
    let runner = Arc::new(InstrumentedRunner::new(Duration::from_millis(30), 0.0));

    let result = run(plan, runner.clone(), RunConfig::unlimited(3), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.succeeded, 3);
    assert_eq!(&result.dispatch_order[..2], &ids(&["A", "C"])[..]);
    assert_eq!(result.dispatch_order[2], TaskId::from("B"));
    assert!(runner.violations().is_empty());
    assert!(result.conflicts.contains(&ResourceConflict {
        resource: "x".to_string(),
        holder: TaskId::from("A"),
        waiting: TaskId::from("B"),
    }));
}

/// Test: Overlapping resources under load never overlap in time
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_exclusivity_under_load() {
    let resources = ["src/a.rs", "src/b.rs", "src/c.rs"];
    let tasks = (0..12)
        .map(|i| {
            let first = resources[i % 3];
            let second = resources[(i / 3) % 3];
            resource_task(&format!("t{}", i), &[], &[first, second])
        })
        .collect();
    let plan = Plan::build(tasks).unwrap();
    let runner = Arc::new(InstrumentedRunner::new(Duration::from_millis(5), 0.0));

    let result = run(plan, runner.clone(), RunConfig::unlimited(4), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.succeeded, 12);
    assert!(runner.violations().is_empty(), "{:?}", runner.violations());
}

/// Test: Locks are released when a task fails
#[tokio::test]
async fn test_locks_released_on_failure() {
    let plan = Plan::build(vec![
        resource_task("A", &[], &["shared.rs"]),
        resource_task("B", &[], &["shared.rs"]),
    ])
    .unwrap();
    let runner = Arc::new(InstrumentedRunner::new(Duration::from_millis(5), 0.0).failing("A"));

    let result = run(plan, runner, RunConfig::unlimited(2), CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(result.status_of("A"), Some(TaskStatus::Failed { .. })));
    assert_eq!(result.status_of("B"), Some(&TaskStatus::Succeeded));
}

/// Test: Locks are released when an agent panics
#[tokio::test]
async fn test_locks_released_on_panic() {
    let plan = Plan::build(vec![
        resource_task("A", &[], &["shared.rs"]),
        resource_task("B", &[], &["shared.rs"]),
    ])
    .unwrap();

    let result = run(
        plan,
        Arc::new(PanickingRunner::new("A")),
        RunConfig::unlimited(2),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    match result.status_of("A") {
        Some(TaskStatus::Failed { error }) => assert!(error.contains("crashed")),
        other => panic!("expected crash failure, got {:?}", other),
    }
    assert_eq!(result.status_of("B"), Some(&TaskStatus::Succeeded));
}

/// Test: Locks are released when an attempt times out
#[tokio::test]
async fn test_locks_released_on_timeout() {
    let plan = Plan::build(vec![
        resource_task("slow", &[], &["shared.rs"]),
        resource_task("next", &[], &["shared.rs"]),
    ])
    .unwrap();
    let runner = Arc::new(
        SimulatedRunner::new(Script::succeed(0.0))
            .script("slow", Script::succeed(0.0).with_delay(Duration::from_secs(30))),
    );

    let result = run(
        plan,
        runner,
        RunConfig::unlimited(2).with_timeout(Duration::from_millis(50)),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(matches!(result.status_of("slow"), Some(TaskStatus::Failed { .. })));
    assert_eq!(result.status_of("next"), Some(&TaskStatus::Succeeded));
}
