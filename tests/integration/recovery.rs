//! Failure handling and cancellation tests.
//!
//! These tests verify retries inside a single dispatch, timeouts, agent
//! crashes and cooperative cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use swarm::core::{Plan, SkipReason, TaskId, TaskStatus};
use swarm::orchestration::{
    run, MemorySink, Orchestrator, RunConfig, RunEvent, Script, SimulatedRunner, StopReason,
};

use crate::fixtures::{chain_plan, diamond_plan, test_task, CancelOnStart, PanickingRunner};

/// Test: Flaky agent recovers within its retry allowance
/// Given A failing twice before succeeding and 3 attempts allowed
/// When the plan runs
/// Then A succeeds once dispatched, with all three costs counted
#[tokio::test]
async fn test_flaky_task_recovers_with_retry() {
    let sink = Arc::new(MemorySink::new());
    let runner = Arc::new(SimulatedRunner::new(Script::succeed(0.1)).flaky("A", 2));

    let result = Orchestrator::new(
        diamond_plan(),
        runner.clone(),
        RunConfig::unlimited(4).with_max_attempts(3),
    )
    .with_sink(sink.clone())
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert!(result.is_success());
    let a = result.task(&TaskId::from("A")).unwrap();
    assert_eq!(a.attempts, 3);
    assert!((a.cost_usd - 0.3).abs() < 1e-9);
    assert!((result.total_cost_usd - 0.6).abs() < 1e-9);

    // Retries never produce a second dispatch.
    let started_a = sink
        .events()
        .iter()
        .filter(|e| matches!(e, RunEvent::TaskStarted { task_id, .. } if task_id.as_str() == "A"))
        .count();
    assert_eq!(started_a, 1);
    assert_eq!(result.dispatch_order.iter().filter(|id| id.as_str() == "A").count(), 1);
}

/// Test: Without retries a flaky agent fails the task
#[tokio::test]
async fn test_no_retry_by_default() {
    let runner = Arc::new(SimulatedRunner::new(Script::succeed(0.1)).flaky("A", 1));

    let result = run(diamond_plan(), runner, RunConfig::unlimited(4), CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(result.status_of("A"), Some(TaskStatus::Failed { .. })));
    assert_eq!(result.skipped, 2);
}

/// Test: Timeout fails the task and cascades
#[tokio::test]
async fn test_timeout_cascades() {
    let runner = Arc::new(
        SimulatedRunner::new(Script::succeed(0.0))
            .script("B", Script::succeed(0.0).with_delay(Duration::from_secs(30))),
    );
    let started = Instant::now();

    let result = run(
        diamond_plan(),
        runner,
        RunConfig::unlimited(4).with_timeout(Duration::from_millis(100)),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    match result.status_of("B") {
        Some(TaskStatus::Failed { error }) => assert!(error.contains("timed out")),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(result.status_of("A"), Some(&TaskStatus::Succeeded));
    assert_eq!(
        result.status_of("D"),
        Some(&TaskStatus::Skipped {
            reason: SkipReason::DependencyFailed {
                task: TaskId::from("B")
            }
        })
    );
}

/// Test: A crashing agent fails its task without ending the run
#[tokio::test]
async fn test_panicking_agent_fails_task() {
    let result = run(
        diamond_plan(),
        Arc::new(PanickingRunner::new("C")),
        RunConfig::unlimited(4),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.stop_reason, StopReason::Completed);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.skipped, 1);
}

/// Test: Cancellation lets running tasks finish and skips the rest
/// Given a chain of 4 tasks where the run is cancelled as task_1 starts
/// When the plan runs
/// Then task_1 still completes and task_2, task_3 are skipped as cancelled
#[tokio::test]
async fn test_cancel_mid_run() {
    let cancel = CancellationToken::new();
    let runner = Arc::new(CancelOnStart::new("task_1", cancel.clone()));

    let result = run(chain_plan(4), runner, RunConfig::unlimited(2), cancel)
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Cancelled);
    assert_eq!(result.status_of("task_0"), Some(&TaskStatus::Succeeded));
    assert_eq!(result.status_of("task_1"), Some(&TaskStatus::Succeeded));
    let cancelled = TaskStatus::Skipped {
        reason: SkipReason::Cancelled,
    };
    assert_eq!(result.status_of("task_2"), Some(&cancelled));
    assert_eq!(result.status_of("task_3"), Some(&cancelled));
    assert!((result.total_cost_usd - 0.2).abs() < 1e-9);
}

/// Test: An external cancel wakes the loop while it waits
#[tokio::test]
async fn test_external_cancel_while_waiting() {
    let cancel = CancellationToken::new();
    let runner = Arc::new(SimulatedRunner::new(
        Script::succeed(0.1).with_delay(Duration::from_millis(200)),
    ));
    let sink = Arc::new(MemorySink::new());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = Orchestrator::new(diamond_plan(), runner, RunConfig::unlimited(4))
        .with_sink(sink.clone())
        .run(cancel)
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Cancelled);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.skipped, 2);

    // C and D are skipped before A and B report back.
    let events = sink.events();
    let first_skip = events
        .iter()
        .position(|e| e.name() == "task_skipped")
        .unwrap();
    let first_completion = events
        .iter()
        .position(|e| e.name() == "task_completed")
        .unwrap();
    assert!(first_skip < first_completion);
}

/// Test: Retries stop once the budget is exhausted
/// Given A succeeding at 0.2 and a slower B failing every attempt at 0.1
/// When the run allows 5 attempts under a 0.15 ceiling
/// Then B gives up after its first failure instead of retrying past the ceiling
#[tokio::test]
async fn test_budget_stop_ends_retries() {
    let runner = Arc::new(
        SimulatedRunner::new(Script::succeed(0.2))
            .script("B", Script::fail(0.1).with_delay(Duration::from_millis(50))),
    );
    let plan = Plan::build(vec![
        test_task("A", &[]),
        test_task("B", &[]),
        test_task("C", &["A", "B"]),
    ])
    .unwrap();

    let result = run(
        plan,
        runner.clone(),
        RunConfig::unlimited(2).with_budget(0.15).with_max_attempts(5),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.stop_reason, StopReason::BudgetExceeded);
    let b = result.task(&TaskId::from("B")).unwrap();
    assert_eq!(b.attempts, 1);
    match &b.status {
        TaskStatus::Failed { error } => assert!(error.contains("stopped before retry")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!((result.total_cost_usd - 0.3).abs() < 1e-9);
    let b_runs = runner
        .executions()
        .await
        .iter()
        .filter(|id| id.as_str() == "B")
        .count();
    assert_eq!(b_runs, 1);
    assert_eq!(
        result.status_of("C"),
        Some(&TaskStatus::Skipped {
            reason: SkipReason::BudgetExceeded
        })
    );
}

/// Test: Cancellation ends a retrying task after its current attempt
/// Given A failing every 40ms attempt with 5 attempts allowed
/// When the run is cancelled during the first attempt
/// Then A stops after that attempt and its cost is still recorded
#[tokio::test]
async fn test_cancel_ends_retries() {
    let cancel = CancellationToken::new();
    let runner = Arc::new(SimulatedRunner::new(
        Script::fail(0.1).with_delay(Duration::from_millis(40)),
    ));
    let plan = Plan::build(vec![test_task("A", &[])]).unwrap();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let result = run(
        plan,
        runner.clone(),
        RunConfig::unlimited(1).with_max_attempts(5),
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(result.stop_reason, StopReason::Cancelled);
    let a = result.task(&TaskId::from("A")).unwrap();
    assert_eq!(a.attempts, 1);
    assert!(matches!(a.status, TaskStatus::Failed { .. }));
    assert_eq!(runner.executions().await.len(), 1);
    assert!((result.total_cost_usd - 0.1).abs() < 1e-9);
}
