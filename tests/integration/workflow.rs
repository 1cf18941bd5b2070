//! End-to-end workflow tests.
//!
//! Worlds parsed from YAML, run against a scripted executor on a manual
//! clock, and one real run through the local executor.

use crate::common::{at, wait_for_task_state};
use std::sync::Arc;
use std::time::Duration;
use tideline::scheduler::ManualClock;
use tideline::testing::fixtures::{self, CHAIN_WORLD_YAML};
use tideline::testing::{FailureInjection, ScriptedExecutor, TestHarness};
use tideline::{
    AttemptOutcome, InMemoryStorage, LocalExecutor, ResourceName, Scheduler, Storage, TaskName,
    TaskState, parse_world,
};

/// Test: a YAML chain runs producer first, then consumer.
#[tokio::test]
async fn test_yaml_chain_runs_in_order() {
    let harness = TestHarness::start(at(0, 0), 2).await;
    let run_id = harness.submit(parse_world(CHAIN_WORLD_YAML).unwrap()).await;

    // Nothing is due before 09:00
    harness.tick_at(at(0, 8)).await;
    assert!(harness.executor().launched().is_empty());

    harness.tick_at(at(0, 9)).await;
    assert_eq!(harness.task_state(&run_id, "task_a").await, TaskState::Completed);
    assert_eq!(harness.task_state(&run_id, "task_b").await, TaskState::Queued);

    harness.tick_at(at(0, 10)).await;
    assert_eq!(harness.task_state(&run_id, "task_b").await, TaskState::Completed);
    assert_eq!(harness.executor().launched_tasks(), vec!["task_a", "task_b"]);

    let detail = harness.run(&run_id).await;
    assert!(detail.ledger.contains_key(&ResourceName::new("alpha")));
    assert!(detail.blocked_on.is_empty());

    harness.shutdown().await;
}

/// Test: rendered variables reach the work order.
#[tokio::test]
async fn test_work_order_carries_rendered_commands() {
    let harness = TestHarness::start(at(0, 9), 1).await;
    harness.submit(parse_world(CHAIN_WORLD_YAML).unwrap()).await;
    harness.tick_at(at(0, 9)).await;

    let launched = harness.executor().launched();
    assert_eq!(launched.len(), 1);
    let up = launched[0].plan.up.as_ref().unwrap();
    assert!(up.display().contains("20220103"), "got {}", up.display());
    // down only runs before a forced re-run
    assert!(launched[0].plan.down.is_none());

    harness.shutdown().await;
}

/// Test: an engine started late catches up one instant per task per tick.
#[tokio::test]
async fn test_catch_up_runs_every_missed_instant() {
    let harness = TestHarness::start(at(0, 0), 2).await;
    let run_id = harness.submit(fixtures::chain_world()).await;

    // Wednesday 11:00: Mon, Tue and Wed instants of both tasks are due
    for _ in 0..6 {
        harness.tick_at(at(2, 11)).await;
    }

    let detail = harness.run(&run_id).await;
    let a = TaskName::new("task_a");
    let b = TaskName::new("task_b");
    assert_eq!(detail.task_attempts[&a].len(), 3);
    assert_eq!(detail.task_attempts[&b].len(), 3);
    assert_eq!(detail.task_states[&b].instant, at(2, 10));
    assert_eq!(detail.task_states[&b].state, TaskState::Completed);

    harness.shutdown().await;
}

/// Test: a failed producer blocks its consumer until retried.
#[tokio::test]
async fn test_failed_producer_blocks_until_retry() {
    let executor = ScriptedExecutor::with_failures(2, FailureInjection::new().fail_times("task_a", 1));
    let harness = TestHarness::start_with(at(0, 0), executor).await;
    let run_id = harness.submit(fixtures::chain_world()).await;

    harness.tick_at(at(0, 9)).await;
    assert_eq!(harness.task_state(&run_id, "task_a").await, TaskState::Errored);

    harness.tick_at(at(0, 10)).await;
    let detail = harness.run(&run_id).await;
    assert_eq!(detail.task_states[&TaskName::new("task_b")].state, TaskState::Queued);
    assert!(detail.blocked_on.contains_key(&TaskName::new("task_b")));

    harness
        .handle()
        .retry_task(run_id.clone(), TaskName::new("task_a"))
        .await
        .unwrap();
    harness.tick_at(at(0, 10)).await;
    assert_eq!(harness.task_state(&run_id, "task_a").await, TaskState::Completed);
    harness.tick_at(at(0, 10)).await;
    assert_eq!(harness.task_state(&run_id, "task_b").await, TaskState::Completed);

    let detail = harness.run(&run_id).await;
    let outcomes: Vec<AttemptOutcome> = detail.task_attempts[&TaskName::new("task_a")]
        .iter()
        .map(|a| a.outcome)
        .collect();
    assert_eq!(outcomes, vec![AttemptOutcome::Failed, AttemptOutcome::Succeeded]);

    harness.shutdown().await;
}

/// Test: a single-instant world runs through the local executor and its
/// command sees world variables and the interval's date fields.
#[tokio::test]
async fn test_local_executor_runs_shell_command() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
variables:
  OUT: {}
calendars:
  every_day:
    mask: [Mon, Tue, Wed, Thu, Fri, Sat, Sun]
tasks:
  stamp:
    up: "echo ${{yyyymmdd}} > ${{OUT}}/stamp"
    provides: [stamp]
    calendar: every_day
    times: ["09:00"]
    valid_from: "2022-01-03T00:00:00"
    valid_to: "2022-01-04T00:00:00"
"#,
        dir.path().display()
    );
    let world = parse_world(&yaml).unwrap();

    let storage = Arc::new(InMemoryStorage::new());
    let scheduler = Scheduler::with_storage(Arc::clone(&storage))
        .with_clock(Arc::new(ManualClock::new(at(0, 9))))
        .with_executor(Arc::new(LocalExecutor::new(1)))
        .with_tick_interval(Duration::from_secs(3600));
    let (handle, task) = scheduler.start().await;

    let run_id = handle.submit("local", world).await.unwrap();
    wait_for_task_state(
        &handle,
        &run_id,
        "stamp",
        TaskState::Completed,
        Duration::from_secs(10),
    )
    .await;

    let stamp = std::fs::read_to_string(dir.path().join("stamp")).unwrap();
    assert_eq!(stamp.trim(), "20220103");

    handle.shutdown().await.unwrap();
    let _ = task.await;

    let stored = storage.load_run(&run_id).await.unwrap();
    assert_eq!(stored.attempts.len(), 1);
    assert_eq!(stored.attempts[0].1.executor, "local");
    assert_eq!(stored.intervals.len(), 1);
}
