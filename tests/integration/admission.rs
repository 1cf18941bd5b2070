//! Admission tests.
//!
//! Candidates from every run compete for one core budget, oldest scheduled
//! instant first, then oldest run.

use crate::common::at;
use chrono::Duration as ChronoDuration;
use tideline::core::task::CommandSpec;
use tideline::testing::fixtures::{self, TaskBuilder};
use tideline::testing::{FailureInjection, ScriptedExecutor, TestHarness};
use tideline::{TaskName, TaskState};

/// Test: the earlier instant wins even when it belongs to a newer run.
#[tokio::test]
async fn test_earlier_instant_admitted_first() {
    let harness = TestHarness::start(at(0, 0), 1).await;
    let late = harness
        .submit(fixtures::world([TaskBuilder::new("late").at(9, 30).build()]))
        .await;
    let early = harness
        .submit(fixtures::world([TaskBuilder::new("early").at(9, 0).build()]))
        .await;

    harness.tick_at(at(0, 10)).await;
    assert_eq!(harness.executor().launched_tasks(), vec!["early"]);
    assert_eq!(harness.task_state(&early, "early").await, TaskState::Completed);
    assert_eq!(harness.task_state(&late, "late").await, TaskState::Queued);

    harness.tick_at(at(0, 10)).await;
    assert_eq!(harness.executor().launched_tasks(), vec!["early", "late"]);

    harness.shutdown().await;
}

/// Test: for equal instants the older run is admitted first.
#[tokio::test]
async fn test_older_run_wins_tie() {
    let executor = ScriptedExecutor::with_failures(1, FailureInjection::new().hold("once"));
    let harness = TestHarness::start_with(at(0, 0), executor).await;
    let first = harness.submit(fixtures::single_instant_world()).await;
    harness.clock().set(at(0, 0) + ChronoDuration::minutes(1));
    let second = harness.submit(fixtures::single_instant_world()).await;

    harness.tick_at(at(0, 9)).await;
    assert_eq!(harness.task_state(&first, "once").await, TaskState::Running);
    assert_eq!(harness.task_state(&second, "once").await, TaskState::Queued);

    // Killing the first frees its core for the second
    harness
        .handle()
        .kill_task(first.clone(), TaskName::new("once"))
        .await
        .unwrap();
    harness.tick_at(at(0, 9)).await;
    assert_eq!(harness.task_state(&first, "once").await, TaskState::Killed);
    assert_eq!(harness.task_state(&second, "once").await, TaskState::Running);
    assert_eq!(harness.executor().held_count(), 1);

    harness.shutdown().await;
}

/// Test: a candidate that does not fit is skipped, smaller ones behind it run.
#[tokio::test]
async fn test_oversized_candidate_does_not_block_queue() {
    let harness = TestHarness::start(at(0, 0), 2).await;
    let run_id = harness
        .submit(fixtures::world([
            TaskBuilder::new("wide")
                .up(CommandSpec::shell("true").with_cores(3))
                .at(9, 0)
                .build(),
            TaskBuilder::new("narrow").at(9, 30).build(),
        ]))
        .await;

    harness.tick_at(at(0, 10)).await;
    assert_eq!(harness.task_state(&run_id, "wide").await, TaskState::Queued);
    assert_eq!(harness.task_state(&run_id, "narrow").await, TaskState::Completed);

    harness.shutdown().await;
}

/// Test: a killed run's queued tasks stay out of admission.
#[tokio::test]
async fn test_killed_run_is_not_admitted() {
    let harness = TestHarness::start(at(0, 0), 4).await;
    let killed = harness.submit(fixtures::three_task_world()).await;
    let live = harness.submit(fixtures::three_task_world()).await;

    harness.handle().kill_run(killed.clone()).await.unwrap();
    harness.tick_at(at(0, 9)).await;

    let detail = harness.run(&killed).await;
    assert_eq!(detail.summary.state, TaskState::Killed);
    assert_eq!(detail.summary.task_counts.queued, 3);
    let detail = harness.run(&live).await;
    assert_eq!(detail.summary.task_counts.completed, 3);
    assert_eq!(harness.executor().launched().len(), 3);

    harness.shutdown().await;
}
