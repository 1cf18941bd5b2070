//! Recovery scenario integration tests.
//!
//! Runs persisted to SQLite are rebuilt by a fresh engine: task states,
//! attempt logs and the ledger survive, and interrupted tasks are re-queued.

#![cfg(feature = "sqlite")]

use crate::common::at;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tideline::scheduler::ManualClock;
use tideline::testing::fixtures;
use tideline::testing::{FailureInjection, ScriptedExecutor};
use tideline::{
    AttemptOutcome, ResourceName, Scheduler, SchedulerHandle, SqliteStorage, Storage, TaskName,
    TaskState,
};
use tokio::task::JoinHandle;

async fn engine_on(
    path: &Path,
    now: chrono::DateTime<chrono::Utc>,
    executor: ScriptedExecutor,
) -> (SchedulerHandle, JoinHandle<()>, Vec<tideline::RunId>) {
    let storage = SqliteStorage::new(path).await.unwrap();
    let mut scheduler = Scheduler::new(storage)
        .with_clock(Arc::new(ManualClock::new(now)))
        .with_executor(Arc::new(executor))
        .with_tick_interval(Duration::from_secs(3600));
    let recovered = scheduler.recover().await.unwrap();
    let (handle, task) = scheduler.start().await;
    (handle, task, recovered)
}

/// Test: a completed producer and its ledger survive a restart.
#[tokio::test]
async fn test_sqlite_run_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tideline.db");

    let (handle, task, recovered) = engine_on(&db, at(0, 9), ScriptedExecutor::new(2)).await;
    assert!(recovered.is_empty());
    let run_id = handle.submit("nightly", fixtures::chain_world()).await.unwrap();
    handle.tick().await.unwrap();
    handle.shutdown().await.unwrap();
    let _ = task.await;

    let (handle, task, recovered) = engine_on(&db, at(0, 10), ScriptedExecutor::new(2)).await;
    assert_eq!(recovered, vec![run_id.clone()]);

    let detail = handle.get_run(run_id.clone()).await.unwrap();
    assert_eq!(detail.summary.tag, "nightly");
    assert_eq!(
        detail.task_states[&TaskName::new("task_a")].state,
        TaskState::Completed
    );
    assert_eq!(detail.task_attempts[&TaskName::new("task_a")].len(), 1);
    assert!(detail.ledger.contains_key(&ResourceName::new("alpha")));

    // The consumer runs off the recovered ledger
    handle.tick().await.unwrap();
    let detail = handle.get_run(run_id.clone()).await.unwrap();
    assert_eq!(
        detail.task_states[&TaskName::new("task_b")].state,
        TaskState::Completed
    );

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: a task running when the engine died is re-queued with an
/// infrastructure-failure attempt, then runs again.
#[tokio::test]
async fn test_interrupted_task_requeued_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tideline.db");

    let held = ScriptedExecutor::with_failures(1, FailureInjection::new().hold("once"));
    let (handle, task, _) = engine_on(&db, at(0, 9), held).await;
    let run_id = handle
        .submit("crash", fixtures::single_instant_world())
        .await
        .unwrap();
    handle.tick().await.unwrap();
    let detail = handle.get_run(run_id.clone()).await.unwrap();
    assert_eq!(
        detail.task_states[&TaskName::new("once")].state,
        TaskState::Running
    );

    // Simulate a crash: the loop dies without draining
    task.abort();
    let _ = task.await;
    drop(handle);

    let (handle, task, recovered) = engine_on(&db, at(0, 10), ScriptedExecutor::new(1)).await;
    assert_eq!(recovered.len(), 1);

    let detail = handle.get_run(run_id.clone()).await.unwrap();
    let entry = &detail.task_states[&TaskName::new("once")];
    assert_eq!(entry.state, TaskState::Queued);
    assert_eq!(entry.generation, 1);
    let attempts = &detail.task_attempts[&TaskName::new("once")];
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::InfraFailure);

    handle.tick().await.unwrap();
    let detail = handle.get_run(run_id.clone()).await.unwrap();
    assert_eq!(
        detail.task_states[&TaskName::new("once")].state,
        TaskState::Completed
    );
    assert_eq!(detail.summary.state, TaskState::Completed);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: the attempt log in storage matches what the engine reports.
#[tokio::test]
async fn test_attempt_log_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tideline.db");

    let failing = ScriptedExecutor::with_failures(1, FailureInjection::new().always_fail("once"));
    let (handle, task, _) = engine_on(&db, at(0, 9), failing).await;
    let run_id = handle
        .submit("fails", fixtures::single_instant_world())
        .await
        .unwrap();
    handle.tick().await.unwrap();
    handle.shutdown().await.unwrap();
    let _ = task.await;

    let storage = SqliteStorage::new(&db).await.unwrap();
    let stored = storage.load_run(&run_id).await.unwrap();
    assert_eq!(stored.header.tag, "fails");
    assert_eq!(stored.entries[&TaskName::new("once")].state, TaskState::Errored);
    assert_eq!(stored.attempts.len(), 1);
    assert_eq!(stored.attempts[0].1.outcome, AttemptOutcome::Failed);
    assert_eq!(stored.attempts[0].1.exit_code, Some(1));
    assert!(stored.intervals.is_empty());
    storage.close().await;
}
