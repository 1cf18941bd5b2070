//! Common test utilities shared across integration tests.

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use std::time::Duration;
use tideline::testing::fixtures;
use tideline::{RunId, SchedulerHandle, TaskName, TaskState};
use tower::ServiceExt;

/// `days` days and `hour` hours after the fixture epoch (Monday 2022-01-03 UTC).
pub fn at(days: i64, hour: i64) -> DateTime<Utc> {
    fixtures::epoch() + ChronoDuration::days(days) + ChronoDuration::hours(hour)
}

/// Tick the engine until a task reaches `expected`.
///
/// For executors that finish asynchronously. Ticks and polls every 20ms.
///
/// # Panics
///
/// Panics if the timeout is reached before the task reaches the expected state.
pub async fn wait_for_task_state(
    handle: &SchedulerHandle,
    run_id: &RunId,
    task: &str,
    expected: TaskState,
    timeout: Duration,
) {
    let start = tokio::time::Instant::now();
    let name = TaskName::new(task);
    loop {
        handle.tick().await.unwrap();
        let detail = handle.get_run(run_id.clone()).await.unwrap();
        let state = detail.task_states[&name].state;
        if state == expected {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for task {} of run {} to reach {:?}, current state: {:?}",
                task, run_id, expected, state
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Send one request through the router.
pub async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> Response<Body> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    router.clone().oneshot(request).await.unwrap()
}

/// Send a request and decode the JSON body, asserting the status.
pub async fn send_json(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    status: StatusCode,
) -> Value {
    let response = send(router, method, uri, body).await;
    assert_eq!(response.status(), status, "unexpected status for {}", uri);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
