//! API integration tests.
//!
//! These tests drive the HTTP router against a running engine on a manual
//! clock.

use crate::common::{at, send, send_json};
use axum::Router;
use axum::http::{Method, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tideline::api::{build_router, create_api_state};
use tideline::scheduler::ManualClock;
use tideline::testing::{FailureInjection, ScriptedExecutor};
use tideline::testing::fixtures::CHAIN_WORLD_YAML;
use tideline::{InMemoryStorage, Scheduler, SchedulerHandle};

/// Create a router over an engine whose clock reads `now`.
async fn create_test_router(now: chrono::DateTime<chrono::Utc>) -> (Router, SchedulerHandle) {
    create_router_with(now, ScriptedExecutor::new(2)).await
}

async fn create_router_with(
    now: chrono::DateTime<chrono::Utc>,
    executor: ScriptedExecutor,
) -> (Router, SchedulerHandle) {
    let scheduler = Scheduler::new(InMemoryStorage::new())
        .with_clock(Arc::new(ManualClock::new(now)))
        .with_executor(Arc::new(executor))
        .with_tick_interval(Duration::from_secs(3600));
    let (handle, _task) = scheduler.start().await;
    let router = build_router(create_api_state(handle.clone(), None));
    (router, handle)
}

async fn submit_chain(router: &Router) -> String {
    let body = json!({"tag": "nightly", "world": CHAIN_WORLD_YAML});
    let json = send_json(router, Method::POST, "/v1/dagruns", Some(body), StatusCode::CREATED).await;
    json["runID"].as_str().unwrap().to_string()
}

/// Test: Health endpoint responds with status ok.
#[tokio::test]
async fn test_health_endpoint() {
    let (router, _handle) = create_test_router(at(0, 0)).await;

    let json = send_json(&router, Method::GET, "/v1/health", None, StatusCode::OK).await;

    assert_eq!(json["status"], "ok");
    assert_eq!(json["scheduler"], "running");
    assert!(json["version"].is_string());
}

/// Test: a world submitted as a YAML string is listed and inspectable.
#[tokio::test]
async fn test_submit_and_get_run() {
    let (router, _handle) = create_test_router(at(0, 0)).await;
    let run_id = submit_chain(&router).await;

    let runs = send_json(&router, Method::GET, "/v1/dagruns", None, StatusCode::OK).await;
    assert_eq!(runs.as_array().unwrap().len(), 1);
    assert_eq!(runs[0]["runID"], run_id.as_str());
    assert_eq!(runs[0]["tag"], "nightly");
    assert_eq!(runs[0]["state"], "QUEUED");

    let uri = format!("/v1/dagrun/{}", run_id);
    let detail = send_json(&router, Method::GET, &uri, None, StatusCode::OK).await;
    assert_eq!(detail["runID"], run_id.as_str());
    assert_eq!(detail["taskStates"]["task_a"]["state"], "QUEUED");
    assert!(detail["tasks"]["task_b"].is_object());
    assert_eq!(detail["taskCounts"]["queued"], 2);
}

/// Test: a world submitted as a JSON document is accepted.
#[tokio::test]
async fn test_submit_json_world() {
    let (router, _handle) = create_test_router(at(0, 0)).await;
    let world: Value = serde_yaml::from_str(CHAIN_WORLD_YAML).unwrap();

    let json = send_json(
        &router,
        Method::POST,
        "/v1/dagruns",
        Some(json!({"world": world})),
        StatusCode::CREATED,
    )
    .await;
    assert!(json["runID"].is_string());
}

/// Test: an invalid world is rejected with 400.
#[tokio::test]
async fn test_submit_invalid_world() {
    let (router, _handle) = create_test_router(at(0, 0)).await;
    let body = json!({"world": {"tasks": {"a": {"up": "true", "calendar": "missing", "times": ["09:00"], "valid_from": "2022-01-03"}}}});

    let json = send_json(&router, Method::POST, "/v1/dagruns", Some(body), StatusCode::BAD_REQUEST).await;
    assert_eq!(json["code"], "BAD_REQUEST");
    assert!(json["error"].as_str().unwrap().contains("missing"));
}

/// Test: unknown and malformed run ids.
#[tokio::test]
async fn test_unknown_run() {
    let (router, _handle) = create_test_router(at(0, 0)).await;

    let uri = format!("/v1/dagrun/{}", uuid::Uuid::new_v4());
    let response = send(&router, Method::GET, &uri, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&router, Method::GET, "/v1/dagrun/not-a-uuid", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Test: killing a run hides it from the default listing.
#[tokio::test]
async fn test_kill_run_and_list_all() {
    let (router, _handle) = create_test_router(at(0, 0)).await;
    let run_id = submit_chain(&router).await;

    let uri = format!("/v1/dagrun/{}", run_id);
    send_json(&router, Method::DELETE, &uri, None, StatusCode::OK).await;

    let runs = send_json(&router, Method::GET, "/v1/dagruns", None, StatusCode::OK).await;
    assert!(runs.as_array().unwrap().is_empty());

    let runs = send_json(&router, Method::GET, "/v1/dagruns?all=1", None, StatusCode::OK).await;
    assert_eq!(runs[0]["state"], "KILLED");

    // Retry clears the kill
    let uri = format!("/v1/dagrun/{}/state/QUEUED", run_id);
    send_json(&router, Method::PATCH, &uri, None, StatusCode::OK).await;
    let runs = send_json(&router, Method::GET, "/v1/dagruns", None, StatusCode::OK).await;
    assert_eq!(runs.as_array().unwrap().len(), 1);
}

/// Test: only QUEUED is an accepted target state.
#[tokio::test]
async fn test_unsupported_target_state() {
    let (router, _handle) = create_test_router(at(0, 0)).await;
    let run_id = submit_chain(&router).await;

    let uri = format!("/v1/dagrun/{}/state/COMPLETED", run_id);
    let response = send(&router, Method::PATCH, &uri, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let uri = format!("/v1/dagrun/{}/task/task_a/state/RUNNING", run_id);
    let response = send(&router, Method::PATCH, &uri, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Test: task-level kill and retry.
#[tokio::test]
async fn test_kill_and_retry_task() {
    let executor = ScriptedExecutor::with_failures(2, FailureInjection::new().hold("task_a"));
    let (router, handle) = create_router_with(at(0, 9), executor).await;
    let run_id = submit_chain(&router).await;
    let run_uri = format!("/v1/dagrun/{}", run_id);
    let task_uri = format!("/v1/dagrun/{}/task/task_a", run_id);

    // Killing a queued task changes nothing
    send_json(&router, Method::DELETE, &task_uri, None, StatusCode::OK).await;
    let detail = send_json(&router, Method::GET, &run_uri, None, StatusCode::OK).await;
    assert_eq!(detail["taskStates"]["task_a"]["state"], "QUEUED");

    handle.tick().await.unwrap();
    let detail = send_json(&router, Method::GET, &run_uri, None, StatusCode::OK).await;
    assert_eq!(detail["taskStates"]["task_a"]["state"], "RUNNING");

    send_json(&router, Method::DELETE, &task_uri, None, StatusCode::OK).await;
    let detail = send_json(&router, Method::GET, &run_uri, None, StatusCode::OK).await;
    assert_eq!(detail["taskStates"]["task_a"]["state"], "KILLED");

    let uri = format!("{}/state/QUEUED", task_uri);
    send_json(&router, Method::PATCH, &uri, None, StatusCode::OK).await;
    let detail = send_json(&router, Method::GET, &run_uri, None, StatusCode::OK).await;
    assert_eq!(detail["taskStates"]["task_a"]["state"], "QUEUED");

    let uri = format!("/v1/dagrun/{}/task/nope", run_id);
    let response = send(&router, Method::DELETE, &uri, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    handle.shutdown().await.unwrap();
}

/// Test: timeline data groups tasks by the resource they provide.
#[tokio::test]
async fn test_details_endpoint() {
    let (router, handle) = create_test_router(at(0, 11)).await;
    let run_id = submit_chain(&router).await;
    handle.tick().await.unwrap();
    handle.tick().await.unwrap();

    let query = json!({
        "start": at(0, 0).to_rfc3339(),
        "end": at(1, 0).to_rfc3339(),
        "runID": run_id,
    });
    let groups = send_json(&router, Method::POST, "/v1/details", Some(query), StatusCode::OK).await;
    let names: Vec<&str> = groups
        .as_array()
        .unwrap()
        .iter()
        .map(|g| g["group"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"alpha"));

    let alpha = groups
        .as_array()
        .unwrap()
        .iter()
        .find(|g| g["group"] == "alpha")
        .unwrap();
    assert_eq!(alpha["data"][0]["label"], "task_a");
    assert_eq!(alpha["data"][0]["data"][0]["val"], "COMPLETED");

    let reversed = json!({"start": at(1, 0).to_rfc3339(), "end": at(0, 0).to_rfc3339()});
    let response = send(&router, Method::POST, "/v1/details", Some(reversed)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Test: worker endpoints need a remote executor.
#[tokio::test]
async fn test_workers_unavailable_without_pool() {
    let (router, _handle) = create_test_router(at(0, 0)).await;

    let response = send(&router, Method::GET, "/v1/workers", None).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
