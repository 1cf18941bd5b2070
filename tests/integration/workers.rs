//! Remote worker protocol tests.
//!
//! A worker pool executor driven entirely through the HTTP endpoints:
//! register, claim orders, report attempts.

use crate::common::{at, send, send_json};
use axum::Router;
use axum::http::{Method, StatusCode};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tideline::api::{build_router, create_api_state};
use tideline::execution::{ClaimResponse, ReportRequest};
use tideline::scheduler::ManualClock;
use tideline::testing::fixtures::CHAIN_WORLD_YAML;
use tideline::{
    AttemptOutcome, InMemoryStorage, Scheduler, SchedulerHandle, TaskAttempt, WorkerClient,
    WorkerConfig, WorkerId, WorkerPool,
};
use tokio::sync::oneshot;

async fn create_remote_engine() -> (Router, SchedulerHandle, Arc<WorkerPool>) {
    let pool = Arc::new(WorkerPool::new(Duration::from_secs(60)));
    let scheduler = Scheduler::new(InMemoryStorage::new())
        .with_clock(Arc::new(ManualClock::new(at(0, 9))))
        .with_executor(pool.clone())
        .with_tick_interval(Duration::from_secs(3600));
    let (handle, _task) = scheduler.start().await;
    let router = build_router(create_api_state(handle.clone(), Some(pool.clone())));
    (router, handle, pool)
}

async fn register(router: &Router, name: &str, cores: u32) -> String {
    let body = json!({"name": name, "cores": cores});
    let json = send_json(router, Method::POST, "/v1/workers", Some(body), StatusCode::CREATED).await;
    json["workerID"].as_str().unwrap().to_string()
}

async fn claim(router: &Router, worker_id: &str) -> ClaimResponse {
    let uri = format!("/v1/workers/{}/claim", worker_id);
    let json = send_json(router, Method::POST, &uri, None, StatusCode::OK).await;
    serde_json::from_value(json).unwrap()
}

/// Test: an order travels to a worker and its report completes the task.
#[tokio::test]
async fn test_order_round_trip_through_http() {
    let (router, handle, _pool) = create_remote_engine().await;
    let worker_id = register(&router, "w1", 2).await;

    let body = json!({"world": CHAIN_WORLD_YAML});
    let submitted = send_json(&router, Method::POST, "/v1/dagruns", Some(body), StatusCode::CREATED).await;
    let run_id = submitted["runID"].as_str().unwrap().to_string();

    handle.tick().await.unwrap();

    let workers = send_json(&router, Method::GET, "/v1/workers", None, StatusCode::OK).await;
    assert_eq!(workers["count"], 1);
    assert_eq!(workers["workers"][0]["inUse"], 1);

    let claimed = claim(&router, &worker_id).await;
    assert_eq!(claimed.orders.len(), 1);
    assert!(claimed.kills.is_empty());
    let order = &claimed.orders[0];
    assert_eq!(order.task.as_str(), "task_a");
    assert_eq!(order.instant, at(0, 9));
    assert!(order.plan.up.is_some());

    // A second poll hands out nothing new
    assert!(claim(&router, &worker_id).await.orders.is_empty());

    let now = Utc::now();
    let report = ReportRequest {
        order_id: order.order_id.clone(),
        attempt: TaskAttempt::new(order.instant, now, now, AttemptOutcome::Succeeded),
    };
    let uri = format!("/v1/workers/{}/report", worker_id);
    send_json(
        &router,
        Method::POST,
        &uri,
        Some(serde_json::to_value(&report).unwrap()),
        StatusCode::OK,
    )
    .await;

    handle.tick().await.unwrap();
    let detail = send_json(
        &router,
        Method::GET,
        &format!("/v1/dagrun/{}", run_id),
        None,
        StatusCode::OK,
    )
    .await;
    assert_eq!(detail["taskStates"]["task_a"]["state"], "COMPLETED");
    assert_eq!(detail["taskAttempts"]["task_a"][0]["executor"], "remote/w1");

    let workers = send_json(&router, Method::GET, "/v1/workers", None, StatusCode::OK).await;
    assert_eq!(workers["workers"][0]["inUse"], 0);

    handle.shutdown().await.unwrap();
}

/// Test: killing a task on a worker sends a kill notice.
#[tokio::test]
async fn test_kill_notice_reaches_worker() {
    let (router, handle, _pool) = create_remote_engine().await;
    let worker_id = register(&router, "w1", 1).await;

    let body = json!({"world": CHAIN_WORLD_YAML});
    let submitted = send_json(&router, Method::POST, "/v1/dagruns", Some(body), StatusCode::CREATED).await;
    let run_id = submitted["runID"].as_str().unwrap().to_string();
    handle.tick().await.unwrap();
    let order = claim(&router, &worker_id).await.orders.remove(0);

    let uri = format!("/v1/dagrun/{}/task/task_a", run_id);
    send_json(&router, Method::DELETE, &uri, None, StatusCode::OK).await;

    let claimed = claim(&router, &worker_id).await;
    assert_eq!(claimed.kills, vec![order.order_id.clone()]);

    handle.shutdown().await.unwrap();
}

/// Test: with no worker registered nothing is dispatched.
#[tokio::test]
async fn test_no_capacity_without_workers() {
    let (router, handle, pool) = create_remote_engine().await;

    let body = json!({"world": CHAIN_WORLD_YAML});
    let submitted = send_json(&router, Method::POST, "/v1/dagruns", Some(body), StatusCode::CREATED).await;
    let run_id = submitted["runID"].as_str().unwrap().to_string();
    handle.tick().await.unwrap();

    let detail = send_json(
        &router,
        Method::GET,
        &format!("/v1/dagrun/{}", run_id),
        None,
        StatusCode::OK,
    )
    .await;
    assert_eq!(detail["taskStates"]["task_a"]["state"], "QUEUED");
    assert!(pool.workers().is_empty());

    handle.shutdown().await.unwrap();
}

/// Test: protocol errors.
#[tokio::test]
async fn test_worker_protocol_errors() {
    let (router, _handle, _pool) = create_remote_engine().await;

    let response = send(
        &router,
        Method::POST,
        "/v1/workers",
        Some(json!({"name": "w", "cores": 0})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let uri = format!("/v1/workers/{}/claim", uuid::Uuid::new_v4());
    let response = send(&router, Method::POST, &uri, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let worker_id = register(&router, "w", 1).await;
    let report = json!({
        "orderID": uuid::Uuid::new_v4(),
        "attempt": {
            "instant": at(0, 9),
            "startTime": at(0, 9),
            "stopTime": at(0, 9),
            "outcome": "succeeded",
        },
    });
    let uri = format!("/v1/workers/{}/report", worker_id);
    let response = send(&router, Method::POST, &uri, Some(report)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Wait until the pool holds exactly one worker other than `previous`.
async fn wait_for_worker(pool: &WorkerPool, previous: Option<&WorkerId>) -> WorkerId {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let workers = pool.workers();
        if let [only] = workers.as_slice() {
            if Some(&only.worker_id) != previous {
                return only.worker_id.clone();
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no new worker registered within 5s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Test: a worker the engine expired registers again and keeps polling.
#[tokio::test]
async fn test_expired_worker_registers_again() {
    let (router, handle, pool) = create_remote_engine().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let client = WorkerClient::new(WorkerConfig {
        server: format!("http://{}", addr),
        name: "w1".to_string(),
        cores: 1,
        poll_interval: Duration::from_millis(20),
    });
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let worker = tokio::spawn(client.run(async {
        let _ = stop_rx.await;
    }));

    let first = wait_for_worker(&pool, None).await;

    // Heartbeats stop counting as far as the pool is concerned
    let expired = pool.expire(tokio::time::Instant::now() + Duration::from_secs(3600));
    assert_eq!(expired, vec![first.clone()]);

    let second = wait_for_worker(&pool, Some(&first)).await;
    assert_ne!(first, second);
    assert_eq!(pool.workers()[0].name, "w1");

    let _ = stop_tx.send(());
    assert!(worker.await.unwrap().is_ok());
    server.abort();
    handle.shutdown().await.unwrap();
}
