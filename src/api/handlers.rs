//! API request handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use std::sync::Arc;

use crate::config::{WorldBuilder, YamlLoader, parse_world};
use crate::core::types::{RunId, TaskName, WorkerId};
use crate::core::world::World;
use crate::execution::{ClaimResponse, RegisterRequest, RegisterResponse, ReportRequest, WorkerPool};
use crate::run::TaskState;
use crate::scheduler::{DetailsGroup, DetailsQuery, RunDetail, RunSummary, SchedulerHandle};

use super::errors::ApiError;
use super::responses::{
    HealthResponse, ListRunsQuery, MessageResponse, SubmitRequest, SubmitResponse,
    WorkerListResponse,
};

/// Shared application state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub handle: SchedulerHandle,
    /// Present when a remote executor is configured.
    pub workers: Option<Arc<WorkerPool>>,
}

impl ApiState {
    fn pool(&self) -> Result<&WorkerPool, ApiError> {
        self.workers
            .as_deref()
            .ok_or_else(|| ApiError::ServiceUnavailable("no remote executor configured".into()))
    }
}

fn parse_run_id(s: &str) -> Result<RunId, ApiError> {
    RunId::parse(s).map_err(|_| ApiError::BadRequest(format!("invalid run id: {}", s)))
}

fn parse_worker_id(s: &str) -> Result<WorkerId, ApiError> {
    WorkerId::parse(s).map_err(|_| ApiError::BadRequest(format!("invalid worker id: {}", s)))
}

/// Only QUEUED is a valid target state: it means "retry".
fn require_queued(state: &str) -> Result<(), ApiError> {
    let target: TaskState = state
        .parse()
        .map_err(|e: crate::run::ParseStateError| ApiError::BadRequest(e.to_string()))?;
    if target != TaskState::Queued {
        return Err(ApiError::BadRequest(format!(
            "unsupported target state {}; only QUEUED is accepted",
            target.as_str()
        )));
    }
    Ok(())
}

/// Build a world from a JSON document or a YAML string.
fn world_from_value(value: serde_json::Value) -> Result<World, ApiError> {
    let world = match value {
        serde_json::Value::String(yaml) => parse_world(&yaml)?,
        other => WorldBuilder::build(&YamlLoader::world_config_from_json(other)?)?,
    };
    Ok(world)
}

/// Health check endpoint.
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse::new(state.handle.state().await))
}

/// List runs; terminal runs only with `?all=1`.
pub async fn list_runs(
    State(state): State<ApiState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunSummary>>, ApiError> {
    let runs = state.handle.list_runs(query.include_terminal()).await?;
    Ok(Json(runs))
}

/// Submit a world as a new run.
pub async fn submit_run(
    State(state): State<ApiState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let world = world_from_value(request.world)?;
    let run_id = state.handle.submit(request.tag, world).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { run_id })))
}

/// Get a specific run.
pub async fn get_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetail>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    Ok(Json(state.handle.get_run(run_id).await?))
}

/// Kill a run.
pub async fn kill_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    state.handle.kill_run(run_id.clone()).await?;
    Ok(Json(MessageResponse::new(format!("run {} killed", run_id))))
}

/// Retry a run.
pub async fn set_run_state(
    State(state): State<ApiState>,
    Path((run_id, target)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    require_queued(&target)?;
    state.handle.retry_run(run_id.clone()).await?;
    Ok(Json(MessageResponse::new(format!("run {} retried", run_id))))
}

/// Kill one task.
pub async fn kill_task(
    State(state): State<ApiState>,
    Path((run_id, task)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    state
        .handle
        .kill_task(run_id.clone(), TaskName::new(&task))
        .await?;
    Ok(Json(MessageResponse::new(format!(
        "task {} of run {} killed",
        task, run_id
    ))))
}

/// Retry one task.
pub async fn set_task_state(
    State(state): State<ApiState>,
    Path((run_id, task, target)): Path<(String, String, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    require_queued(&target)?;
    state
        .handle
        .retry_task(run_id.clone(), TaskName::new(&task))
        .await?;
    Ok(Json(MessageResponse::new(format!(
        "task {} of run {} retried",
        task, run_id
    ))))
}

/// Timeline data.
pub async fn details(
    State(state): State<ApiState>,
    Json(query): Json<DetailsQuery>,
) -> Result<Json<Vec<DetailsGroup>>, ApiError> {
    if query.end < query.start {
        return Err(ApiError::BadRequest("end is before start".into()));
    }
    Ok(Json(state.handle.details(query).await?))
}

/// List registered workers.
pub async fn list_workers(
    State(state): State<ApiState>,
) -> Result<Json<WorkerListResponse>, ApiError> {
    let workers = state.pool()?.workers();
    let count = workers.len();
    Ok(Json(WorkerListResponse { workers, count }))
}

/// Register a remote worker.
pub async fn register_worker(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    if request.cores == 0 {
        return Err(ApiError::BadRequest("cores must be at least 1".into()));
    }
    let worker_id = state.pool()?.register(request.name, request.cores)?;
    Ok((StatusCode::CREATED, Json(RegisterResponse { worker_id })))
}

/// Poll for orders and kill notices.
pub async fn claim_work(
    State(state): State<ApiState>,
    Path(worker_id): Path<String>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let worker_id = parse_worker_id(&worker_id)?;
    Ok(Json(state.pool()?.claim(&worker_id)?))
}

/// Report a finished attempt.
pub async fn report_work(
    State(state): State<ApiState>,
    Path(worker_id): Path<String>,
    Json(request): Json<ReportRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let worker_id = parse_worker_id(&worker_id)?;
    state
        .pool()?
        .report(&worker_id, &request.order_id, request.attempt)?;
    Ok(Json(MessageResponse::new("reported")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::CHAIN_WORLD_YAML;

    #[test]
    fn test_require_queued() {
        assert!(require_queued("QUEUED").is_ok());
        assert!(matches!(require_queued("KILLED"), Err(ApiError::BadRequest(_))));
        assert!(matches!(require_queued("bogus"), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_world_from_yaml_string() {
        let world = world_from_value(serde_json::Value::String(CHAIN_WORLD_YAML.into())).unwrap();
        assert_eq!(world.len(), 2);
    }

    #[test]
    fn test_world_from_json_document() {
        let value: serde_json::Value = serde_yaml::from_str(CHAIN_WORLD_YAML).unwrap();
        let world = world_from_value(value).unwrap();
        assert!(world.task(&TaskName::new("task_b")).is_some());
    }

    #[test]
    fn test_invalid_world_is_bad_request() {
        let value = serde_json::json!({"tasks": {}});
        assert!(matches!(world_from_value(value), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_bad_ids() {
        assert!(parse_run_id("not-a-uuid").is_err());
        assert!(parse_worker_id("").is_err());
    }
}
