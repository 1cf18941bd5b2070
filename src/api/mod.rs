//! HTTP API module for the tideline engine.
//!
//! Provides REST endpoints for submitting worlds, inspecting and controlling
//! runs, timeline data, and the remote worker protocol.

mod errors;
mod handlers;
mod responses;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::ApiState;
pub use responses::*;

use axum::{
    Router,
    routing::{delete, get, patch, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::execution::WorkerPool;
use crate::scheduler::SchedulerHandle;

/// Configuration for the API server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ApiConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
        }
    }
}

impl ApiConfig {
    /// Create a new API config with custom host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the socket address.
    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid socket address {}:{}: {}", self.host, self.port, e),
            )
        })
    }
}

/// Build the API router with all endpoints.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        // Health check
        .route("/v1/health", get(handlers::health))
        // Runs
        .route(
            "/v1/dagruns",
            get(handlers::list_runs).post(handlers::submit_run),
        )
        .route(
            "/v1/dagrun/{run_id}",
            get(handlers::get_run).delete(handlers::kill_run),
        )
        .route(
            "/v1/dagrun/{run_id}/state/{state}",
            patch(handlers::set_run_state),
        )
        .route(
            "/v1/dagrun/{run_id}/task/{task}",
            delete(handlers::kill_task),
        )
        .route(
            "/v1/dagrun/{run_id}/task/{task}/state/{state}",
            patch(handlers::set_task_state),
        )
        .route("/v1/details", post(handlers::details))
        // Remote workers
        .route(
            "/v1/workers",
            get(handlers::list_workers).post(handlers::register_worker),
        )
        .route("/v1/workers/{worker_id}/claim", post(handlers::claim_work))
        .route("/v1/workers/{worker_id}/report", post(handlers::report_work))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Create the API state from scheduler components.
pub fn create_api_state(handle: SchedulerHandle, workers: Option<Arc<WorkerPool>>) -> ApiState {
    ApiState { handle, workers }
}

/// Start the API server.
///
/// This function spawns the server and returns a handle to the task.
/// The server runs until the task is aborted or the process exits.
pub async fn start_server(
    config: ApiConfig,
    state: ApiState,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(state);
    let addr = config.socket_addr()?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
