//! Remote worker client.
//!
//! A worker registers with the engine, then polls for orders. Each order
//! runs locally through a [`CommandRunner`]; its attempt is reported back
//! when it finishes. Kill notices fire the matching attempt's kill signal.

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::command::{CommandRunner, KillSignal};
use super::executor::WorkOrder;
use super::remote::{ClaimResponse, RegisterRequest, RegisterResponse, ReportRequest};
use crate::core::types::{OrderId, WorkerId};

/// Errors talking to the engine.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The engine answered with a non-success status.
    #[error("engine rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Settings for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the engine, e.g. `http://127.0.0.1:8565`.
    pub server: String,
    pub name: String,
    pub cores: u32,
    pub poll_interval: Duration,
}

/// HTTP client side of a remote worker.
pub struct WorkerClient {
    config: WorkerConfig,
    http: reqwest::Client,
    runner: Arc<CommandRunner>,
    running: Arc<Mutex<HashMap<OrderId, oneshot::Sender<()>>>>,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            runner: Arc::new(CommandRunner::from_process_env()),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.server.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, WorkerError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(WorkerError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Register with the engine.
    pub async fn register(&self) -> Result<WorkerId, WorkerError> {
        let request = RegisterRequest {
            name: self.config.name.clone(),
            cores: self.config.cores,
        };
        let response = self
            .http
            .post(self.url("/v1/workers"))
            .json(&request)
            .send()
            .await?;
        let registered: RegisterResponse = Self::check(response).await?.json().await?;
        info!(
            worker_id = %registered.worker_id,
            cores = self.config.cores,
            "registered with engine"
        );
        Ok(registered.worker_id)
    }

    async fn poll(&self, worker_id: &WorkerId) -> Result<ClaimResponse, WorkerError> {
        let response = self
            .http
            .post(self.url(&format!("/v1/workers/{}/claim", worker_id)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    fn start(&self, worker_id: &WorkerId, order: WorkOrder) {
        let (tx, mut kill) = KillSignal::pair();
        if let Ok(mut running) = self.running.lock() {
            running.insert(order.order_id.clone(), tx);
        }

        let runner = Arc::clone(&self.runner);
        let running = Arc::clone(&self.running);
        let http = self.http.clone();
        let url = self.url(&format!("/v1/workers/{}/report", worker_id));
        let name = self.config.name.clone();

        tokio::spawn(async move {
            info!(run_id = %order.run_id, task = %order.task, "running order");
            let start = Utc::now();
            let report = runner.run_plan(&order.plan, &mut kill).await;
            let attempt = order.attempt_from_report(report, start, Utc::now(), &name);
            if let Ok(mut r) = running.lock() {
                r.remove(&order.order_id);
            }

            let body = ReportRequest {
                order_id: order.order_id.clone(),
                attempt,
            };
            let sent = match http.post(&url).json(&body).send().await {
                Ok(response) => Self::check(response).await.map(|_| ()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                error!(task = %order.task, error = %e, "failed to report attempt");
            }
        });
    }

    fn kill(&self, order_id: &OrderId) {
        let tx = self
            .running
            .lock()
            .ok()
            .and_then(|mut r| r.remove(order_id));
        if let Some(tx) = tx {
            debug!(order_id = %order_id, "kill notice received");
            let _ = tx.send(());
        }
    }

    /// Register, then poll until `shutdown` resolves.
    ///
    /// If the engine has expired this worker, it registers again under a
    /// new id and keeps polling. Orders still running under the old id are
    /// already reported lost by the engine.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), WorkerError> {
        let mut worker_id = self.register().await?;
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.poll(&worker_id).await {
                        Ok(claimed) => {
                            for order_id in &claimed.kills {
                                self.kill(order_id);
                            }
                            for order in claimed.orders {
                                self.start(&worker_id, order);
                            }
                        }
                        Err(WorkerError::Rejected { status: 404, .. }) => {
                            warn!(worker_id = %worker_id, "engine no longer knows this worker; registering again");
                            match self.register().await {
                                Ok(id) => worker_id = id,
                                Err(e) => warn!(error = %e, "registration failed; retrying on next poll"),
                            }
                        }
                        Err(e) => warn!(error = %e, "claim poll failed"),
                    }
                }
            }
        }
        Ok(())
    }
}
