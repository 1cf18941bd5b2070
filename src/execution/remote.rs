//! Remote worker pool.
//!
//! Workers register a core budget over HTTP, poll [`WorkerPool::claim`] for
//! work orders and kill notices, and [`WorkerPool::report`] finished
//! attempts. Each claim counts as a heartbeat. A worker silent for longer
//! than the heartbeat timeout is expired by [`WorkerPool::expire`]: its
//! capacity disappears and every order it held is reported as lost.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::executor::{Claim, Executor, ExecutorError, OutcomeSender, WorkOrder, WorkOutcome};
use crate::core::resource::{CoreBudget, ResourceRequirements};
use crate::core::types::{OrderId, WorkerId};
use crate::run::attempt::{AttemptOutcome, TaskAttempt};

/// Body of `POST /v1/workers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub cores: u32,
}

/// Response to a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    #[serde(rename = "workerID")]
    pub worker_id: WorkerId,
}

/// Response to a claim poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub orders: Vec<WorkOrder>,
    pub kills: Vec<OrderId>,
}

/// Body of `POST /v1/workers/{id}/report`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    #[serde(rename = "orderID")]
    pub order_id: OrderId,
    pub attempt: TaskAttempt,
}

/// A registered worker as the API reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    #[serde(rename = "workerID")]
    pub worker_id: WorkerId,
    pub name: String,
    pub cores: u32,
    pub in_use: u32,
    pub orders: usize,
}

struct Assigned {
    order: WorkOrder,
    outcomes: OutcomeSender,
    delivered: bool,
}

struct WorkerState {
    name: String,
    budget: CoreBudget,
    last_seen: Instant,
    assigned: HashMap<OrderId, Assigned>,
    undelivered: VecDeque<OrderId>,
    kills: Vec<OrderId>,
}

impl WorkerState {
    fn finish(&mut self, order_id: &OrderId) -> Option<Assigned> {
        let assigned = self.assigned.remove(order_id)?;
        self.budget.release(&assigned.order.requirements);
        self.undelivered.retain(|id| id != order_id);
        Some(assigned)
    }
}

/// Executor backed by remote workers.
pub struct WorkerPool {
    name: String,
    heartbeat_timeout: Duration,
    workers: Mutex<BTreeMap<WorkerId, WorkerState>>,
}

impl WorkerPool {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            name: "remote".to_string(),
            heartbeat_timeout,
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Builder: set the executor name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Register a worker with `cores` cores.
    pub fn register(&self, name: impl Into<String>, cores: u32) -> Result<WorkerId, ExecutorError> {
        let id = WorkerId::new();
        let name = name.into();
        info!(worker_id = %id, worker = %name, cores, "worker registered");
        self.workers
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .insert(
                id.clone(),
                WorkerState {
                    name,
                    budget: CoreBudget::new(cores),
                    last_seen: Instant::now(),
                    assigned: HashMap::new(),
                    undelivered: VecDeque::new(),
                    kills: Vec::new(),
                },
            );
        Ok(id)
    }

    /// Hand out new orders and pending kills. Counts as a heartbeat.
    pub fn claim(&self, worker_id: &WorkerId) -> Result<ClaimResponse, ExecutorError> {
        let mut workers = self.workers.lock().map_err(|_| ExecutorError::LockPoisoned)?;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| ExecutorError::UnknownWorker(worker_id.clone()))?;
        worker.last_seen = Instant::now();

        let mut response = ClaimResponse {
            orders: Vec::new(),
            kills: std::mem::take(&mut worker.kills),
        };
        while let Some(id) = worker.undelivered.pop_front() {
            if let Some(assigned) = worker.assigned.get_mut(&id) {
                assigned.delivered = true;
                response.orders.push(assigned.order.clone());
            }
        }
        Ok(response)
    }

    /// Accept a finished attempt from a worker.
    pub fn report(
        &self,
        worker_id: &WorkerId,
        order_id: &OrderId,
        attempt: TaskAttempt,
    ) -> Result<(), ExecutorError> {
        let mut workers = self.workers.lock().map_err(|_| ExecutorError::LockPoisoned)?;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| ExecutorError::UnknownWorker(worker_id.clone()))?;
        worker.last_seen = Instant::now();

        let assigned = worker
            .finish(order_id)
            .ok_or_else(|| ExecutorError::UnknownOrder(order_id.clone()))?;
        let mut attempt = attempt;
        attempt.executor = format!("{}/{}", self.name, worker.name);
        attempt.generation = assigned.order.generation;
        let _ = assigned
            .outcomes
            .send(WorkOutcome::new(&assigned.order, attempt));
        Ok(())
    }

    /// Expire workers not seen since `now - heartbeat_timeout`. Returns the expired ids.
    pub fn expire(&self, now: Instant) -> Vec<WorkerId> {
        let Ok(mut workers) = self.workers.lock() else {
            return Vec::new();
        };
        let expired: Vec<WorkerId> = workers
            .iter()
            .filter(|(_, w)| now.saturating_duration_since(w.last_seen) > self.heartbeat_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            let Some(worker) = workers.remove(id) else {
                continue;
            };
            warn!(
                worker_id = %id,
                worker = %worker.name,
                orders = worker.assigned.len(),
                "worker missed heartbeats, expiring"
            );
            let executor = format!("{}/{}", self.name, worker.name);
            for assigned in worker.assigned.into_values() {
                let attempt = assigned.order.lost(
                    Utc::now(),
                    &executor,
                    format!("worker {} expired", worker.name),
                );
                let _ = assigned
                    .outcomes
                    .send(WorkOutcome::new(&assigned.order, attempt));
            }
        }
        expired
    }

    /// Registered workers.
    pub fn workers(&self) -> Vec<WorkerSummary> {
        let Ok(workers) = self.workers.lock() else {
            return Vec::new();
        };
        workers
            .iter()
            .map(|(id, w)| WorkerSummary {
                worker_id: id.clone(),
                name: w.name.clone(),
                cores: w.budget.total(),
                in_use: w.budget.in_use(),
                orders: w.assigned.len(),
            })
            .collect()
    }
}

#[async_trait]
impl Executor for WorkerPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_claim(&self, requirements: &ResourceRequirements) -> Option<Claim> {
        let mut workers = self.workers.lock().ok()?;
        workers.iter_mut().find_map(|(id, w)| {
            w.budget.claim(requirements).then(|| Claim {
                requirements: *requirements,
                worker: Some(id.clone()),
            })
        })
    }

    fn release(&self, claim: &Claim) {
        let Some(worker_id) = &claim.worker else {
            return;
        };
        if let Ok(mut workers) = self.workers.lock() {
            if let Some(w) = workers.get_mut(worker_id) {
                w.budget.release(&claim.requirements);
            }
        }
    }

    async fn launch(
        &self,
        claim: Claim,
        order: WorkOrder,
        outcomes: OutcomeSender,
    ) -> Result<(), ExecutorError> {
        let worker_id = claim
            .worker
            .ok_or_else(|| ExecutorError::InvalidClaim("claim has no worker".to_string()))?;
        let mut workers = self.workers.lock().map_err(|_| ExecutorError::LockPoisoned)?;
        let worker = workers
            .get_mut(&worker_id)
            .ok_or_else(|| ExecutorError::WorkerExpired(worker_id.clone()))?;

        info!(
            run_id = %order.run_id,
            task = %order.task,
            worker = %worker.name,
            "assigning attempt to worker"
        );
        worker.undelivered.push_back(order.order_id.clone());
        worker.assigned.insert(
            order.order_id.clone(),
            Assigned {
                order,
                outcomes,
                delivered: false,
            },
        );
        Ok(())
    }

    async fn kill(&self, order_id: &OrderId) -> Result<(), ExecutorError> {
        let mut workers = self.workers.lock().map_err(|_| ExecutorError::LockPoisoned)?;
        let Some(worker) = workers
            .values_mut()
            .find(|w| w.assigned.contains_key(order_id))
        else {
            return Ok(());
        };

        let delivered = worker
            .assigned
            .get(order_id)
            .is_some_and(|a| a.delivered);
        if delivered {
            worker.kills.push(order_id.clone());
        } else if let Some(assigned) = worker.finish(order_id) {
            // Never reached the worker: report the kill directly.
            let now = Utc::now();
            let attempt = TaskAttempt::new(assigned.order.instant, now, now, AttemptOutcome::Killed)
                .with_executor(format!("{}/{}", self.name, worker.name))
                .with_generation(assigned.order.generation)
                .with_error("killed before delivery");
            let _ = assigned
                .outcomes
                .send(WorkOutcome::new(&assigned.order, attempt));
        }
        Ok(())
    }

    fn capacity(&self) -> CoreBudget {
        let Ok(workers) = self.workers.lock() else {
            return CoreBudget::new(0);
        };
        let mut budget = CoreBudget::new(workers.values().map(|w| w.budget.total()).sum());
        let in_use = workers.values().map(|w| w.budget.in_use()).sum();
        budget.claim(&ResourceRequirements::cores(in_use));
        budget
    }

    async fn maintain(&self) {
        self.expire(Instant::now());
    }
}
