//! The executor contract.
//!
//! The dispatcher claims capacity from an [`Executor`] for each admitted
//! candidate, then launches a [`WorkOrder`] against that claim. Executors
//! report a [`WorkOutcome`] for every launched order on the channel given
//! at launch and release the claimed capacity when the attempt ends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::command::{CommandError, PlanReport};
use crate::core::interval::Interval;
use crate::core::resource::{CoreBudget, ResourceRequirements};
use crate::core::types::{OrderId, RunId, TaskName, WorkerId};
use crate::core::world::OutputOptions;
use crate::run::attempt::{AttemptOutcome, TaskAttempt};

pub use super::command::AttemptPlan;

/// Errors raised by executors.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The claim does not belong to this executor or was already used.
    #[error("invalid claim: {0}")]
    InvalidClaim(String),

    /// No order with this id is known.
    #[error("unknown order: {0}")]
    UnknownOrder(OrderId),

    /// No worker with this id is registered.
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// The worker holding the claim expired before launch.
    #[error("worker {0} has expired")]
    WorkerExpired(WorkerId),

    /// Internal lock was poisoned.
    #[error("executor lock poisoned")]
    LockPoisoned,
}

/// Capacity held for one candidate between admission and launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub requirements: ResourceRequirements,
    /// Remote worker the capacity was taken from, if any.
    pub worker: Option<WorkerId>,
}

impl Claim {
    pub fn local(requirements: ResourceRequirements) -> Self {
        Self {
            requirements,
            worker: None,
        }
    }
}

/// Everything an executor needs to run one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrder {
    #[serde(rename = "orderID")]
    pub order_id: OrderId,
    #[serde(rename = "runID")]
    pub run_id: RunId,
    pub task: TaskName,
    pub generation: u64,
    pub instant: DateTime<Utc>,
    pub interval: Interval,
    pub plan: AttemptPlan,
    pub requirements: ResourceRequirements,
    pub output_options: OutputOptions,
}

impl WorkOrder {
    /// Build the attempt record for a finished plan.
    pub fn attempt_from_report(
        &self,
        report: PlanReport,
        start_time: DateTime<Utc>,
        stop_time: DateTime<Utc>,
        executor: &str,
    ) -> TaskAttempt {
        let outcome = match &report.result {
            Ok(()) => AttemptOutcome::Succeeded,
            Err(CommandError::Killed) => AttemptOutcome::Killed,
            Err(_) => AttemptOutcome::Failed,
        };
        let mut attempt = TaskAttempt::new(self.instant, start_time, stop_time, outcome)
            .with_executor(executor)
            .with_generation(self.generation);
        attempt.exit_code = report.exit_code;
        attempt.output = self
            .output_options
            .retain(&report.output, outcome.is_success());
        attempt.down_completed = report.down_completed;
        attempt.notes = report.notes;
        if let Err(e) = report.result {
            attempt.error = Some(e.to_string());
        }
        attempt
    }

    /// An attempt recording that this order was lost.
    pub fn lost(&self, at: DateTime<Utc>, executor: &str, reason: impl Into<String>) -> TaskAttempt {
        TaskAttempt::infra_failure(self.instant, at, reason)
            .with_executor(executor)
            .with_generation(self.generation)
    }
}

/// A finished attempt on its way back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkOutcome {
    pub order_id: OrderId,
    pub run_id: RunId,
    pub task: TaskName,
    pub attempt: TaskAttempt,
}

impl WorkOutcome {
    pub fn new(order: &WorkOrder, attempt: TaskAttempt) -> Self {
        Self {
            order_id: order.order_id.clone(),
            run_id: order.run_id.clone(),
            task: order.task.clone(),
            attempt,
        }
    }
}

/// Channel outcomes are reported on.
pub type OutcomeSender = mpsc::UnboundedSender<WorkOutcome>;

/// A place attempts run.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name recorded on attempts.
    fn name(&self) -> &str;

    /// Take capacity for `requirements`, or `None` if it does not fit.
    fn try_claim(&self, requirements: &ResourceRequirements) -> Option<Claim>;

    /// Give back a claim that will not be launched.
    fn release(&self, claim: &Claim);

    /// Start an attempt on a claim. The outcome arrives on `outcomes`.
    async fn launch(
        &self,
        claim: Claim,
        order: WorkOrder,
        outcomes: OutcomeSender,
    ) -> Result<(), ExecutorError>;

    /// Ask a launched attempt to stop. Unknown orders are ignored.
    async fn kill(&self, order_id: &OrderId) -> Result<(), ExecutorError>;

    /// Current capacity.
    fn capacity(&self) -> CoreBudget;

    /// Periodic housekeeping, called once per tick.
    async fn maintain(&self) {}
}
