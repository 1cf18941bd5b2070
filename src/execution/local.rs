//! In-process executor with a fixed core budget.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::command::{CommandRunner, KillSignal};
use super::executor::{Claim, Executor, ExecutorError, OutcomeSender, WorkOrder, WorkOutcome};
use crate::core::resource::{CoreBudget, ResourceRequirements};
use crate::core::types::OrderId;

/// Runs attempts as child processes of the engine.
pub struct LocalExecutor {
    name: String,
    budget: Arc<Mutex<CoreBudget>>,
    runner: Arc<CommandRunner>,
    running: Arc<Mutex<HashMap<OrderId, oneshot::Sender<()>>>>,
}

impl LocalExecutor {
    /// Create an executor with `cores` cores and the process environment whitelist.
    pub fn new(cores: u32) -> Self {
        Self::with_runner(cores, CommandRunner::from_process_env())
    }

    /// Create an executor with a specific command runner.
    pub fn with_runner(cores: u32, runner: CommandRunner) -> Self {
        Self {
            name: "local".to_string(),
            budget: Arc::new(Mutex::new(CoreBudget::new(cores))),
            runner: Arc::new(runner),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Builder: set the executor name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of attempts in flight.
    pub fn running_count(&self) -> usize {
        self.running.lock().map(|r| r.len()).unwrap_or(0)
    }
}

fn release_cores(budget: &Mutex<CoreBudget>, requirements: &ResourceRequirements) {
    match budget.lock() {
        Ok(mut b) => b.release(requirements),
        Err(_) => warn!("core budget lock poisoned, capacity not released"),
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_claim(&self, requirements: &ResourceRequirements) -> Option<Claim> {
        let mut budget = self.budget.lock().ok()?;
        budget
            .claim(requirements)
            .then(|| Claim::local(*requirements))
    }

    fn release(&self, claim: &Claim) {
        release_cores(&self.budget, &claim.requirements);
    }

    async fn launch(
        &self,
        claim: Claim,
        order: WorkOrder,
        outcomes: OutcomeSender,
    ) -> Result<(), ExecutorError> {
        if claim.worker.is_some() {
            return Err(ExecutorError::InvalidClaim(
                "claim was made on a remote worker".to_string(),
            ));
        }

        let (tx, mut kill) = KillSignal::pair();
        self.running
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .insert(order.order_id.clone(), tx);

        let name = self.name.clone();
        let budget = Arc::clone(&self.budget);
        let runner = Arc::clone(&self.runner);
        let running = Arc::clone(&self.running);

        info!(
            run_id = %order.run_id,
            task = %order.task,
            instant = %order.instant,
            cores = claim.requirements.cores,
            "launching attempt"
        );

        tokio::spawn(async move {
            let start = Utc::now();
            let report = runner.run_plan(&order.plan, &mut kill).await;
            let stop = Utc::now();

            release_cores(&budget, &claim.requirements);
            if let Ok(mut r) = running.lock() {
                r.remove(&order.order_id);
            }

            let attempt = order.attempt_from_report(report, start, stop, &name);
            debug!(
                run_id = %order.run_id,
                task = %order.task,
                outcome = %attempt.outcome,
                "attempt finished"
            );
            if outcomes.send(WorkOutcome::new(&order, attempt)).is_err() {
                warn!(task = %order.task, "outcome channel closed, dropping attempt");
            }
        });

        Ok(())
    }

    async fn kill(&self, order_id: &OrderId) -> Result<(), ExecutorError> {
        let tx = self
            .running
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .remove(order_id);
        if let Some(tx) = tx {
            debug!(order_id = %order_id, "killing attempt");
            let _ = tx.send(());
        }
        Ok(())
    }

    fn capacity(&self) -> CoreBudget {
        self.budget
            .lock()
            .map(|b| *b)
            .unwrap_or_else(|_| CoreBudget::new(0))
    }
}
