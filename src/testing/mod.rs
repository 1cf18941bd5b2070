//! Testing utilities for users of the tideline library.
//!
//! This module provides helpers for testing worlds end to end:
//!
//! - [`fixtures`]: ready-made worlds and a task builder
//! - [`ScriptedExecutor`]: an executor whose attempts finish as scripted, without processes
//! - [`FlakyStorage`]: in-memory storage whose writes can be made to fail
//! - [`TestHarness`]: an engine on in-memory storage driven by a manual clock

pub mod fixtures;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::core::resource::{CoreBudget, ResourceRequirements};
use crate::core::types::{OrderId, RunId, TaskName};
use crate::core::world::World;
use crate::ledger::{DownRecord, LedgerEntry};
use crate::execution::{
    Claim, Executor, ExecutorError, OutcomeSender, WorkOrder, WorkOutcome,
};
use crate::run::{AttemptOutcome, RunHeader, TaskAttempt, TaskEntry};
use crate::scheduler::{ManualClock, RunDetail, Scheduler, SchedulerHandle};
use crate::storage::{InMemoryStorage, OutcomeRecord, Storage, StorageError, StoredRun};

/// Configuration for failure injection in [`ScriptedExecutor`].
#[derive(Clone, Default)]
pub struct FailureInjection {
    /// Tasks whose attempts always fail.
    pub always_fail: HashSet<String>,
    /// Tasks that fail N times then succeed.
    pub fail_n_times: HashMap<String, u32>,
    /// Tasks whose attempts never finish on their own.
    pub hold: HashSet<String>,
}

impl FailureInjection {
    /// Create an empty failure injection config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a task to always fail.
    pub fn always_fail(mut self, task: impl Into<String>) -> Self {
        self.always_fail.insert(task.into());
        self
    }

    /// Configure a task to fail N times then succeed.
    pub fn fail_times(mut self, task: impl Into<String>, times: u32) -> Self {
        self.fail_n_times.insert(task.into(), times);
        self
    }

    /// Keep a task's attempts running until they are killed.
    pub fn hold(mut self, task: impl Into<String>) -> Self {
        self.hold.insert(task.into());
        self
    }
}

struct ScriptState {
    budget: CoreBudget,
    injection: FailureInjection,
    launched: Vec<WorkOrder>,
    held: HashMap<OrderId, (WorkOrder, Claim, OutcomeSender)>,
}

/// An executor that finishes attempts immediately, as scripted.
///
/// Outcomes are sent before `launch` returns, except for held tasks,
/// which finish only when killed.
pub struct ScriptedExecutor {
    name: String,
    state: Mutex<ScriptState>,
}

impl ScriptedExecutor {
    pub fn new(cores: u32) -> Self {
        Self::with_failures(cores, FailureInjection::default())
    }

    pub fn with_failures(cores: u32, injection: FailureInjection) -> Self {
        Self {
            name: "scripted".to_string(),
            state: Mutex::new(ScriptState {
                budget: CoreBudget::new(cores),
                injection,
                launched: Vec::new(),
                held: HashMap::new(),
            }),
        }
    }

    /// Replace the failure injection for later launches.
    pub fn set_failures(&self, injection: FailureInjection) {
        if let Ok(mut state) = self.state.lock() {
            state.injection = injection;
        }
    }

    /// Every order launched so far, in launch order.
    pub fn launched(&self) -> Vec<WorkOrder> {
        self.state
            .lock()
            .map(|s| s.launched.clone())
            .unwrap_or_default()
    }

    /// Names of tasks launched so far, in launch order.
    pub fn launched_tasks(&self) -> Vec<String> {
        self.launched()
            .into_iter()
            .map(|o| o.task.as_str().to_string())
            .collect()
    }

    /// Number of attempts currently held open.
    pub fn held_count(&self) -> usize {
        self.state.lock().map(|s| s.held.len()).unwrap_or(0)
    }

    fn script(&self, order: &WorkOrder) -> Option<AttemptOutcome> {
        let Ok(mut state) = self.state.lock() else {
            return Some(AttemptOutcome::InfraFailure);
        };
        let task = order.task.as_str();
        if state.injection.hold.contains(task) {
            return None;
        }
        if state.injection.always_fail.contains(task) {
            return Some(AttemptOutcome::Failed);
        }
        if let Some(remaining) = state.injection.fail_n_times.get_mut(task) {
            if *remaining > 0 {
                *remaining -= 1;
                return Some(AttemptOutcome::Failed);
            }
        }
        Some(AttemptOutcome::Succeeded)
    }

    fn finish(&self, order: &WorkOrder, outcome: AttemptOutcome) -> TaskAttempt {
        let now = Utc::now();
        let mut attempt = TaskAttempt::new(order.instant, now, now, outcome)
            .with_executor(&self.name)
            .with_generation(order.generation);
        attempt.down_completed = order.plan.down.is_some() && outcome.is_success();
        if outcome == AttemptOutcome::Failed {
            attempt = attempt.with_exit_code(1).with_error("command exited with code 1");
        }
        attempt
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_claim(&self, requirements: &ResourceRequirements) -> Option<Claim> {
        let mut state = self.state.lock().ok()?;
        state
            .budget
            .claim(requirements)
            .then(|| Claim::local(*requirements))
    }

    fn release(&self, claim: &Claim) {
        if let Ok(mut state) = self.state.lock() {
            state.budget.release(&claim.requirements);
        }
    }

    async fn launch(
        &self,
        claim: Claim,
        order: WorkOrder,
        outcomes: OutcomeSender,
    ) -> Result<(), ExecutorError> {
        self.state
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .launched
            .push(order.clone());

        match self.script(&order) {
            Some(outcome) => {
                self.release(&claim);
                let attempt = self.finish(&order, outcome);
                let _ = outcomes.send(WorkOutcome::new(&order, attempt));
            }
            None => {
                self.state
                    .lock()
                    .map_err(|_| ExecutorError::LockPoisoned)?
                    .held
                    .insert(order.order_id.clone(), (order, claim, outcomes));
            }
        }
        Ok(())
    }

    async fn kill(&self, order_id: &OrderId) -> Result<(), ExecutorError> {
        let held = self
            .state
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .held
            .remove(order_id);
        if let Some((order, claim, outcomes)) = held {
            self.release(&claim);
            let attempt = self.finish(&order, AttemptOutcome::Killed);
            let _ = outcomes.send(WorkOutcome::new(&order, attempt));
        }
        Ok(())
    }

    fn capacity(&self) -> CoreBudget {
        self.state
            .lock()
            .map(|s| s.budget)
            .unwrap_or_else(|_| CoreBudget::new(0))
    }
}

/// In-memory storage whose writes fail on demand.
///
/// [`FlakyStorage::fail_writes`] makes every write fail;
/// [`FlakyStorage::fail_outcomes`] fails only [`Storage::record_outcome`].
/// Reads always succeed.
#[derive(Default)]
pub struct FlakyStorage {
    inner: InMemoryStorage,
    writes: AtomicBool,
    outcomes: AtomicBool,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_outcomes(&self, fail: bool) {
        self.outcomes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.writes.load(Ordering::SeqCst) {
            return Err(StorageError::Other("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn create_run(&self, header: &RunHeader, world: &World) -> Result<(), StorageError> {
        self.check()?;
        self.inner.create_run(header, world).await
    }

    async fn update_run(&self, header: &RunHeader) -> Result<(), StorageError> {
        self.check()?;
        self.inner.update_run(header).await
    }

    async fn list_runs(&self) -> Result<Vec<RunHeader>, StorageError> {
        self.inner.list_runs().await
    }

    async fn load_run(&self, run_id: &RunId) -> Result<StoredRun, StorageError> {
        self.inner.load_run(run_id).await
    }

    async fn save_task_entry(
        &self,
        run_id: &RunId,
        task: &TaskName,
        entry: &TaskEntry,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.inner.save_task_entry(run_id, task, entry).await
    }

    async fn append_attempt(
        &self,
        run_id: &RunId,
        task: &TaskName,
        attempt: &TaskAttempt,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.inner.append_attempt(run_id, task, attempt).await
    }

    async fn record_interval(
        &self,
        run_id: &RunId,
        entry: &LedgerEntry,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.inner.record_interval(run_id, entry).await
    }

    async fn record_down(&self, run_id: &RunId, down: &DownRecord) -> Result<(), StorageError> {
        self.check()?;
        self.inner.record_down(run_id, down).await
    }

    async fn record_outcome(&self, outcome: &OutcomeRecord<'_>) -> Result<(), StorageError> {
        self.check()?;
        if self.outcomes.load(Ordering::SeqCst) {
            return Err(StorageError::Other("injected outcome failure".to_string()));
        }
        self.inner.record_outcome(outcome).await
    }
}

/// An engine on in-memory storage, a [`ManualClock`] and a [`ScriptedExecutor`].
///
/// # Example
///
/// ```ignore
/// use tideline::testing::{TestHarness, fixtures};
///
/// let harness = TestHarness::start(fixtures::epoch(), 2).await;
/// let run_id = harness.submit(fixtures::chain_world()).await;
/// harness.tick_at(fixtures::epoch() + chrono::Duration::hours(10)).await;
/// let detail = harness.run(&run_id).await;
/// ```
pub struct TestHarness {
    handle: SchedulerHandle,
    task: JoinHandle<()>,
    clock: Arc<ManualClock>,
    executor: Arc<ScriptedExecutor>,
    storage: Arc<InMemoryStorage>,
}

impl TestHarness {
    /// Start an engine at `now` with a scripted executor of `cores` cores.
    pub async fn start(now: DateTime<Utc>, cores: u32) -> Self {
        Self::start_with(now, ScriptedExecutor::new(cores)).await
    }

    /// Start an engine at `now` with the given executor.
    pub async fn start_with(now: DateTime<Utc>, executor: ScriptedExecutor) -> Self {
        Self::start_on(Arc::new(InMemoryStorage::new()), now, Arc::new(executor)).await
    }

    /// Start an engine on existing storage, recovering whatever it holds.
    pub async fn start_on(
        storage: Arc<InMemoryStorage>,
        now: DateTime<Utc>,
        executor: Arc<ScriptedExecutor>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let mut scheduler = Scheduler::with_storage(Arc::clone(&storage))
            .with_clock(clock.clone())
            .with_executor(executor.clone())
            .with_tick_interval(Duration::from_secs(3600));
        scheduler
            .recover()
            .await
            .expect("recovery from in-memory storage");
        let (handle, task) = scheduler.start().await;
        Self {
            handle,
            task,
            clock,
            executor,
            storage,
        }
    }

    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn executor(&self) -> &ScriptedExecutor {
        &self.executor
    }

    pub fn storage(&self) -> Arc<InMemoryStorage> {
        Arc::clone(&self.storage)
    }

    /// Submit a world, panicking if it is rejected.
    pub async fn submit(&self, world: World) -> RunId {
        self.handle
            .submit("test", world)
            .await
            .expect("world accepted")
    }

    /// Move the clock to `now` and run one tick.
    pub async fn tick_at(&self, now: DateTime<Utc>) {
        self.clock.set(now);
        self.handle.tick().await.expect("tick");
    }

    /// Current detail of a run.
    pub async fn run(&self, run_id: &RunId) -> RunDetail {
        self.handle
            .get_run(run_id.clone())
            .await
            .expect("run exists")
    }

    /// State of one task as shown in the run detail.
    pub async fn task_state(&self, run_id: &RunId, task: &str) -> crate::run::TaskState {
        let detail = self.run(run_id).await;
        detail.task_states[&TaskName::new(task)].state
    }

    /// Stop the loop without draining, as a crash would.
    pub async fn abort(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    /// Shut the engine down and wait for its loop to exit.
    pub async fn shutdown(self) {
        self.handle.shutdown().await.expect("shutdown");
        let _ = self.task.await;
    }
}
