//! Scheduler engine implementation.
//!
//! The engine loop is the single owner of every [`DagRun`]. It is responsible for:
//! - Re-queueing completed tasks whose next instant has arrived
//! - Admitting ready tasks against executor capacity
//! - Applying attempt outcomes to runs and the resource ledger
//! - Kill and retry of runs and tasks
//! - Recovery from interruptions
//! - Event emission
//!
//! Every transition is written to storage before it becomes visible. When a
//! write fails the run is put back as it was: a start is abandoned and its
//! claim released, a command returns the error, and an attempt outcome is
//! held and applied again on the next tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::types::{Clock, SchedulerCommand, SchedulerError, SchedulerState, SystemClock};
use super::views::{self, DetailsGroup, DetailsQuery, RunDetail, RunSummary};
use crate::config::ConfigError;
use crate::core::types::{OrderId, RunId, TaskName};
use crate::core::world::World;
use crate::events::{Event, EventBus};
use crate::execution::{AttemptPlan, Claim, Executor, OutcomeSender, WorkOrder, WorkOutcome};
use crate::run::{Applied, Candidate, DagRun, RunSnapshot, TaskAttempt, TaskState};
use crate::storage::{self, OutcomeRecord, Storage, StorageError};

/// An attempt the engine is waiting on.
#[derive(Debug, Clone)]
struct Inflight {
    order_id: OrderId,
    executor: usize,
    generation: u64,
}

/// A candidate with its run's creation time, for admission order.
struct Admission {
    run_id: RunId,
    created_at: chrono::DateTime<chrono::Utc>,
    candidate: Candidate,
}

/// The scheduler engine.
pub struct Scheduler<S: Storage> {
    /// Storage backend.
    storage: Arc<S>,
    /// Executors, tried in order at admission.
    executors: Vec<Arc<dyn Executor>>,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    /// Tick interval for admission.
    tick_interval: Duration,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
    runs: BTreeMap<RunId, DagRun>,
    inflight: HashMap<(RunId, TaskName), Inflight>,
    /// Outcomes whose write failed, applied again on the next tick.
    deferred: Vec<(RunId, TaskName, TaskAttempt)>,
    outcome_tx: OutcomeSender,
    outcome_rx: Option<mpsc::UnboundedReceiver<WorkOutcome>>,
}

impl<S: Storage + 'static> Scheduler<S> {
    /// Create a new scheduler with the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new scheduler with shared storage.
    pub fn with_storage(storage: Arc<S>) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            storage,
            executors: Vec::new(),
            event_bus: Arc::new(EventBus::new()),
            clock: Arc::new(SystemClock),
            tick_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            runs: BTreeMap::new(),
            inflight: HashMap::new(),
            deferred: Vec::new(),
            outcome_tx,
            outcome_rx: Some(outcome_rx),
        }
    }

    /// Add an executor. Admission tries executors in the order they were added.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Runs currently owned by the engine.
    pub fn runs(&self) -> impl Iterator<Item = &DagRun> {
        self.runs.values()
    }

    /// Rebuild every run from storage.
    ///
    /// Tasks found RUNNING were interrupted: each is re-queued with a bumped
    /// generation and an infrastructure-failure attempt is appended to its log.
    pub async fn recover(&mut self) -> Result<Vec<RunId>, SchedulerError> {
        let now = self.clock.now();
        let mut recovered = Vec::new();

        for mut run in storage::load_all_runs(self.storage.as_ref()).await? {
            let run_id = run.run_id().clone();
            let interrupted = run.recover_interrupted(now);
            for (task, attempt) in &interrupted {
                tracing::warn!(run_id = %run_id, task = %task, "re-queueing task interrupted by restart");
                self.storage.append_attempt(&run_id, task, attempt).await?;
            }
            if !interrupted.is_empty() {
                storage::save_run_state(self.storage.as_ref(), &run).await?;
            }
            recovered.push(run_id.clone());
            self.runs.insert(run_id, run);
        }

        if !recovered.is_empty() {
            tracing::info!(runs = recovered.len(), "recovered runs from storage");
        }
        Ok(recovered)
    }

    /// Start the scheduler and return a handle for controlling it.
    pub async fn start(mut self) -> (SchedulerHandle, JoinHandle<()>) {
        if self.executors.is_empty() {
            tracing::warn!("no executors configured; tasks will stay queued");
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let outcome_rx = match self.outcome_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.outcome_tx = tx;
                rx
            }
        };

        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx, outcome_rx, state).await;
        });

        (handle, scheduler_task)
    }

    /// Main scheduler loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        mut outcome_rx: mpsc::UnboundedReceiver<WorkOutcome>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let start = tokio::time::Instant::now() + self.tick_interval;
        let mut interval = tokio::time::interval_at(start, self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }

                Some(outcome) = outcome_rx.recv() => {
                    self.handle_outcome(outcome).await;
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        tracing::info!("all scheduler handles dropped; stopping");
                        break;
                    };
                    match command {
                        SchedulerCommand::Submit { tag, world, response } => {
                            let _ = response.send(self.submit(tag, world).await);
                        }
                        SchedulerCommand::KillRun { run_id, response } => {
                            let _ = response.send(self.kill_run(&run_id).await);
                        }
                        SchedulerCommand::RetryRun { run_id, response } => {
                            let _ = response.send(self.retry_run(&run_id).await);
                        }
                        SchedulerCommand::KillTask { run_id, task, response } => {
                            let _ = response.send(self.kill_task(&run_id, &task).await);
                        }
                        SchedulerCommand::RetryTask { run_id, task, response } => {
                            let _ = response.send(self.retry_task(&run_id, &task).await);
                        }
                        SchedulerCommand::ListRuns { all, response } => {
                            let _ = response.send(Ok(self.list_runs(all)));
                        }
                        SchedulerCommand::GetRun { run_id, response } => {
                            let _ = response.send(self.get_run(&run_id));
                        }
                        SchedulerCommand::Details { query, response } => {
                            let _ = response.send(Ok(self.details(&query)));
                        }
                        SchedulerCommand::Tick { response } => {
                            self.drain_outcomes(&mut outcome_rx).await;
                            self.tick().await;
                            self.drain_outcomes(&mut outcome_rx).await;
                            let _ = response.send(());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            *state.write().await = SchedulerState::Draining;
                            self.await_inflight(&mut outcome_rx).await;
                            *state.write().await = SchedulerState::Stopped;
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }

        *state.write().await = SchedulerState::Stopped;
    }

    /// Apply every outcome already waiting on the channel.
    async fn drain_outcomes(&mut self, outcome_rx: &mut mpsc::UnboundedReceiver<WorkOutcome>) {
        while let Ok(outcome) = outcome_rx.try_recv() {
            self.handle_outcome(outcome).await;
        }
    }

    /// One dispatcher pass at the clock's current time.
    async fn tick(&mut self) {
        let now = self.clock.now();

        for executor in &self.executors {
            executor.maintain().await;
        }

        for (run_id, task, attempt) in std::mem::take(&mut self.deferred) {
            self.apply(&run_id, &task, attempt).await;
        }

        let mut requeued = Vec::new();
        for run in self.runs.values_mut() {
            let before = run.snapshot();
            let tasks = run.requeue_due(now);
            if !tasks.is_empty() {
                requeued.push((run.run_id().clone(), tasks, before));
            }
        }
        for (run_id, tasks, before) in requeued {
            if let Err(e) = self.persist_tasks(&run_id, &tasks).await {
                tracing::error!(run_id = %run_id, error = %e, "failed to persist re-queued tasks; retrying next tick");
                if let Some(run) = self.runs.get_mut(&run_id) {
                    run.rollback(before);
                }
                continue;
            }
            for task in tasks {
                let instant = self.instant_of(&run_id, &task).unwrap_or(now);
                self.event_bus
                    .emit(Event::TaskQueued {
                        run_id: run_id.clone(),
                        task,
                        instant,
                        timestamp: now,
                    })
                    .await;
            }
        }

        for (executor, claim, admission) in self.admit(now) {
            self.dispatch(executor, claim, admission, now).await;
        }
    }

    /// Claim capacity for due, ready candidates in admission order.
    /// Candidates that fit no executor are skipped and stay QUEUED.
    fn admit(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<(usize, Claim, Admission)> {
        let mut admissions: Vec<Admission> = self
            .runs
            .values()
            .filter(|run| !run.is_killed())
            .flat_map(|run| {
                run.candidates(now).into_iter().map(|candidate| Admission {
                    run_id: run.run_id().clone(),
                    created_at: run.created_at(),
                    candidate,
                })
            })
            .collect();
        admissions.sort_by(|a, b| {
            (a.candidate.instant, a.created_at, &a.candidate.task).cmp(&(
                b.candidate.instant,
                b.created_at,
                &b.candidate.task,
            ))
        });

        let mut claimed = Vec::new();
        for admission in admissions {
            let requirements = admission.candidate.requirements;
            let claim = self
                .executors
                .iter()
                .enumerate()
                .find_map(|(i, e)| e.try_claim(&requirements).map(|c| (i, c)));
            match claim {
                Some((executor, claim)) => claimed.push((executor, claim, admission)),
                None => {
                    tracing::debug!(
                        run_id = %admission.run_id,
                        task = %admission.candidate.task,
                        cores = requirements.cores,
                        "no executor has capacity; candidate stays queued"
                    );
                }
            }
        }
        claimed
    }

    /// Start, persist, render and launch one admitted candidate.
    async fn dispatch(
        &mut self,
        executor_idx: usize,
        claim: Claim,
        admission: Admission,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let Some(executor) = self.executors.get(executor_idx).cloned() else {
            return;
        };
        let run_id = admission.run_id;
        let task_name = admission.candidate.task;

        let Some(run) = self.runs.get_mut(&run_id) else {
            executor.release(&claim);
            return;
        };
        let before = run.snapshot();
        let generation = match run.start(&task_name, now) {
            Ok(generation) => generation,
            Err(e) => {
                tracing::warn!(run_id = %run_id, task = %task_name, error = %e, "could not start task");
                executor.release(&claim);
                return;
            }
        };

        let Some(order) = Self::work_order(run, &task_name, generation) else {
            run.rollback(before);
            executor.release(&claim);
            return;
        };

        // Nothing is launched until storage shows the task RUNNING
        if let Err(e) = self.persist_tasks(&run_id, std::slice::from_ref(&task_name)).await {
            tracing::error!(run_id = %run_id, task = %task_name, error = %e, "failed to persist task start; task stays queued");
            if let Some(run) = self.runs.get_mut(&run_id) {
                run.rollback(before);
            }
            executor.release(&claim);
            return;
        }

        let order_id = order.order_id.clone();
        let instant = order.instant;
        let lost = order.lost(now, executor.name(), "launch failed");
        match executor.launch(claim, order, self.outcome_tx.clone()).await {
            Ok(()) => {
                self.inflight.insert(
                    (run_id.clone(), task_name.clone()),
                    Inflight {
                        order_id,
                        executor: executor_idx,
                        generation,
                    },
                );
                self.event_bus
                    .emit(Event::TaskStarted {
                        run_id,
                        task: task_name,
                        instant,
                        executor: executor.name().to_string(),
                        timestamp: now,
                    })
                    .await;
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, task = %task_name, error = %e, "launch failed");
                let attempt = lost.with_error(e.to_string());
                self.apply(&run_id, &task_name, attempt).await;
            }
        }
    }

    /// Render the attempt plan for a task that was just started.
    fn work_order(run: &DagRun, name: &TaskName, generation: u64) -> Option<WorkOrder> {
        let task = run.world().task(name)?;
        let entry = run.entry(name)?;
        let vars = run.world().vars_for(task, entry.instant, run.run_id());
        let plan = AttemptPlan {
            down: if entry.pending_down {
                task.down.as_ref().map(|c| c.render(&vars))
            } else {
                None
            },
            check: task.check.as_ref().map(|c| c.render(&vars)),
            up: task.up.as_ref().map(|c| c.render(&vars)),
        };
        Some(WorkOrder {
            order_id: OrderId::new(),
            run_id: run.run_id().clone(),
            task: name.clone(),
            generation,
            instant: entry.instant,
            interval: task.interval_for(entry.instant),
            plan,
            requirements: task.requirements(),
            output_options: run.world().output_options().clone(),
        })
    }

    async fn handle_outcome(&mut self, outcome: WorkOutcome) {
        let key = (outcome.run_id.clone(), outcome.task.clone());
        if self
            .inflight
            .get(&key)
            .is_some_and(|f| f.order_id == outcome.order_id)
        {
            self.inflight.remove(&key);
        }
        self.apply(&outcome.run_id, &outcome.task, outcome.attempt)
            .await;
    }

    /// Log an attempt, apply it to a copy of its run and persist the
    /// effects. The copy replaces the run only once the write succeeded.
    async fn apply(&mut self, run_id: &RunId, task: &TaskName, attempt: TaskAttempt) {
        let now = self.clock.now();
        let Some(run) = self.runs.get(run_id) else {
            tracing::warn!(run_id = %run_id, task = %task, "outcome for unknown run dropped");
            return;
        };

        let instant = attempt.instant;
        let duration = attempt.duration();
        let outcome = attempt.outcome;
        let error = attempt.error.clone().unwrap_or_default();
        let exit_code = attempt.exit_code;

        let mut staged = run.clone();
        let applied = match staged.apply_attempt(task, attempt.clone(), now) {
            Ok(applied) => applied,
            Err(e) => {
                tracing::warn!(run_id = %run_id, task = %task, error = %e, "outcome rejected");
                return;
            }
        };

        let mut events = Vec::new();
        let mut recorded = Vec::new();
        let mut downs = Vec::new();
        match applied {
            Applied::Stale => {
                tracing::debug!(run_id = %run_id, task = %task, outcome = %outcome, "ignoring outcome from an older generation");
            }
            Applied::Completed {
                recorded: entries,
                downs: d,
            } => {
                downs = d;
                events.push(Event::TaskCompleted {
                    run_id: run_id.clone(),
                    task: task.clone(),
                    instant,
                    duration,
                    timestamp: now,
                });
                for entry in &entries {
                    events.push(Event::IntervalRecorded {
                        run_id: run_id.clone(),
                        resource: entry.resource.clone(),
                        producer: entry.producer.clone(),
                        interval: entry.interval,
                        timestamp: now,
                    });
                }
                recorded = entries;
            }
            Applied::Errored { downs: d, overlap } => {
                downs = d;
                let error = match overlap {
                    Some(e) => {
                        tracing::warn!(run_id = %run_id, task = %task, error = %e, "ledger refused interval");
                        e.to_string()
                    }
                    None => error,
                };
                events.push(Event::TaskFailed {
                    run_id: run_id.clone(),
                    task: task.clone(),
                    instant,
                    outcome,
                    error,
                    exit_code,
                    timestamp: now,
                });
            }
            Applied::Killed { downs: d } => {
                downs = d;
                events.push(Event::TaskKilled {
                    run_id: run_id.clone(),
                    task: task.clone(),
                    timestamp: now,
                });
            }
        }

        let Some(entry) = staged.entry(task) else {
            return;
        };
        let record = OutcomeRecord {
            header: staged.header(),
            task,
            entry,
            attempt: &attempt,
            intervals: &recorded,
            downs: &downs,
        };
        if let Err(e) = self.storage.record_outcome(&record).await {
            tracing::error!(run_id = %run_id, task = %task, error = %e, "failed to persist outcome; retrying next tick");
            self.deferred.push((run_id.clone(), task.clone(), attempt));
            return;
        }

        self.runs.insert(run_id.clone(), staged);
        for event in events {
            self.event_bus.emit(event).await;
        }
    }

    /// Write some task entries and the run header.
    async fn persist_tasks(&self, run_id: &RunId, tasks: &[TaskName]) -> Result<(), StorageError> {
        let Some(run) = self.runs.get(run_id) else {
            return Ok(());
        };
        for task in tasks {
            if let Some(entry) = run.entry(task) {
                self.storage.save_task_entry(run_id, task, entry).await?;
            }
        }
        self.storage.update_run(run.header()).await
    }

    /// Write a whole run, or put it back to `before` if the write fails.
    async fn save_or_rollback(&mut self, run_id: &RunId, before: RunSnapshot) -> Result<(), SchedulerError> {
        let Some(run) = self.runs.get(run_id) else {
            return Ok(());
        };
        if let Err(e) = storage::save_run_state(self.storage.as_ref(), run).await {
            if let Some(run) = self.runs.get_mut(run_id) {
                run.rollback(before);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Write one task entry, or put the run back to `before` if the write fails.
    async fn persist_or_rollback(
        &mut self,
        run_id: &RunId,
        task: &TaskName,
        before: RunSnapshot,
    ) -> Result<(), SchedulerError> {
        if let Err(e) = self.persist_tasks(run_id, std::slice::from_ref(task)).await {
            if let Some(run) = self.runs.get_mut(run_id) {
                run.rollback(before);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn instant_of(&self, run_id: &RunId, task: &TaskName) -> Option<chrono::DateTime<chrono::Utc>> {
        Some(self.runs.get(run_id)?.entry(task)?.instant)
    }

    fn run_mut(&mut self, run_id: &RunId) -> Result<&mut DagRun, SchedulerError> {
        self.runs
            .get_mut(run_id)
            .ok_or_else(|| SchedulerError::RunNotFound(run_id.clone()))
    }

    fn check_task(&self, run_id: &RunId, task: &TaskName) -> Result<(), SchedulerError> {
        let run = self
            .runs
            .get(run_id)
            .ok_or_else(|| SchedulerError::RunNotFound(run_id.clone()))?;
        if run.entry(task).is_none() {
            return Err(SchedulerError::TaskNotFound {
                run_id: run_id.clone(),
                task: task.clone(),
            });
        }
        Ok(())
    }

    async fn submit(&mut self, tag: String, world: World) -> Result<RunId, SchedulerError> {
        if world.is_empty() {
            return Err(ConfigError::InvalidConfig("world has no tasks".to_string()).into());
        }
        let now = self.clock.now();
        let run = DagRun::new(tag.clone(), Arc::new(world), now);
        let run_id = run.run_id().clone();

        storage::create_run(self.storage.as_ref(), &run).await?;
        self.runs.insert(run_id.clone(), run);

        self.event_bus
            .emit(Event::RunSubmitted {
                run_id: run_id.clone(),
                tag,
                timestamp: now,
            })
            .await;
        Ok(run_id)
    }

    /// Signal the executor of a task's inflight attempt if it belongs to `generation`.
    async fn signal_kill(&mut self, run_id: &RunId, task: &TaskName, generation: u64) {
        let key = (run_id.clone(), task.clone());
        let Some(inflight) = self.inflight.get(&key).cloned() else {
            return;
        };
        if inflight.generation != generation {
            return;
        }
        let Some(executor) = self.executors.get(inflight.executor).cloned() else {
            return;
        };
        if let Err(e) = executor.kill(&inflight.order_id).await {
            tracing::warn!(run_id = %run_id, task = %task, error = %e, "failed to signal kill");
        }
    }

    async fn kill_run(&mut self, run_id: &RunId) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        let run = self.run_mut(run_id)?;
        let before = run.snapshot();
        let signalled = run.kill(now);
        let tasks: Vec<TaskName> = signalled.iter().map(|(t, _)| t.clone()).collect();
        self.save_or_rollback(run_id, before).await?;

        for (task, generation) in signalled {
            self.signal_kill(run_id, &task, generation).await;
        }
        for task in tasks {
            self.event_bus
                .emit(Event::TaskKilled {
                    run_id: run_id.clone(),
                    task,
                    timestamp: now,
                })
                .await;
        }
        self.event_bus
            .emit(Event::RunKilled {
                run_id: run_id.clone(),
                timestamp: now,
            })
            .await;
        Ok(())
    }

    async fn retry_run(&mut self, run_id: &RunId) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        let run = self.run_mut(run_id)?;
        let before = run.snapshot();
        let requeued = run.retry(now);
        self.save_or_rollback(run_id, before).await?;
        for task in requeued {
            let instant = self.instant_of(run_id, &task).unwrap_or(now);
            self.event_bus
                .emit(Event::TaskQueued {
                    run_id: run_id.clone(),
                    task,
                    instant,
                    timestamp: now,
                })
                .await;
        }
        Ok(())
    }

    async fn kill_task(&mut self, run_id: &RunId, task: &TaskName) -> Result<(), SchedulerError> {
        self.check_task(run_id, task)?;
        let now = self.clock.now();
        let run = self.run_mut(run_id)?;
        let before = run.snapshot();
        let signalled = run.kill_task(task, now)?;
        let Some(generation) = signalled else {
            return Ok(());
        };
        self.persist_or_rollback(run_id, task, before).await?;
        self.signal_kill(run_id, task, generation).await;
        self.event_bus
            .emit(Event::TaskKilled {
                run_id: run_id.clone(),
                task: task.clone(),
                timestamp: now,
            })
            .await;
        Ok(())
    }

    async fn retry_task(&mut self, run_id: &RunId, task: &TaskName) -> Result<(), SchedulerError> {
        self.check_task(run_id, task)?;
        let now = self.clock.now();
        let run = self.run_mut(run_id)?;
        let was = run.entry(task).map(|e| e.state);
        let before = run.snapshot();
        let signalled = run.retry_task(task, now)?;
        if was == Some(TaskState::Queued) {
            return Ok(());
        }
        self.persist_or_rollback(run_id, task, before).await?;
        if let Some(generation) = signalled {
            self.signal_kill(run_id, task, generation).await;
        }
        let instant = self.instant_of(run_id, task).unwrap_or(now);
        self.event_bus
            .emit(Event::TaskQueued {
                run_id: run_id.clone(),
                task: task.clone(),
                instant,
                timestamp: now,
            })
            .await;
        Ok(())
    }

    fn list_runs(&self, all: bool) -> Vec<RunSummary> {
        self.runs
            .values()
            .filter(|run| all || !run.is_terminal())
            .map(RunSummary::of)
            .collect()
    }

    fn get_run(&self, run_id: &RunId) -> Result<RunDetail, SchedulerError> {
        let run = self
            .runs
            .get(run_id)
            .ok_or_else(|| SchedulerError::RunNotFound(run_id.clone()))?;
        Ok(RunDetail::of(run, self.clock.now()))
    }

    fn details(&self, query: &DetailsQuery) -> Vec<DetailsGroup> {
        views::details(self.runs.values(), query)
    }

    /// Wait for inflight attempts to report, up to the shutdown timeout.
    async fn await_inflight(&mut self, outcome_rx: &mut mpsc::UnboundedReceiver<WorkOutcome>) {
        self.drain_outcomes(outcome_rx).await;
        if self.inflight.is_empty() {
            tracing::info!("No running attempts to wait for during shutdown");
            return;
        }

        tracing::info!(
            "Graceful shutdown: waiting for {} running attempt(s) to complete (timeout: {:?})",
            self.inflight.len(),
            self.shutdown_timeout
        );

        let start = tokio::time::Instant::now();
        let deadline = start + self.shutdown_timeout;
        while !self.inflight.is_empty() {
            match tokio::time::timeout_at(deadline, outcome_rx.recv()).await {
                Ok(Some(outcome)) => self.handle_outcome(outcome).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "Graceful shutdown timeout ({:?}) exceeded with {} attempt(s) still running",
                        self.shutdown_timeout,
                        self.inflight.len()
                    );
                    return;
                }
            }
        }
        tracing::info!("All running attempts completed gracefully in {:?}", start.elapsed());
    }
}
