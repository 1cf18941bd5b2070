//! DagRuns and the task state machine.
//!
//! A [`DagRun`] owns a copy of the world, one [`TaskEntry`] per task, the
//! attempt log and the resource ledger. All transitions take `now`
//! explicitly so the engine controls the clock.
//!
//! ```text
//! QUEUED -> RUNNING -> COMPLETED | ERRORED
//!           RUNNING -> KILLED
//! COMPLETED | ERRORED | KILLED -> QUEUED   (retry)
//! COMPLETED -> QUEUED                      (next instant due)
//! ```

pub(crate) mod attempt;

pub use attempt::{AttemptOutcome, TaskAttempt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::core::interval::Interval;
use crate::core::resource::ResourceRequirements;
use crate::core::task::Task;
use crate::core::types::{RunId, TaskName};
use crate::core::world::World;
use crate::ledger::{
    Blocker, DependencyGraph, DownRecord, LedgerEntry, OverlapError, ResourceLedger, Resolver,
};

/// State of a task, or the aggregate state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Errored,
    Killed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Errored => "ERRORED",
            TaskState::Killed => "KILLED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized state name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown state: {0}")]
pub struct ParseStateError(pub String);

impl FromStr for TaskState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(TaskState::Queued),
            "RUNNING" => Ok(TaskState::Running),
            "COMPLETED" => Ok(TaskState::Completed),
            "ERRORED" => Ok(TaskState::Errored),
            "KILLED" => Ok(TaskState::Killed),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

/// Errors from run transitions.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("unknown task: {0}")]
    UnknownTask(TaskName),

    #[error("task {task} cannot move from {from} to {to}")]
    Invalid {
        task: TaskName,
        from: TaskState,
        to: TaskState,
    },
}

/// Per-task state inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEntry {
    pub state: TaskState,
    /// Scheduled instant the task is queued for, or last ran for.
    pub instant: DateTime<Utc>,
    /// Bumped on kill and on retry of a running task; outcomes from older
    /// generations are logged but ignored.
    pub generation: u64,
    /// Run `down` before the next attempt.
    pub pending_down: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl TaskEntry {
    fn queued(instant: DateTime<Utc>) -> Self {
        Self {
            state: TaskState::Queued,
            instant,
            generation: 0,
            pending_down: false,
            started_at: None,
        }
    }
}

/// Identity and flags of a run, stored alongside its world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_id: RunId,
    pub tag: String,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub killed: bool,
}

/// A task that may be dispatched this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub task: TaskName,
    pub instant: DateTime<Utc>,
    pub requirements: ResourceRequirements,
}

/// Result of applying an attempt to the run.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// The attempt was logged but belongs to an older generation.
    Stale,
    /// The task completed; these intervals were newly recorded.
    Completed {
        recorded: Vec<LedgerEntry>,
        downs: Vec<DownRecord>,
    },
    /// The task errored. `overlap` is set when a successful attempt was
    /// refused by the ledger.
    Errored {
        downs: Vec<DownRecord>,
        overlap: Option<OverlapError>,
    },
    /// The attempt reported itself killed.
    Killed { downs: Vec<DownRecord> },
}

/// Number of tasks in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TaskCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub errored: usize,
    pub killed: usize,
}

/// The header and task entries of a run, for undoing a transition.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    header: RunHeader,
    tasks: BTreeMap<TaskName, TaskEntry>,
}

/// One instantiation of a world.
#[derive(Debug, Clone)]
pub struct DagRun {
    header: RunHeader,
    world: Arc<World>,
    graph: DependencyGraph,
    tasks: BTreeMap<TaskName, TaskEntry>,
    attempts: BTreeMap<TaskName, Vec<TaskAttempt>>,
    ledger: ResourceLedger,
}

impl DagRun {
    /// Create a run with every task queued at its first in-window instant.
    pub fn new(tag: impl Into<String>, world: Arc<World>, now: DateTime<Utc>) -> Self {
        let header = RunHeader {
            run_id: RunId::new(),
            tag: tag.into(),
            created_at: now,
            last_update: now,
            killed: false,
        };
        Self::restore(header, world, BTreeMap::new(), Vec::new(), ResourceLedger::new())
    }

    /// Rebuild a run from persisted parts. Tasks without a stored entry
    /// start queued at their first instant.
    pub fn restore(
        header: RunHeader,
        world: Arc<World>,
        mut entries: BTreeMap<TaskName, TaskEntry>,
        attempts: impl IntoIterator<Item = (TaskName, TaskAttempt)>,
        ledger: ResourceLedger,
    ) -> Self {
        let tasks = world
            .tasks()
            .map(|task| {
                let entry = entries.remove(&task.name).unwrap_or_else(|| {
                    let first = task
                        .schedule
                        .first_instant()
                        .unwrap_or_else(|| task.schedule.valid_from());
                    TaskEntry::queued(first)
                });
                (task.name.clone(), entry)
            })
            .collect();

        let mut run = Self {
            header,
            graph: DependencyGraph::from_world(&world),
            world,
            tasks,
            attempts: BTreeMap::new(),
            ledger,
        };
        for (name, attempt) in attempts {
            run.push_attempt(&name, attempt);
        }
        run
    }

    pub fn run_id(&self) -> &RunId {
        &self.header.run_id
    }

    pub fn tag(&self) -> &str {
        &self.header.tag
    }

    pub fn header(&self) -> &RunHeader {
        &self.header
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.header.created_at
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.header.last_update
    }

    pub fn is_killed(&self) -> bool {
        self.header.killed
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// The entry of one task.
    pub fn entry(&self, name: &TaskName) -> Option<&TaskEntry> {
        self.tasks.get(name)
    }

    /// All task entries, ordered by task name.
    pub fn entries(&self) -> &BTreeMap<TaskName, TaskEntry> {
        &self.tasks
    }

    /// Attempts of one task, ordered by start time.
    pub fn attempts(&self, name: &TaskName) -> &[TaskAttempt] {
        self.attempts.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The full attempt log.
    pub fn all_attempts(&self) -> &BTreeMap<TaskName, Vec<TaskAttempt>> {
        &self.attempts
    }

    fn task(&self, name: &TaskName) -> Result<&Task, TransitionError> {
        self.world
            .task(name)
            .ok_or_else(|| TransitionError::UnknownTask(name.clone()))
    }

    fn entry_mut(&mut self, name: &TaskName) -> Result<&mut TaskEntry, TransitionError> {
        self.tasks
            .get_mut(name)
            .ok_or_else(|| TransitionError::UnknownTask(name.clone()))
    }

    fn push_attempt(&mut self, name: &TaskName, attempt: TaskAttempt) {
        let log = self.attempts.entry(name.clone()).or_default();
        let at = log.partition_point(|a| a.start_time <= attempt.start_time);
        log.insert(at, attempt);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.header.last_update {
            self.header.last_update = now;
        }
    }

    /// Capture the header and task entries.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            header: self.header.clone(),
            tasks: self.tasks.clone(),
        }
    }

    /// Restore the header and task entries captured by [`DagRun::snapshot`].
    /// Attempts and the ledger are left as they are.
    pub fn rollback(&mut self, snapshot: RunSnapshot) {
        self.header = snapshot.header;
        self.tasks = snapshot.tasks;
    }

    /// Aggregate state of the run.
    pub fn state(&self) -> TaskState {
        let counts = self.task_counts();
        if self.header.killed {
            TaskState::Killed
        } else if counts.running > 0 {
            TaskState::Running
        } else if counts.errored > 0 {
            TaskState::Errored
        } else if counts.completed == self.tasks.len() {
            TaskState::Completed
        } else {
            TaskState::Queued
        }
    }

    pub fn task_counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for entry in self.tasks.values() {
            match entry.state {
                TaskState::Queued => counts.queued += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Errored => counts.errored += 1,
                TaskState::Killed => counts.killed += 1,
            }
        }
        counts
    }

    /// Fraction of tasks completed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 1.0;
        }
        self.task_counts().completed as f64 / self.tasks.len() as f64
    }

    /// True when killed, or when every task is completed and none has a
    /// further instant in its window.
    pub fn is_terminal(&self) -> bool {
        if self.header.killed {
            return true;
        }
        self.tasks.iter().all(|(name, entry)| {
            entry.state == TaskState::Completed
                && self.world.task(name).is_none_or(|task| {
                    task.schedule.instants_after(entry.instant).next().is_none()
                })
        })
    }

    /// The next scheduled instant of a task after the one it holds.
    pub fn next_instant(&self, name: &TaskName) -> Option<DateTime<Utc>> {
        let entry = self.tasks.get(name)?;
        let task = self.world.task(name)?;
        task.schedule.instants_after(entry.instant).next()
    }

    /// Re-queue completed tasks whose next instant has arrived.
    ///
    /// A task moves forward one instant per call, so every instant of a
    /// backlog gets its own attempt. Catching up on `n` missed instants
    /// takes at least `n` dispatcher ticks.
    pub fn requeue_due(&mut self, now: DateTime<Utc>) -> Vec<TaskName> {
        let mut requeued = Vec::new();
        for (name, entry) in self.tasks.iter_mut() {
            if entry.state != TaskState::Completed {
                continue;
            }
            let Some(task) = self.world.task(name) else {
                continue;
            };
            if let Some(next) = task.schedule.instants_after(entry.instant).next() {
                if next <= now {
                    entry.state = TaskState::Queued;
                    entry.instant = next;
                    entry.pending_down = false;
                    requeued.push(name.clone());
                }
            }
        }
        if !requeued.is_empty() {
            self.touch(now);
        }
        requeued
    }

    /// Queued tasks that are due and whose requirements are covered.
    pub fn candidates(&self, now: DateTime<Utc>) -> Vec<Candidate> {
        if self.header.killed {
            return Vec::new();
        }
        let resolver = Resolver::new(&self.world, &self.graph, &self.ledger);
        self.tasks
            .iter()
            .filter(|(_, e)| e.state == TaskState::Queued && e.instant <= now)
            .filter_map(|(name, e)| {
                let task = self.world.task(name)?;
                resolver.is_ready(task, e.instant).then(|| Candidate {
                    task: name.clone(),
                    instant: e.instant,
                    requirements: task.requirements(),
                })
            })
            .collect()
    }

    /// Unsatisfied requirements of queued tasks that are already due.
    pub fn blocked_on(&self, now: DateTime<Utc>) -> BTreeMap<TaskName, Vec<Blocker>> {
        let resolver = Resolver::new(&self.world, &self.graph, &self.ledger);
        self.tasks
            .iter()
            .filter(|(_, e)| e.state == TaskState::Queued && e.instant <= now)
            .filter_map(|(name, e)| {
                let task = self.world.task(name)?;
                let blockers = resolver.blockers(task, e.instant);
                (!blockers.is_empty()).then(|| (name.clone(), blockers))
            })
            .collect()
    }

    /// QUEUED -> RUNNING. Returns the generation the attempt must report.
    pub fn start(&mut self, name: &TaskName, now: DateTime<Utc>) -> Result<u64, TransitionError> {
        let entry = self.entry_mut(name)?;
        if entry.state != TaskState::Queued {
            return Err(TransitionError::Invalid {
                task: name.clone(),
                from: entry.state,
                to: TaskState::Running,
            });
        }
        entry.state = TaskState::Running;
        entry.started_at = Some(now);
        let generation = entry.generation;
        self.touch(now);
        Ok(generation)
    }

    /// Kill one task. Returns the generation to signal if it was running.
    pub fn kill_task(
        &mut self,
        name: &TaskName,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, TransitionError> {
        let entry = self.entry_mut(name)?;
        if entry.state != TaskState::Running {
            return Ok(None);
        }
        let signalled = entry.generation;
        entry.generation += 1;
        entry.state = TaskState::Killed;
        self.touch(now);
        Ok(Some(signalled))
    }

    /// Retry one task. Returns the generation to signal if it was running.
    pub fn retry_task(
        &mut self,
        name: &TaskName,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, TransitionError> {
        let entry = self.entry_mut(name)?;
        let signalled = match entry.state {
            TaskState::Queued => return Ok(None),
            TaskState::Running => {
                let signalled = entry.generation;
                entry.generation += 1;
                Some(signalled)
            }
            TaskState::Completed => {
                entry.pending_down = true;
                None
            }
            TaskState::Errored | TaskState::Killed => None,
        };
        entry.state = TaskState::Queued;
        entry.started_at = None;
        self.touch(now);
        Ok(signalled)
    }

    /// Kill the run and every running task. Returns the attempts to signal.
    pub fn kill(&mut self, now: DateTime<Utc>) -> Vec<(TaskName, u64)> {
        self.header.killed = true;
        let running: Vec<TaskName> = self
            .tasks
            .iter()
            .filter(|(_, e)| e.state == TaskState::Running)
            .map(|(n, _)| n.clone())
            .collect();
        let signalled = running
            .into_iter()
            .filter_map(|name| {
                let generation = self.kill_task(&name, now).ok().flatten()?;
                Some((name, generation))
            })
            .collect();
        self.touch(now);
        signalled
    }

    /// Clear the kill flag and retry every errored or killed task.
    pub fn retry(&mut self, now: DateTime<Utc>) -> Vec<TaskName> {
        self.header.killed = false;
        let mut requeued = Vec::new();
        for (name, entry) in self.tasks.iter_mut() {
            if matches!(entry.state, TaskState::Errored | TaskState::Killed) {
                entry.state = TaskState::Queued;
                entry.started_at = None;
                requeued.push(name.clone());
            }
        }
        self.touch(now);
        requeued
    }

    /// Log an attempt and, if it belongs to the running generation, apply it.
    pub fn apply_attempt(
        &mut self,
        name: &TaskName,
        attempt: TaskAttempt,
        now: DateTime<Utc>,
    ) -> Result<Applied, TransitionError> {
        let task = self.task(name)?.clone();
        let entry = self
            .tasks
            .get(name)
            .cloned()
            .ok_or_else(|| TransitionError::UnknownTask(name.clone()))?;

        let outcome = attempt.outcome;
        let generation = attempt.generation;
        let down_completed = attempt.down_completed;
        self.push_attempt(name, attempt);
        self.touch(now);

        if entry.state != TaskState::Running || entry.generation != generation {
            return Ok(Applied::Stale);
        }

        let interval = task.interval_for(entry.instant);
        let downs = if down_completed && task.down.is_some() {
            self.record_downs(&task, interval, now)
        } else {
            Vec::new()
        };

        let (state, applied) = match outcome {
            AttemptOutcome::Succeeded => match self.record_provided(&task, interval, now) {
                Ok(recorded) => (TaskState::Completed, Applied::Completed { recorded, downs }),
                Err(e) => (
                    TaskState::Errored,
                    Applied::Errored {
                        downs,
                        overlap: Some(e),
                    },
                ),
            },
            AttemptOutcome::Killed => (TaskState::Killed, Applied::Killed { downs }),
            AttemptOutcome::Failed | AttemptOutcome::InfraFailure => (
                TaskState::Errored,
                Applied::Errored {
                    downs,
                    overlap: None,
                },
            ),
        };

        let entry = self.entry_mut(name)?;
        entry.state = state;
        if down_completed {
            entry.pending_down = false;
        }
        Ok(applied)
    }

    fn record_downs(&mut self, task: &Task, interval: Interval, now: DateTime<Utc>) -> Vec<DownRecord> {
        let downs: Vec<DownRecord> = task
            .provides
            .iter()
            .map(|resource| DownRecord {
                resource: resource.clone(),
                producer: task.name.clone(),
                interval,
                recorded_at: now,
            })
            .collect();
        for down in &downs {
            self.ledger.note_down(down.clone());
        }
        downs
    }

    /// Record every provided resource, or nothing if any would overlap.
    fn record_provided(
        &mut self,
        task: &Task,
        interval: Interval,
        now: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, OverlapError> {
        let fresh: Vec<_> = task
            .provides
            .iter()
            .filter(|r| !self.ledger.contains_exact(r, &task.name, &interval))
            .cloned()
            .collect();
        for resource in &fresh {
            self.ledger.check(resource, &task.name, &interval)?;
        }

        let mut recorded = Vec::with_capacity(fresh.len());
        for resource in fresh {
            recorded.push(self.ledger.record(resource, task.name.clone(), interval, now)?);
        }
        Ok(recorded)
    }

    /// Re-queue tasks that were running when the engine stopped, logging an
    /// infrastructure failure for each.
    pub fn recover_interrupted(&mut self, now: DateTime<Utc>) -> Vec<(TaskName, TaskAttempt)> {
        let mut recovered = Vec::new();
        for (name, entry) in self.tasks.iter_mut() {
            if entry.state != TaskState::Running {
                continue;
            }
            let attempt = TaskAttempt::infra_failure(
                entry.instant,
                entry.started_at.unwrap_or(now),
                "interrupted by engine restart",
            )
            .with_generation(entry.generation);
            entry.generation += 1;
            entry.state = TaskState::Queued;
            entry.started_at = None;
            recovered.push((name.clone(), attempt));
        }
        for (name, attempt) in &recovered {
            self.push_attempt(name, attempt.clone());
        }
        if !recovered.is_empty() {
            self.touch(now);
        }
        recovered
    }
}
