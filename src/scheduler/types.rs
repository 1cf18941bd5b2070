//! Scheduler type definitions.
//!
//! This module contains error types, state enums, the clock abstraction
//! and command types for the scheduler.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use super::views::{DetailsGroup, DetailsQuery, RunDetail, RunSummary};
use crate::config::ConfigError;
use crate::core::types::{RunId, TaskName};
use crate::core::world::World;
use crate::run::TransitionError;
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Run not found.
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Task not found in a run.
    #[error("task '{task}' not found in run {run_id}")]
    TaskNotFound { run_id: RunId, task: TaskName },

    /// A submitted world was rejected.
    #[error("invalid world: {0}")]
    Config(#[from] ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A transition was refused.
    #[error("transition error: {0}")]
    Transition(#[from] TransitionError),

    /// The request names an unsupported target state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Shutdown requested; waiting for attempts in flight.
    Draining,
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Jump to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut t) = self.now.lock() {
            *t = now;
        }
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut t) = self.now.lock() {
            *t += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|t| *t).unwrap_or_else(|_| Utc::now())
    }
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SchedulerError>>;

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Start a new run of a world.
    Submit {
        tag: String,
        world: World,
        response: Reply<RunId>,
    },
    /// Kill a run and every running task.
    KillRun { run_id: RunId, response: Reply<()> },
    /// Retry every errored or killed task of a run.
    RetryRun { run_id: RunId, response: Reply<()> },
    /// Kill one task.
    KillTask {
        run_id: RunId,
        task: TaskName,
        response: Reply<()>,
    },
    /// Retry one task.
    RetryTask {
        run_id: RunId,
        task: TaskName,
        response: Reply<()>,
    },
    /// Summaries of runs, optionally including terminal ones.
    ListRuns {
        all: bool,
        response: Reply<Vec<RunSummary>>,
    },
    /// Everything about one run.
    GetRun {
        run_id: RunId,
        response: Reply<RunDetail>,
    },
    /// Timeline data.
    Details {
        query: DetailsQuery,
        response: Reply<Vec<DetailsGroup>>,
    },
    /// Run one tick now.
    Tick { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
