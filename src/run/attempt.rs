//! Task attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Every step exited zero.
    Succeeded,
    /// A step failed: non-zero exit, timeout, spawn error or check disagreement.
    Failed,
    /// The attempt was killed on request.
    Killed,
    /// The attempt was lost: worker expired or the engine restarted.
    InfraFailure,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Killed => "killed",
            AttemptOutcome::InfraFailure => "infra_failure",
        };
        f.write_str(s)
    }
}

/// One execution of a task instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAttempt {
    /// Scheduled instant the attempt ran for.
    pub instant: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr after retention.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    /// Name of the executor that ran it.
    #[serde(default)]
    pub executor: String,
    /// Generation of the task entry when the attempt was launched.
    #[serde(default)]
    pub generation: u64,
    /// True if a `down` step ran and succeeded.
    #[serde(default)]
    pub down_completed: bool,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl TaskAttempt {
    /// Create an attempt with no output.
    pub fn new(
        instant: DateTime<Utc>,
        start_time: DateTime<Utc>,
        stop_time: DateTime<Utc>,
        outcome: AttemptOutcome,
    ) -> Self {
        Self {
            instant,
            start_time,
            stop_time,
            outcome,
            exit_code: None,
            output: String::new(),
            error: None,
            executor: String::new(),
            generation: 0,
            down_completed: false,
            notes: Vec::new(),
        }
    }

    /// An attempt lost to infrastructure, started and stopped at `at`.
    pub fn infra_failure(instant: DateTime<Utc>, at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self::new(instant, at, at, AttemptOutcome::InfraFailure).with_error(reason)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Wall time between start and stop.
    pub fn duration(&self) -> chrono::Duration {
        self.stop_time - self.start_time
    }
}
