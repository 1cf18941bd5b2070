//! Scheduler handle for controlling the engine.
//!
//! This module provides the `SchedulerHandle` type that allows external control
//! of the engine loop. Every command is answered after its effects are persisted.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::types::{RunId, TaskName};
use crate::core::world::World;

use super::types::{SchedulerCommand, SchedulerError, SchedulerState};
use super::views::{DetailsGroup, DetailsQuery, RunDetail, RunSummary};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?
    }

    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?;

        Ok(())
    }

    /// Start a new run of `world`.
    pub async fn submit(&self, tag: impl Into<String>, world: World) -> Result<RunId, SchedulerError> {
        let tag = tag.into();
        self.send_result_command(
            |response| SchedulerCommand::Submit {
                tag,
                world,
                response,
            },
            "submit",
        )
        .await
    }

    /// Kill a run.
    pub async fn kill_run(&self, run_id: RunId) -> Result<(), SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::KillRun { run_id, response },
            "kill run",
        )
        .await
    }

    /// Retry a run's errored and killed tasks.
    pub async fn retry_run(&self, run_id: RunId) -> Result<(), SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::RetryRun { run_id, response },
            "retry run",
        )
        .await
    }

    /// Kill one task.
    pub async fn kill_task(&self, run_id: RunId, task: TaskName) -> Result<(), SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::KillTask {
                run_id,
                task,
                response,
            },
            "kill task",
        )
        .await
    }

    /// Retry one task.
    pub async fn retry_task(&self, run_id: RunId, task: TaskName) -> Result<(), SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::RetryTask {
                run_id,
                task,
                response,
            },
            "retry task",
        )
        .await
    }

    /// Summaries of active runs, or of every run if `all`.
    pub async fn list_runs(&self, all: bool) -> Result<Vec<RunSummary>, SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::ListRuns { all, response },
            "list runs",
        )
        .await
    }

    /// Everything about one run.
    pub async fn get_run(&self, run_id: RunId) -> Result<RunDetail, SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::GetRun { run_id, response },
            "get run",
        )
        .await
    }

    /// Timeline data.
    pub async fn details(&self, query: DetailsQuery) -> Result<Vec<DetailsGroup>, SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::Details { query, response },
            "details",
        )
        .await
    }

    /// Run one tick immediately.
    pub async fn tick(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Tick { response }, "tick")
            .await
    }

    /// Shutdown the scheduler, waiting for attempts in flight up to the shutdown timeout.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }
}
