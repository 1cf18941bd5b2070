//! Attempt execution.
//!
//! This module provides external command execution, the executor contract
//! the dispatcher claims capacity from, and its two topologies: an
//! in-process [`LocalExecutor`] and a [`WorkerPool`] of remote workers.

mod command;
mod executor;
mod local;
mod remote;
mod worker;

pub use command::{
    AttemptPlan, CommandError, CommandOutput, CommandRunner, ENV_WHITELIST, KillSignal, PlanReport,
};
pub use executor::{Claim, Executor, ExecutorError, OutcomeSender, WorkOrder, WorkOutcome};
pub use local::LocalExecutor;
pub use remote::{
    ClaimResponse, RegisterRequest, RegisterResponse, ReportRequest, WorkerPool, WorkerSummary,
};
pub use worker::{WorkerClient, WorkerConfig, WorkerError};
