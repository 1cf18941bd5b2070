//! Run Store: persistence for DagRuns.
//!
//! Every run is stored as its header plus a JSON copy of its world, with
//! task entries upserted and attempts, ledger intervals and down records
//! appended. [`StoredRun::into_dag_run`] rebuilds the in-memory run.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite).

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core::types::{RunId, TaskName};
use crate::core::world::World;
use crate::ledger::{DownRecord, LedgerEntry, ResourceLedger};
use crate::run::{DagRun, RunHeader, TaskAttempt, TaskEntry};

/// Everything one applied attempt changes in a run.
#[derive(Debug, Clone, Copy)]
pub struct OutcomeRecord<'a> {
    pub header: &'a RunHeader,
    pub task: &'a TaskName,
    pub entry: &'a TaskEntry,
    pub attempt: &'a TaskAttempt,
    pub intervals: &'a [LedgerEntry],
    pub downs: &'a [DownRecord],
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Stored data could not be turned back into a run.
    #[error("corrupt run {run_id}: {reason}")]
    Corrupt { run_id: RunId, reason: String },

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::SerializationError(e.to_string())
    }
}

/// Everything persisted for one run.
#[derive(Debug, Clone)]
pub struct StoredRun {
    pub header: RunHeader,
    pub world: World,
    pub entries: BTreeMap<TaskName, TaskEntry>,
    /// Attempts in the order they were appended.
    pub attempts: Vec<(TaskName, TaskAttempt)>,
    pub intervals: Vec<LedgerEntry>,
    pub downs: Vec<DownRecord>,
}

impl StoredRun {
    /// Rebuild the run. Fails if the stored ledger overlaps itself.
    pub fn into_dag_run(self) -> Result<DagRun, StorageError> {
        let run_id = self.header.run_id.clone();
        let ledger = ResourceLedger::restore(self.intervals, self.downs).map_err(|e| {
            StorageError::Corrupt {
                run_id,
                reason: e.to_string(),
            }
        })?;
        Ok(DagRun::restore(
            self.header,
            Arc::new(self.world),
            self.entries,
            self.attempts,
            ledger,
        ))
    }
}

/// Storage trait for persisting runs.
#[async_trait]
pub trait Storage: Send + Sync {
    // Run operations

    /// Save a new run with its world.
    async fn create_run(&self, header: &RunHeader, world: &World) -> Result<(), StorageError>;

    /// Overwrite a run's header.
    async fn update_run(&self, header: &RunHeader) -> Result<(), StorageError>;

    /// Headers of every stored run, oldest first.
    async fn list_runs(&self) -> Result<Vec<RunHeader>, StorageError>;

    /// Load everything stored for a run.
    async fn load_run(&self, run_id: &RunId) -> Result<StoredRun, StorageError>;

    // Task operations

    /// Insert or replace a task entry.
    async fn save_task_entry(
        &self,
        run_id: &RunId,
        task: &TaskName,
        entry: &TaskEntry,
    ) -> Result<(), StorageError>;

    /// Append an attempt to a task's log.
    async fn append_attempt(
        &self,
        run_id: &RunId,
        task: &TaskName,
        attempt: &TaskAttempt,
    ) -> Result<(), StorageError>;

    // Ledger operations

    /// Append a recorded interval.
    async fn record_interval(&self, run_id: &RunId, entry: &LedgerEntry)
    -> Result<(), StorageError>;

    /// Append a down record.
    async fn record_down(&self, run_id: &RunId, down: &DownRecord) -> Result<(), StorageError>;

    /// Write an applied attempt as one unit: either every part is stored or none is.
    async fn record_outcome(&self, outcome: &OutcomeRecord<'_>) -> Result<(), StorageError>;
}

/// Write a run's header and every task entry.
pub async fn save_run_state(storage: &dyn Storage, run: &DagRun) -> Result<(), StorageError> {
    storage.update_run(run.header()).await?;
    for (name, entry) in run.entries() {
        storage.save_task_entry(run.run_id(), name, entry).await?;
    }
    Ok(())
}

/// Store a freshly created run in full.
pub async fn create_run(storage: &dyn Storage, run: &DagRun) -> Result<(), StorageError> {
    storage.create_run(run.header(), run.world()).await?;
    for (name, entry) in run.entries() {
        storage.save_task_entry(run.run_id(), name, entry).await?;
    }
    Ok(())
}

/// Load and rebuild every stored run.
pub async fn load_all_runs(storage: &dyn Storage) -> Result<Vec<DagRun>, StorageError> {
    let mut runs = Vec::new();
    for header in storage.list_runs().await? {
        let stored = storage.load_run(&header.run_id).await?;
        runs.push(stored.into_dag_run()?);
    }
    Ok(runs)
}
