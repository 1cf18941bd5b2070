//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{OutcomeRecord, Storage, StorageError, StoredRun};
use crate::core::types::{RunId, TaskName};
use crate::core::world::World;
use crate::ledger::{DownRecord, LedgerEntry};
use crate::run::{RunHeader, TaskAttempt, TaskEntry};

struct RunRecord {
    header: RunHeader,
    /// Serialized, so a load never shares state with the engine's copy.
    world: String,
    entries: BTreeMap<TaskName, TaskEntry>,
    attempts: Vec<(TaskName, TaskAttempt)>,
    intervals: Vec<LedgerEntry>,
    downs: Vec<DownRecord>,
}

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    runs: RwLock<HashMap<RunId, RunRecord>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    fn with_run<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut RunRecord) -> T,
    ) -> Result<T, StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        let record = runs
            .get_mut(run_id)
            .ok_or_else(|| StorageError::NotFound(format!("run: {}", run_id)))?;
        Ok(f(record))
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_run(&self, header: &RunHeader, world: &World) -> Result<(), StorageError> {
        let world = serde_json::to_string(world)?;
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        if runs.contains_key(&header.run_id) {
            return Err(StorageError::DuplicateKey(format!("run: {}", header.run_id)));
        }
        runs.insert(
            header.run_id.clone(),
            RunRecord {
                header: header.clone(),
                world,
                entries: BTreeMap::new(),
                attempts: Vec::new(),
                intervals: Vec::new(),
                downs: Vec::new(),
            },
        );
        Ok(())
    }

    async fn update_run(&self, header: &RunHeader) -> Result<(), StorageError> {
        self.with_run(&header.run_id, |r| r.header = header.clone())
    }

    async fn list_runs(&self) -> Result<Vec<RunHeader>, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = runs.values().map(|r| r.header.clone()).collect();
        result.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(result)
    }

    async fn load_run(&self, run_id: &RunId) -> Result<StoredRun, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        let record = runs
            .get(run_id)
            .ok_or_else(|| StorageError::NotFound(format!("run: {}", run_id)))?;
        Ok(StoredRun {
            header: record.header.clone(),
            world: serde_json::from_str(&record.world)?,
            entries: record.entries.clone(),
            attempts: record.attempts.clone(),
            intervals: record.intervals.clone(),
            downs: record.downs.clone(),
        })
    }

    async fn save_task_entry(
        &self,
        run_id: &RunId,
        task: &TaskName,
        entry: &TaskEntry,
    ) -> Result<(), StorageError> {
        self.with_run(run_id, |r| {
            r.entries.insert(task.clone(), entry.clone());
        })
    }

    async fn append_attempt(
        &self,
        run_id: &RunId,
        task: &TaskName,
        attempt: &TaskAttempt,
    ) -> Result<(), StorageError> {
        self.with_run(run_id, |r| r.attempts.push((task.clone(), attempt.clone())))
    }

    async fn record_interval(
        &self,
        run_id: &RunId,
        entry: &LedgerEntry,
    ) -> Result<(), StorageError> {
        self.with_run(run_id, |r| r.intervals.push(entry.clone()))
    }

    async fn record_down(&self, run_id: &RunId, down: &DownRecord) -> Result<(), StorageError> {
        self.with_run(run_id, |r| r.downs.push(down.clone()))
    }

    async fn record_outcome(&self, outcome: &OutcomeRecord<'_>) -> Result<(), StorageError> {
        self.with_run(&outcome.header.run_id, |r| {
            r.header = outcome.header.clone();
            r.entries.insert(outcome.task.clone(), outcome.entry.clone());
            r.attempts
                .push((outcome.task.clone(), outcome.attempt.clone()));
            r.intervals.extend(outcome.intervals.iter().cloned());
            r.downs.extend(outcome.downs.iter().cloned());
        })
    }
}
