//! tideline - a calendar-driven task engine with temporal resource dependencies.
//!
//! A *world* is a set of tasks, each with a calendar schedule, the resources
//! it provides and the resources it requires. Submitting a world starts a
//! *run*: every task is queued at its first scheduled instant and runs once
//! that instant has arrived and every resource it requires has been recorded
//! in the run's ledger over the matching interval.
//!
//! ```ignore
//! use std::sync::Arc;
//! use tideline::{LocalExecutor, InMemoryStorage, Scheduler, parse_world};
//!
//! let world = parse_world(&std::fs::read_to_string("world.yaml")?)?;
//! let mut scheduler = Scheduler::new(InMemoryStorage::new())
//!     .with_executor(Arc::new(LocalExecutor::new(4)));
//! scheduler.recover().await?;
//! let (handle, _task) = scheduler.start().await;
//! let run_id = handle.submit("nightly", world).await?;
//! ```

pub mod api;
pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod ledger;
pub mod run;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{
    ConfigError, EngineConfig, ExecutorConfig, StorageConfig, WorldBuilder, YamlLoader, load_world,
    parse_world,
};
pub use core::calendar::Calendar;
pub use core::interval::Interval;
pub use core::resource::{CoreBudget, ResourceRequirements};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::task::{CommandSpec, Requirement, Task};
pub use core::types::{OrderId, ResourceName, RunId, TaskName, WorkerId};
pub use core::world::{OutputOptions, World};
pub use events::{Event, EventBus, EventHandler, LoggingHandler};
pub use execution::{
    CommandRunner, Executor, ExecutorError, LocalExecutor, WorkerClient, WorkerConfig, WorkerPool,
};
pub use ledger::{OverlapError, ResourceLedger};
pub use run::{AttemptOutcome, DagRun, TaskAttempt, TaskState};
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle, SchedulerState};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{InMemoryStorage, Storage, StorageError};
