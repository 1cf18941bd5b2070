//! Scheduler engine for world runs.
//!
//! This module provides the main loop that owns every run, admits ready
//! tasks against executor capacity, and answers commands from handles.

mod engine;
mod handle;
mod types;
mod views;

pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use types::{Clock, ManualClock, SchedulerError, SchedulerState, SystemClock};
pub use views::{
    DEFAULT_MAX_INTERVALS, DetailsGroup, DetailsLabel, DetailsQuery, NO_RESOURCE_GROUP, RunDetail,
    RunSummary, TaskInstants, TimelineInterval, details,
};
