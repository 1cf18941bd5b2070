//! Core domain types: calendars, schedules, intervals, tasks and worlds.

pub mod calendar;
pub mod interval;
pub mod resource;
pub mod schedule;
pub mod task;
pub mod types;
pub mod varmap;
pub mod world;
