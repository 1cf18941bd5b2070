//! World builder from YAML configuration.
//!
//! Converts a validated [`WorldConfig`] into an immutable [`World`] with
//! every task's schedule resolved.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::path::Path;

use super::error::ConfigError;
use super::yaml::{TaskConfig, WorldConfig, YamlLoader};
use crate::core::calendar::Calendar;
use crate::core::schedule::{Schedule, localize, parse_timezone};
use crate::core::task::Task;
use crate::core::types::{ResourceName, TaskName};
use crate::core::world::World;

/// Builder for creating Worlds from configuration.
pub struct WorldBuilder;

impl WorldBuilder {
    /// Build a World from a validated WorldConfig.
    pub fn build(config: &WorldConfig) -> Result<World, ConfigError> {
        let tasks = config
            .tasks
            .iter()
            .map(|(name, task)| Self::build_task(name, task, &config.calendars))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(World::new(
            config.variables.clone(),
            config.output_options.clone(),
            tasks,
        ))
    }

    fn build_task(
        name: &str,
        config: &TaskConfig,
        calendars: &BTreeMap<String, Calendar>,
    ) -> Result<Task, ConfigError> {
        let schedule_err = |source| ConfigError::Schedule {
            task: name.to_string(),
            source,
        };

        let calendar = calendars.get(&config.calendar).cloned().ok_or_else(|| {
            ConfigError::invalid(format!(
                "task '{}' refers to unknown calendar '{}'",
                name, config.calendar
            ))
        })?;
        let tz = parse_timezone(&config.timezone).map_err(schedule_err)?;
        let times = config
            .times
            .iter()
            .map(|t| parse_time_of_day(t).map_err(|e| in_task(name, e)))
            .collect::<Result<Vec<_>, _>>()?;
        let valid_from = parse_window_bound(&config.valid_from, tz).map_err(|e| in_task(name, e))?;
        let valid_to = config
            .valid_to
            .as_deref()
            .map(|s| parse_window_bound(s, tz).map_err(|e| in_task(name, e)))
            .transpose()?;

        let schedule =
            Schedule::new(calendar, times, tz, valid_from, valid_to).map_err(schedule_err)?;
        if schedule.first_instant().is_none() {
            return Err(ConfigError::invalid(format!(
                "task '{}' has no scheduled instants in its window",
                name
            )));
        }

        Ok(Task {
            name: TaskName::new(name),
            up: config.up.clone(),
            down: config.down.clone(),
            check: config.check.clone(),
            provides: config.provides.iter().map(ResourceName::new).collect(),
            requires: config.requires.clone(),
            schedule,
        })
    }
}

fn in_task(name: &str, err: ConfigError) -> ConfigError {
    match err {
        ConfigError::InvalidConfig(msg) => {
            ConfigError::InvalidConfig(format!("task '{}': {}", name, msg))
        }
        other => other,
    }
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| ConfigError::invalid(format!("invalid time of day: {}", s)))
}

/// Parse a local date or date-time.
pub fn parse_local_datetime(s: &str) -> Result<NaiveDateTime, ConfigError> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| ConfigError::invalid(format!("invalid date-time: {}", s)))
}

/// Parse a validity bound in `tz`. A bound inside a DST gap is rejected.
fn parse_window_bound(s: &str, tz: Tz) -> Result<DateTime<Utc>, ConfigError> {
    let local = parse_local_datetime(s)?;
    localize(tz, local).ok_or_else(|| {
        ConfigError::invalid(format!("{} does not exist in {}", s, tz.name()))
    })
}

/// Parse, validate and build a world from YAML or JSON text.
pub fn parse_world(yaml: &str) -> Result<World, ConfigError> {
    let config = YamlLoader::parse_world_config(yaml)?;
    WorldBuilder::build(&config)
}

/// Load, validate and build a world file.
pub fn load_world(path: impl AsRef<Path>) -> Result<World, ConfigError> {
    let config = YamlLoader::load_world_config(path)?;
    WorldBuilder::build(&config)
}
