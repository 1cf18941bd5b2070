//! YAML configuration parsing.
//!
//! Parses world files and the engine configuration (`tideline.yaml`).
//! JSON documents are accepted as well since YAML is a superset.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use super::error::ConfigError;
use crate::core::calendar::Calendar;
use crate::core::task::{CommandSpec, Requirement};
use crate::core::world::OutputOptions;

/// A world file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorldConfig {
    /// Variables available to every command as `${NAME}`.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Named calendars tasks refer to.
    #[serde(default)]
    pub calendars: BTreeMap<String, Calendar>,
    /// Task definitions keyed by name.
    pub tasks: BTreeMap<String, TaskConfig>,
    /// Output retention for attempts.
    #[serde(default)]
    pub output_options: OutputOptions,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Produces the task's resources for one interval.
    #[serde(default)]
    pub up: Option<CommandSpec>,
    /// Tears down a previously produced interval before a forced re-run.
    #[serde(default)]
    pub down: Option<CommandSpec>,
    /// Verifies the resources exist without side effects.
    #[serde(default)]
    pub check: Option<CommandSpec>,
    #[serde(default)]
    pub provides: BTreeSet<String>,
    #[serde(default)]
    pub requires: Vec<Requirement>,
    /// Name of a calendar in the world's `calendars`.
    #[serde(alias = "calendar_name")]
    pub calendar: String,
    /// Times of day, `HH:MM` or `HH:MM:SS`.
    pub times: Vec<String>,
    /// IANA timezone name.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Local date-time in `timezone`, inclusive.
    pub valid_from: String,
    /// Local date-time in `timezone`, exclusive.
    #[serde(default)]
    pub valid_to: Option<String>,
}

/// Engine configuration (tideline.yaml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Run Store backend.
    pub storage: StorageConfig,
    /// Executors, tried in order at admission.
    pub executors: Vec<ExecutorConfig>,
    /// Milliseconds between dispatcher ticks.
    pub tick_interval_ms: u64,
    /// Seconds to wait for running attempts at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            executors: vec![ExecutorConfig::Local {
                cores: default_local_cores(),
            }],
            tick_interval_ms: 1000,
            shutdown_timeout_secs: 30,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8565,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

fn default_local_cores() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn default_heartbeat_timeout() -> u64 {
    30
}

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// In-process execution with a fixed core budget.
    Local {
        #[serde(default = "default_local_cores")]
        cores: u32,
    },
    /// Pull-based remote workers.
    Remote {
        #[serde(default = "default_heartbeat_timeout")]
        heartbeat_timeout_secs: u64,
    },
}

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load engine configuration from a file.
    pub fn load_engine_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
        let content = read(path.as_ref())?;
        Self::parse_engine_config(&content).map_err(|e| with_path(e, path.as_ref()))
    }

    /// Parse engine configuration from a YAML string.
    pub fn parse_engine_config(yaml: &str) -> Result<EngineConfig, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        if config.executors.is_empty() {
            return Err(ConfigError::invalid("at least one executor is required"));
        }
        if config.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("tick_interval_ms cannot be zero"));
        }
        Ok(config)
    }

    /// Load a world configuration from a file.
    pub fn load_world_config(path: impl AsRef<Path>) -> Result<WorldConfig, ConfigError> {
        let content = read(path.as_ref())?;
        Self::parse_world_config(&content).map_err(|e| with_path(e, path.as_ref()))
    }

    /// Parse and validate a world configuration from YAML or JSON.
    pub fn parse_world_config(yaml: &str) -> Result<WorldConfig, ConfigError> {
        let config: WorldConfig = serde_yaml::from_str(yaml)?;
        Self::validate_world_config(&config)?;
        Ok(config)
    }

    /// Interpret an already-parsed JSON value as a world.
    pub fn world_config_from_json(value: serde_json::Value) -> Result<WorldConfig, ConfigError> {
        let config: WorldConfig = serde_json::from_value(value)?;
        Self::validate_world_config(&config)?;
        Ok(config)
    }

    /// Validate the structure of a world: names, calendars and the
    /// resource graph. Schedules are checked when the world is built.
    pub fn validate_world_config(config: &WorldConfig) -> Result<(), ConfigError> {
        if config.tasks.is_empty() {
            return Err(ConfigError::invalid("world must have at least one task"));
        }

        let mut producers: HashMap<&str, &str> = HashMap::new();
        for (name, task) in &config.tasks {
            if name.is_empty() {
                return Err(ConfigError::MissingField("task name".into()));
            }
            if !config.calendars.contains_key(&task.calendar) {
                return Err(ConfigError::invalid(format!(
                    "task '{}' refers to unknown calendar '{}'",
                    name, task.calendar
                )));
            }
            if task.times.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "task '{}' has no times",
                    name
                )));
            }
            for resource in &task.provides {
                if let Some(other) = producers.insert(resource, name) {
                    return Err(ConfigError::invalid(format!(
                        "resource '{}' is provided by both '{}' and '{}'",
                        resource, other, name
                    )));
                }
            }
        }

        for (name, task) in &config.tasks {
            for req in &task.requires {
                let Some(producer) = producers.get(req.resource.as_str()) else {
                    return Err(ConfigError::invalid(format!(
                        "task '{}' requires '{}' which no task provides",
                        name, req.resource
                    )));
                };
                if *producer == name.as_str() && req.offset >= 0 {
                    return Err(ConfigError::invalid(format!(
                        "task '{}' requires its own resource '{}' at offset {}",
                        name, req.resource, req.offset
                    )));
                }
            }
        }

        Self::validate_no_cycles(config, &producers)
    }

    /// Reject cycles among requirement edges with a non-negative offset.
    /// Edges reaching back in time cannot deadlock and are ignored.
    fn validate_no_cycles(
        config: &WorldConfig,
        producers: &HashMap<&str, &str>,
    ) -> Result<(), ConfigError> {
        let mut in_degree: BTreeMap<&str, usize> =
            config.tasks.keys().map(|n| (n.as_str(), 0)).collect();
        let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, task) in &config.tasks {
            for req in task.requires.iter().filter(|r| r.offset >= 0) {
                if let Some(producer) = producers.get(req.resource.as_str()) {
                    downstream.entry(*producer).or_default().push(name);
                    if let Some(degree) = in_degree.get_mut(name.as_str()) {
                        *degree += 1;
                    }
                }
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut visited = 0;

        while let Some(name) = queue.pop_front() {
            visited += 1;
            for next in downstream.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }

        if visited != config.tasks.len() {
            let cycle: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(ConfigError::invalid(format!(
                "dependency cycle detected involving tasks: {}",
                cycle.join(", ")
            )));
        }
        Ok(())
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
        path: PathBuf::from(path),
        source,
    })
}

fn with_path(err: ConfigError, path: &Path) -> ConfigError {
    match err {
        ConfigError::YamlError(source) => ConfigError::YamlFileError {
            path: PathBuf::from(path),
            source,
        },
        other => other,
    }
}
