//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::schedule::ScheduleError;

/// Errors that can occur when loading a world or engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to read a specific file with context.
    #[error("failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Failed to parse YAML from a specific file.
    #[error("YAML parse error in '{path}': {source}")]
    YamlFileError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Failed to interpret a JSON document as a world.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A task's schedule could not be built.
    #[error("task '{task}': {source}")]
    Schedule {
        task: String,
        #[source]
        source: ScheduleError,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

impl ConfigError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::InvalidConfig(msg.into())
    }
}
