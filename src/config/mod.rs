//! Configuration loading and parsing.
//!
//! This module provides YAML-based world files and engine settings.

mod builder;
mod error;
mod yaml;

pub use builder::{WorldBuilder, load_world, parse_local_datetime, parse_time_of_day, parse_world};
pub use error::ConfigError;
pub use yaml::{
    EngineConfig, ExecutorConfig, ServerConfig, StorageConfig, TaskConfig, WorldConfig, YamlLoader,
};
