//! Task definitions.
//!
//! A task owns up to three commands: `up` produces the task's resources for
//! one interval, `check` verifies they exist without mutating anything, and
//! `down` tears them down before a forced re-run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::interval::Interval;
use super::resource::ResourceRequirements;
use super::schedule::Schedule;
use super::types::{ResourceName, TaskName};
use super::varmap::VarMap;

/// How a command is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    /// Run through `sh -c`.
    Shell(String),
    /// Program followed by its arguments, run directly.
    Argv(Vec<String>),
}

/// A command template and the capacity it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CommandSpecRepr")]
pub struct CommandSpec {
    pub command: CommandLine,
    pub environment: BTreeMap<String, String>,
    /// Seconds before the command is killed. `None` waits forever.
    pub timeout_secs: Option<u64>,
    pub resources: ResourceRequirements,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandSpecRepr {
    Short(CommandLine),
    Full {
        command: CommandLine,
        #[serde(default)]
        environment: BTreeMap<String, String>,
        #[serde(default, alias = "timeout")]
        timeout_secs: Option<u64>,
        #[serde(default)]
        resources: ResourceRequirements,
    },
}

impl From<CommandSpecRepr> for CommandSpec {
    fn from(repr: CommandSpecRepr) -> Self {
        match repr {
            CommandSpecRepr::Short(command) => CommandSpec::new(command),
            CommandSpecRepr::Full {
                command,
                environment,
                timeout_secs,
                resources,
            } => CommandSpec {
                command,
                environment,
                timeout_secs: timeout_secs.filter(|t| *t > 0),
                resources,
            },
        }
    }
}

impl CommandSpec {
    /// A command with default capacity and no timeout.
    pub fn new(command: CommandLine) -> Self {
        Self {
            command,
            environment: BTreeMap::new(),
            timeout_secs: None,
            resources: ResourceRequirements::default(),
        }
    }

    /// A `sh -c` command.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(CommandLine::Shell(script.into()))
    }

    /// Builder: set the core requirement.
    pub fn with_cores(mut self, cores: u32) -> Self {
        self.resources = ResourceRequirements::cores(cores);
        self
    }

    /// Builder: set the timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Builder: add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Substitute variables into the command and its environment.
    pub fn render(&self, vars: &VarMap) -> RenderedCommand {
        let argv = match &self.command {
            CommandLine::Shell(script) => vec![
                "sh".to_string(),
                "-c".to_string(),
                vars.apply_to(script),
            ],
            CommandLine::Argv(args) => args.iter().map(|a| vars.apply_to(a)).collect(),
        };
        let environment = self
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), vars.apply_to(v)))
            .collect();

        RenderedCommand {
            argv,
            environment,
            timeout_secs: self.timeout_secs,
        }
    }
}

/// A command ready to run: variables substituted, shell form expanded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedCommand {
    pub argv: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl RenderedCommand {
    /// The argv joined for display.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// A dependency on a resource, `offset` producer instants away.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    pub resource: ResourceName,
    #[serde(default)]
    pub offset: i64,
}

impl Requirement {
    /// Requirement on the interval aligned with the consumer's instant.
    pub fn new(resource: impl Into<ResourceName>) -> Self {
        Self {
            resource: resource.into(),
            offset: 0,
        }
    }

    /// Builder: set the offset.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// A task as the engine runs it, with its schedule resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: TaskName,
    pub up: Option<CommandSpec>,
    pub down: Option<CommandSpec>,
    pub check: Option<CommandSpec>,
    pub provides: BTreeSet<ResourceName>,
    pub requires: Vec<Requirement>,
    pub schedule: Schedule,
}

impl Task {
    /// The commands this task defines, in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &CommandSpec> {
        [self.down.as_ref(), self.check.as_ref(), self.up.as_ref()]
            .into_iter()
            .flatten()
    }

    /// Capacity needed to run any step of an attempt.
    pub fn requirements(&self) -> ResourceRequirements {
        self.steps()
            .map(|c| c.resources)
            .reduce(ResourceRequirements::max)
            .unwrap_or_default()
    }

    /// The interval an instance at `instant` produces.
    pub fn interval_for(&self, instant: DateTime<Utc>) -> Interval {
        self.schedule.interval_ending_at(instant)
    }
}
