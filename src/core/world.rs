//! The resolved world a DagRun executes.
//!
//! A [`World`] is built once from a validated world file and never mutated
//! afterwards. Each DagRun owns its own copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::task::Task;
use super::types::{ResourceName, RunId, TaskName};
use super::varmap::VarMap;

fn default_true() -> bool {
    true
}

fn default_keep_bytes() -> usize {
    20480
}

/// How much command output an attempt keeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputOptions {
    /// Drop output of successful attempts entirely.
    #[serde(default)]
    pub discard_successful: bool,

    /// Keep only the head and tail of long output.
    #[serde(default = "default_true")]
    pub truncate: bool,

    #[serde(default = "default_keep_bytes")]
    pub head_bytes: usize,

    #[serde(default = "default_keep_bytes")]
    pub tail_bytes: usize,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            discard_successful: false,
            truncate: true,
            head_bytes: default_keep_bytes(),
            tail_bytes: default_keep_bytes(),
        }
    }
}

impl OutputOptions {
    /// Apply the retention policy to captured output.
    pub fn retain(&self, output: &str, succeeded: bool) -> String {
        if succeeded && self.discard_successful {
            String::new()
        } else if self.truncate {
            head_tail(output, self.head_bytes, self.tail_bytes)
        } else {
            output.to_string()
        }
    }
}

/// Keep the first `head` and last `tail` bytes of `s`, marking the cut.
pub fn head_tail(s: &str, head: usize, tail: usize) -> String {
    let bytes = s.as_bytes();
    if bytes.len() <= head.saturating_add(tail) {
        return s.to_string();
    }
    let omitted = bytes.len() - head - tail;
    format!(
        "{}\n...[{} bytes truncated]...\n{}",
        String::from_utf8_lossy(&bytes[..head]),
        omitted,
        String::from_utf8_lossy(&bytes[bytes.len() - tail..])
    )
}

/// Immutable definition of variables and tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    variables: BTreeMap<String, String>,
    output_options: OutputOptions,
    tasks: BTreeMap<TaskName, Task>,
    producers: BTreeMap<ResourceName, TaskName>,
}

impl World {
    /// Assemble a world from already-validated tasks.
    pub fn new(
        variables: BTreeMap<String, String>,
        output_options: OutputOptions,
        tasks: impl IntoIterator<Item = Task>,
    ) -> Self {
        let tasks: BTreeMap<TaskName, Task> =
            tasks.into_iter().map(|t| (t.name.clone(), t)).collect();
        let producers = tasks
            .values()
            .flat_map(|t| t.provides.iter().map(|r| (r.clone(), t.name.clone())))
            .collect();

        Self {
            variables,
            output_options,
            tasks,
            producers,
        }
    }

    /// World-level variables.
    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    /// Output retention policy.
    pub fn output_options(&self) -> &OutputOptions {
        &self.output_options
    }

    /// Look up a task by name.
    pub fn task(&self, name: &TaskName) -> Option<&Task> {
        self.tasks.get(name)
    }

    /// All tasks, ordered by name.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// All task names, ordered.
    pub fn task_names(&self) -> impl Iterator<Item = &TaskName> {
        self.tasks.keys()
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if the world has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The task that produces `resource`.
    pub fn producer_of(&self, resource: &ResourceName) -> Option<&Task> {
        self.producers.get(resource).and_then(|n| self.tasks.get(n))
    }

    /// Every resource and its producer.
    pub fn producers(&self) -> &BTreeMap<ResourceName, TaskName> {
        &self.producers
    }

    /// Variables for one task instance: computed time fields, then run
    /// identity, then world variables.
    pub fn vars_for(&self, task: &Task, instant: DateTime<Utc>, run_id: &RunId) -> VarMap {
        let interval = task.interval_for(instant);
        VarMap::from_interval(&interval, task.schedule.timezone())
            .with_var("RUN_ID", run_id.to_string())
            .with_var("TASK", task.name.as_str())
            .merge_missing(&self.variables)
    }
}
