//! Read-only views of runs, shaped for the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::interval::Interval;
use crate::core::task::Task;
use crate::core::types::{ResourceName, RunId, TaskName};
use crate::ledger::Blocker;
use crate::run::{DagRun, TaskAttempt, TaskCounts, TaskEntry, TaskState};

/// Intervals kept per label when a query gives no cap.
pub const DEFAULT_MAX_INTERVALS: usize = 500;

/// Group used for tasks that provide no resource.
pub const NO_RESOURCE_GROUP: &str = "-";

/// One line of `GET /v1/dagruns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    #[serde(rename = "runID")]
    pub run_id: RunId,
    pub tag: String,
    pub state: TaskState,
    pub progress: f64,
    pub task_counts: TaskCounts,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl RunSummary {
    pub fn of(run: &DagRun) -> Self {
        Self {
            run_id: run.run_id().clone(),
            tag: run.tag().to_string(),
            state: run.state(),
            progress: run.progress(),
            task_counts: run.task_counts(),
            start_time: run.created_at(),
            last_update: run.last_update(),
        }
    }
}

/// Where a task stands on its schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstants {
    pub current: DateTime<Utc>,
    pub interval: Interval,
    pub next: Option<DateTime<Utc>>,
}

/// Body of `GET /v1/dagrun/{runID}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    #[serde(flatten)]
    pub summary: RunSummary,
    pub tasks: BTreeMap<TaskName, Task>,
    pub task_states: BTreeMap<TaskName, TaskEntry>,
    pub task_attempts: BTreeMap<TaskName, Vec<TaskAttempt>>,
    pub task_instants: BTreeMap<TaskName, TaskInstants>,
    pub blocked_on: BTreeMap<TaskName, Vec<Blocker>>,
    pub ledger: BTreeMap<ResourceName, Vec<Interval>>,
}

impl RunDetail {
    pub fn of(run: &DagRun, now: DateTime<Utc>) -> Self {
        let tasks: BTreeMap<TaskName, Task> = run
            .world()
            .tasks()
            .map(|t| (t.name.clone(), t.clone()))
            .collect();

        let task_instants = run
            .entries()
            .iter()
            .filter_map(|(name, entry)| {
                let task = tasks.get(name)?;
                Some((
                    name.clone(),
                    TaskInstants {
                        current: entry.instant,
                        interval: task.interval_for(entry.instant),
                        next: run.next_instant(name),
                    },
                ))
            })
            .collect();

        let ledger = run
            .ledger()
            .resources()
            .map(|r| {
                let intervals = run.ledger().intervals(r).iter().map(|e| e.interval).collect();
                (r.clone(), intervals)
            })
            .collect();

        Self {
            summary: RunSummary::of(run),
            tasks,
            task_states: run.entries().clone(),
            task_attempts: run.all_attempts().clone(),
            task_instants,
            blocked_on: run.blocked_on(now),
            ledger,
        }
    }
}

/// Body of `POST /v1/details`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailsQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub max_intervals: Option<usize>,
    #[serde(rename = "runID", default)]
    pub run_id: Option<RunId>,
}

/// One bar on the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineInterval {
    pub time_range: [DateTime<Utc>; 2],
    pub val: TaskState,
}

/// One row of the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsLabel {
    pub label: String,
    pub data: Vec<TimelineInterval>,
}

/// Rows grouped by resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsGroup {
    pub group: String,
    pub data: Vec<DetailsLabel>,
}

/// Build timeline groups for `runs` over the query window.
///
/// Recorded ledger intervals show as COMPLETED. A task that is not
/// completed also shows its current interval in its current state.
pub fn details<'a>(
    runs: impl IntoIterator<Item = &'a DagRun>,
    query: &DetailsQuery,
) -> Vec<DetailsGroup> {
    let runs: Vec<&DagRun> = runs
        .into_iter()
        .filter(|r| query.run_id.as_ref().is_none_or(|id| r.run_id() == id))
        .collect();
    let prefix = runs.len() > 1;
    let window = Interval::new(query.start, query.end);
    let max = query.max_intervals.unwrap_or(DEFAULT_MAX_INTERVALS);

    let mut groups: BTreeMap<String, Vec<DetailsLabel>> = BTreeMap::new();
    for run in runs {
        for task in run.world().tasks() {
            let label = if prefix {
                format!("{}/{}", run.tag(), task.name)
            } else {
                task.name.to_string()
            };
            let current = run
                .entry(&task.name)
                .filter(|e| e.state != TaskState::Completed)
                .map(|e| (task.interval_for(e.instant), e.state));

            if task.provides.is_empty() {
                let mut spans: Vec<(Interval, TaskState)> = run
                    .attempts(&task.name)
                    .iter()
                    .filter(|a| a.outcome.is_success())
                    .map(|a| (task.interval_for(a.instant), TaskState::Completed))
                    .collect();
                spans.dedup();
                spans.extend(current);
                push_label(&mut groups, NO_RESOURCE_GROUP, &label, spans, window, max);
            } else {
                for resource in &task.provides {
                    let mut spans: Vec<(Interval, TaskState)> = run
                        .ledger()
                        .intervals(resource)
                        .iter()
                        .filter(|e| e.producer == task.name)
                        .map(|e| (e.interval, TaskState::Completed))
                        .collect();
                    spans.extend(current);
                    push_label(&mut groups, resource.as_str(), &label, spans, window, max);
                }
            }
        }
    }

    groups
        .into_iter()
        .map(|(group, data)| DetailsGroup { group, data })
        .collect()
}

fn push_label(
    groups: &mut BTreeMap<String, Vec<DetailsLabel>>,
    group: &str,
    label: &str,
    mut spans: Vec<(Interval, TaskState)>,
    window: Interval,
    max: usize,
) {
    spans.retain(|(i, _)| i.overlaps(&window) || window.contains(i.end));
    if spans.is_empty() {
        return;
    }
    spans.sort_by_key(|(i, _)| (i.end, i.start));
    let skip = spans.len().saturating_sub(max);
    let data = spans
        .into_iter()
        .skip(skip)
        .map(|(i, val)| TimelineInterval {
            time_range: [i.start, i.end],
            val,
        })
        .collect();
    groups
        .entry(group.to_string())
        .or_default()
        .push(DetailsLabel {
            label: label.to_string(),
            data,
        });
}
