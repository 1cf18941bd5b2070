//! Ready-made worlds and a task builder for tests.

use chrono::{DateTime, NaiveTime, TimeZone, Utc, Weekday};
use std::collections::BTreeMap;

use crate::core::calendar::Calendar;
use crate::core::schedule::{Schedule, parse_timezone};
use crate::core::task::{CommandSpec, Requirement, Task};
use crate::core::types::{ResourceName, TaskName};
use crate::core::world::{OutputOptions, World};

/// Monday 2022-01-03 00:00 UTC, the default start of every fixture window.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 1, 3, 0, 0, 0)
        .single()
        .expect("valid fixture date")
}

/// Builder for [`Task`] values with test-friendly defaults: weekdays,
/// 09:00 UTC, valid from [`epoch`], `up` is `true`.
pub struct TaskBuilder {
    name: String,
    up: Option<CommandSpec>,
    down: Option<CommandSpec>,
    check: Option<CommandSpec>,
    provides: Vec<String>,
    requires: Vec<Requirement>,
    calendar: Calendar,
    times: Vec<NaiveTime>,
    timezone: String,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: Some(CommandSpec::shell("true")),
            down: None,
            check: None,
            provides: Vec::new(),
            requires: Vec::new(),
            calendar: Calendar::new(),
            times: Vec::new(),
            timezone: "UTC".to_string(),
            valid_from: epoch(),
            valid_to: None,
        }
    }

    pub fn up(mut self, up: CommandSpec) -> Self {
        self.up = Some(up);
        self
    }

    pub fn down(mut self, down: CommandSpec) -> Self {
        self.down = Some(down);
        self
    }

    pub fn check(mut self, check: CommandSpec) -> Self {
        self.check = Some(check);
        self
    }

    pub fn provides(mut self, resource: impl Into<String>) -> Self {
        self.provides.push(resource.into());
        self
    }

    pub fn requires(mut self, resource: impl Into<String>, offset: i64) -> Self {
        self.requires
            .push(Requirement::new(resource.into()).with_offset(offset));
        self
    }

    pub fn calendar(mut self, calendar: Calendar) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn on(self, days: impl IntoIterator<Item = Weekday>) -> Self {
        self.calendar(Calendar::with_mask(days))
    }

    /// Add a time of day.
    pub fn at(mut self, hour: u32, minute: u32) -> Self {
        self.times
            .push(NaiveTime::from_hms_opt(hour, minute, 0).expect("valid fixture time"));
        self
    }

    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }

    pub fn valid_from(mut self, from: DateTime<Utc>) -> Self {
        self.valid_from = from;
        self
    }

    pub fn valid_to(mut self, to: DateTime<Utc>) -> Self {
        self.valid_to = Some(to);
        self
    }

    pub fn build(self) -> Task {
        let times = if self.times.is_empty() {
            vec![NaiveTime::from_hms_opt(9, 0, 0).expect("valid fixture time")]
        } else {
            self.times
        };
        let tz = parse_timezone(&self.timezone).expect("valid fixture timezone");
        let schedule = Schedule::new(self.calendar, times, tz, self.valid_from, self.valid_to)
            .expect("valid fixture schedule");

        Task {
            name: TaskName::new(self.name),
            up: self.up,
            down: self.down,
            check: self.check,
            provides: self.provides.into_iter().map(ResourceName::new).collect(),
            requires: self.requires,
            schedule,
        }
    }
}

/// A world with default variables and output options.
pub fn world(tasks: impl IntoIterator<Item = Task>) -> World {
    World::new(BTreeMap::new(), OutputOptions::default(), tasks)
}

/// `task_a` provides `alpha` at 09:00, `task_b` requires it at 10:00.
pub fn chain_world() -> World {
    world([
        TaskBuilder::new("task_a")
            .provides("alpha")
            .down(CommandSpec::shell("true"))
            .at(9, 0)
            .build(),
        TaskBuilder::new("task_b").requires("alpha", 0).at(10, 0).build(),
    ])
}

/// Three independent 1-core tasks due at 09:00.
pub fn three_task_world() -> World {
    world(["x", "y", "z"].map(|n| TaskBuilder::new(n).at(9, 0).build()))
}

/// A single task whose window holds exactly one instant, 2022-01-03 09:00 UTC.
pub fn single_instant_world() -> World {
    world([TaskBuilder::new("once")
        .at(9, 0)
        .valid_to(epoch() + chrono::Duration::days(1))
        .build()])
}

/// `task_a` runs weekdays 09:00 and 12:00 New York time providing `alpha`;
/// `task_b` runs Fridays 17:00 and requires `alpha`.
pub fn friday_world() -> World {
    world([
        TaskBuilder::new("task_a")
            .provides("alpha")
            .at(9, 0)
            .at(12, 0)
            .timezone("America/New_York")
            .build(),
        TaskBuilder::new("task_b")
            .requires("alpha", 0)
            .on([Weekday::Fri])
            .at(17, 0)
            .timezone("America/New_York")
            .build(),
    ])
}

/// YAML for [`chain_world`]'s shape, with shell commands.
pub const CHAIN_WORLD_YAML: &str = r#"
variables:
  ROOT: /tmp/tideline
calendars:
  weekdays:
    mask: [Mon, Tue, Wed, Thu, Fri]
tasks:
  task_a:
    up: "echo up ${yyyymmdd}"
    down: "echo down"
    provides: [alpha]
    calendar: weekdays
    times: ["09:00"]
    timezone: UTC
    valid_from: "2022-01-03T00:00:00"
  task_b:
    up: "echo consume ${ROOT}"
    requires:
      - resource: alpha
    calendar: weekdays
    times: ["10:00"]
    timezone: UTC
    valid_from: "2022-01-03T00:00:00"
"#;
