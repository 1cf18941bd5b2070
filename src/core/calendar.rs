//! Calendars restrict which dates a task's times of day apply to.
//!
//! A calendar is a weekday mask with explicit date overrides. Exclusions
//! always win, then explicit inclusions, then the mask.

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Upper bound on consecutive days scanned when searching for an included date.
///
/// Keeps include-only calendars from looping forever once their dates run out.
pub const MAX_SCAN_DAYS: u64 = 3660;

/// The default weekday mask: Monday through Friday.
pub fn weekdays() -> HashSet<Weekday> {
    use Weekday::*;
    HashSet::from([Mon, Tue, Wed, Thu, Fri])
}

/// A weekday mask plus include/exclude date sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Calendar {
    /// Weekdays on which the calendar is active.
    #[serde(default = "weekdays")]
    pub mask: HashSet<Weekday>,

    /// Dates that are active regardless of the mask.
    #[serde(default)]
    pub include: BTreeSet<NaiveDate>,

    /// Dates that are never active.
    #[serde(default)]
    pub exclude: BTreeSet<NaiveDate>,
}

impl Default for Calendar {
    fn default() -> Self {
        Self {
            mask: weekdays(),
            include: BTreeSet::new(),
            exclude: BTreeSet::new(),
        }
    }
}

impl Calendar {
    /// Create a Monday-to-Friday calendar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a calendar active on exactly the given weekdays.
    pub fn with_mask(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self {
            mask: days.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Builder: always include a date.
    pub fn including(mut self, date: NaiveDate) -> Self {
        self.include.insert(date);
        self
    }

    /// Builder: never include a date.
    pub fn excluding(mut self, date: NaiveDate) -> Self {
        self.exclude.insert(date);
        self
    }

    /// True if the calendar can ever be active.
    pub fn is_satisfiable(&self) -> bool {
        !self.mask.is_empty() || self.include.iter().any(|d| !self.exclude.contains(d))
    }

    /// True if `date` is an active date.
    pub fn includes(&self, date: NaiveDate) -> bool {
        if self.exclude.contains(&date) {
            false
        } else if self.include.contains(&date) {
            true
        } else {
            self.mask.contains(&date.weekday())
        }
    }

    /// The first active date strictly after `date`.
    pub fn next(&self, date: NaiveDate) -> Option<NaiveDate> {
        self.offset(date, 1)
    }

    /// The last active date strictly before `date`.
    pub fn prev(&self, date: NaiveDate) -> Option<NaiveDate> {
        self.offset(date, -1)
    }

    /// Move `n` active dates away from `date`.
    ///
    /// Returns `None` when no active date is found within [`MAX_SCAN_DAYS`]
    /// of the previous one, or when the date range overflows.
    pub fn offset(&self, mut date: NaiveDate, n: i64) -> Option<NaiveDate> {
        let forward = n >= 0;
        for _ in 0..n.unsigned_abs() {
            let mut scanned = 0;
            loop {
                date = if forward {
                    date.checked_add_days(Days::new(1))?
                } else {
                    date.checked_sub_days(Days::new(1))?
                };
                if self.includes(date) {
                    break;
                }
                scanned += 1;
                if scanned >= MAX_SCAN_DAYS {
                    return None;
                }
            }
        }
        Some(date)
    }
}
