//! Scheduled instant generation.
//!
//! A [`Schedule`] crosses the dates a [`Calendar`] includes with a list of
//! times of day, localizes each pair in the task's timezone and keeps the
//! instants that fall inside the validity window `[valid_from, valid_to)`.
//!
//! Daylight-saving transitions are resolved the same way everywhere:
//! an ambiguous local time (fall-back) maps to the later of its two UTC
//! instants, and a local time inside a spring-forward gap is skipped.

use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use super::calendar::Calendar;
use super::interval::Interval;

/// Errors that can occur when building a schedule.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// No times of day were given.
    #[error("schedule has no times of day")]
    NoTimes,

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The calendar never includes any date.
    #[error("calendar never includes any date")]
    EmptyCalendar,

    /// `valid_from` is not before `valid_to`.
    #[error("valid_from {from} is not before valid_to {to}")]
    InvalidWindow {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Localize a wall-clock time in `tz`.
///
/// Ambiguous times resolve to the later instant; times inside a gap yield `None`.
pub fn localize(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(a, b) => Some(a.max(b).with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// The ordered instants at which a task is due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    calendar: Calendar,
    times: Vec<NaiveTime>,
    timezone: Tz,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Create a schedule. Times are sorted and deduplicated.
    pub fn new(
        calendar: Calendar,
        times: impl IntoIterator<Item = NaiveTime>,
        timezone: Tz,
        valid_from: DateTime<Utc>,
        valid_to: Option<DateTime<Utc>>,
    ) -> Result<Self, ScheduleError> {
        let mut times: Vec<NaiveTime> = times.into_iter().collect();
        times.sort();
        times.dedup();

        if times.is_empty() {
            return Err(ScheduleError::NoTimes);
        }
        if !calendar.is_satisfiable() {
            return Err(ScheduleError::EmptyCalendar);
        }
        if let Some(to) = valid_to {
            if valid_from >= to {
                return Err(ScheduleError::InvalidWindow {
                    from: valid_from,
                    to,
                });
            }
        }

        Ok(Self {
            calendar,
            times,
            timezone,
            valid_from,
            valid_to,
        })
    }

    /// The calendar this schedule follows.
    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    /// Sorted, deduplicated times of day.
    pub fn times(&self) -> &[NaiveTime] {
        &self.times
    }

    /// Timezone used to localize times of day.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Inclusive start of the validity window.
    pub fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    /// Exclusive end of the validity window, if bounded.
    pub fn valid_to(&self) -> Option<DateTime<Utc>> {
        self.valid_to
    }

    /// True if `t` lies inside `[valid_from, valid_to)`.
    pub fn in_window(&self, t: DateTime<Utc>) -> bool {
        t >= self.valid_from && self.valid_to.is_none_or(|to| t < to)
    }

    fn localize(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        localize(self.timezone, date.and_time(time))
    }

    /// All in-window instants on a single local date, ascending.
    fn instants_on(&self, date: NaiveDate) -> Vec<DateTime<Utc>> {
        if !self.calendar.includes(date) {
            return Vec::new();
        }
        let mut instants: Vec<_> = self
            .times
            .iter()
            .filter_map(|time| self.localize(date, *time))
            .filter(|t| self.in_window(*t))
            .collect();
        instants.sort();
        instants
    }

    fn local_date(&self, t: DateTime<Utc>) -> NaiveDate {
        t.with_timezone(&self.timezone).date_naive()
    }

    /// Lazily iterate over instants strictly after `after`.
    pub fn instants_after(&self, after: DateTime<Utc>) -> Instants<'_> {
        let start = after.max(self.valid_from);
        let first = self.local_date(start).pred_opt().and_then(|d| {
            if self.calendar.includes(d) {
                Some(d)
            } else {
                self.calendar.next(d)
            }
        });
        let last = self
            .valid_to
            .and_then(|to| self.local_date(to).succ_opt());

        Instants {
            schedule: self,
            after: Some(after),
            date: first,
            last,
            pending: VecDeque::new(),
        }
    }

    /// Iterate over every instant in the validity window.
    pub fn instants(&self) -> Instants<'_> {
        let mut iter = self.instants_after(self.valid_from);
        iter.after = None;
        iter
    }

    /// The next `limit` instants strictly after `after`.
    pub fn next_instants(&self, after: DateTime<Utc>, limit: usize) -> Vec<DateTime<Utc>> {
        self.instants_after(after).take(limit).collect()
    }

    /// Instants in `(start, end]`.
    pub fn instants_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        self.instants_after(start)
            .take_while(|t| *t <= end)
            .collect()
    }

    /// The earliest instant in the window.
    pub fn first_instant(&self) -> Option<DateTime<Utc>> {
        self.instants().next()
    }

    /// The latest instant strictly before `t`.
    pub fn previous_instant(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.last_before(t, false)
    }

    /// The latest instant at or before `t`.
    pub fn latest_at_or_before(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.last_before(t, true)
    }

    fn last_before(&self, bound: DateTime<Utc>, inclusive: bool) -> Option<DateTime<Utc>> {
        if bound < self.valid_from {
            return None;
        }
        let bound_date = match self.valid_to {
            Some(to) if to < bound => self.local_date(to),
            _ => self.local_date(bound),
        };
        let floor = self.local_date(self.valid_from).pred_opt()?;

        let mut date = bound_date.succ_opt()?;
        if !self.calendar.includes(date) {
            date = self.calendar.prev(date)?;
        }
        while date >= floor {
            let best = self
                .instants_on(date)
                .into_iter()
                .filter(|t| *t < bound || (inclusive && *t == bound))
                .max();
            if best.is_some() {
                return best;
            }
            date = self.calendar.prev(date)?;
        }
        None
    }

    /// True if `t` is one of this schedule's instants.
    pub fn is_instant(&self, t: DateTime<Utc>) -> bool {
        self.latest_at_or_before(t) == Some(t)
    }

    /// Move `n` instants along the schedule from `instant`.
    ///
    /// Negative values move earlier. Returns `None` when the walk leaves the
    /// validity window.
    pub fn shift(&self, instant: DateTime<Utc>, n: i64) -> Option<DateTime<Utc>> {
        if n >= 0 {
            if n == 0 {
                return Some(instant);
            }
            self.instants_after(instant).nth((n - 1) as usize)
        } else {
            let mut current = instant;
            for _ in 0..n.unsigned_abs() {
                current = self.previous_instant(current)?;
            }
            Some(current)
        }
    }

    /// The interval an instant closes: `(previous instant or epoch, instant]`.
    pub fn interval_ending_at(&self, instant: DateTime<Utc>) -> Interval {
        let start = self
            .previous_instant(instant)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Interval::new(start, instant)
    }
}

/// Lazy iterator over a schedule's instants.
pub struct Instants<'a> {
    schedule: &'a Schedule,
    after: Option<DateTime<Utc>>,
    date: Option<NaiveDate>,
    last: Option<NaiveDate>,
    pending: VecDeque<DateTime<Utc>>,
}

impl Iterator for Instants<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(t) = self.pending.pop_front() {
                return Some(t);
            }

            let date = self.date?;
            if self.last.is_some_and(|last| date > last) {
                self.date = None;
                return None;
            }

            let after = self.after;
            self.pending.extend(
                self.schedule
                    .instants_on(date)
                    .into_iter()
                    .filter(|t| after.is_none_or(|a| *t > a)),
            );
            self.date = self.schedule.calendar.next(date);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn new_york() -> Tz {
        parse_timezone("America/New_York").unwrap()
    }

    fn weekday_schedule() -> Schedule {
        Schedule::new(
            Calendar::new(),
            [hm(12, 0), hm(9, 0)],
            new_york(),
            utc(2022, 1, 1, 0, 0),
            Some(utc(2022, 2, 1, 0, 0)),
        )
        .unwrap()
    }

    #[test]
    fn test_times_sorted_and_deduplicated() {
        let schedule = Schedule::new(
            Calendar::new(),
            [hm(12, 0), hm(9, 0), hm(12, 0)],
            Tz::UTC,
            utc(2022, 1, 1, 0, 0),
            None,
        )
        .unwrap();
        assert_eq!(schedule.times(), &[hm(9, 0), hm(12, 0)]);
    }

    #[test]
    fn test_rejects_empty_times() {
        let result = Schedule::new(Calendar::new(), [], Tz::UTC, utc(2022, 1, 1, 0, 0), None);
        assert!(matches!(result, Err(ScheduleError::NoTimes)));
    }

    #[test]
    fn test_rejects_inverted_window() {
        let result = Schedule::new(
            Calendar::new(),
            [hm(9, 0)],
            Tz::UTC,
            utc(2022, 2, 1, 0, 0),
            Some(utc(2022, 1, 1, 0, 0)),
        );
        assert!(matches!(result, Err(ScheduleError::InvalidWindow { .. })));
    }

    #[test]
    fn test_rejects_unknown_timezone() {
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_first_instants_skip_weekend() {
        let schedule = weekday_schedule();
        // 2022-01-01 is a Saturday; Monday 09:00 EST is 14:00 UTC
        let instants = schedule.next_instants(utc(2022, 1, 1, 0, 0), 3);
        assert_eq!(
            instants,
            vec![
                utc(2022, 1, 3, 14, 0),
                utc(2022, 1, 3, 17, 0),
                utc(2022, 1, 4, 14, 0),
            ]
        );
        assert_eq!(schedule.first_instant(), Some(utc(2022, 1, 3, 14, 0)));
    }

    #[test]
    fn test_next_instants_are_strictly_after() {
        let schedule = weekday_schedule();
        let instants = schedule.next_instants(utc(2022, 1, 3, 14, 0), 1);
        assert_eq!(instants, vec![utc(2022, 1, 3, 17, 0)]);
    }

    #[test]
    fn test_exhausted_window_is_empty() {
        let schedule = weekday_schedule();
        assert!(schedule.next_instants(utc(2022, 3, 1, 0, 0), 5).is_empty());
        // Last weekday in January 2022 is Monday the 31st
        let last = schedule.instants().last().unwrap();
        assert_eq!(last, utc(2022, 1, 31, 17, 0));
    }

    #[test]
    fn test_window_is_inclusive_exclusive() {
        let schedule = Schedule::new(
            Calendar::new(),
            [hm(9, 0)],
            Tz::UTC,
            utc(2022, 1, 3, 9, 0),
            Some(utc(2022, 1, 5, 9, 0)),
        )
        .unwrap();
        let all: Vec<_> = schedule.instants().collect();
        assert_eq!(all, vec![utc(2022, 1, 3, 9, 0), utc(2022, 1, 4, 9, 0)]);
    }

    #[test]
    fn test_previous_and_latest() {
        let schedule = weekday_schedule();
        let mon_morning = utc(2022, 1, 3, 14, 0);
        let fri_noon = utc(2022, 1, 7, 17, 0);

        assert_eq!(schedule.previous_instant(mon_morning), None);
        assert_eq!(schedule.latest_at_or_before(mon_morning), Some(mon_morning));
        assert_eq!(
            schedule.previous_instant(utc(2022, 1, 10, 14, 0)),
            Some(fri_noon)
        );
        assert_eq!(
            schedule.latest_at_or_before(utc(2022, 1, 8, 12, 0)),
            Some(fri_noon)
        );
        assert!(schedule.is_instant(fri_noon));
        assert!(!schedule.is_instant(utc(2022, 1, 7, 18, 0)));
    }

    #[test]
    fn test_latest_after_window_end_clamps() {
        let schedule = weekday_schedule();
        assert_eq!(
            schedule.latest_at_or_before(utc(2023, 1, 1, 0, 0)),
            Some(utc(2022, 1, 31, 17, 0))
        );
    }

    #[test]
    fn test_interval_ending_at() {
        let schedule = weekday_schedule();
        let first = schedule.interval_ending_at(utc(2022, 1, 3, 14, 0));
        assert_eq!(first.start, DateTime::<Utc>::UNIX_EPOCH);

        let second = schedule.interval_ending_at(utc(2022, 1, 3, 17, 0));
        assert_eq!(second.start, utc(2022, 1, 3, 14, 0));
        assert_eq!(second.end, utc(2022, 1, 3, 17, 0));
    }

    #[test]
    fn test_shift() {
        let schedule = weekday_schedule();
        let fri_noon = utc(2022, 1, 7, 17, 0);
        assert_eq!(schedule.shift(fri_noon, 0), Some(fri_noon));
        assert_eq!(schedule.shift(fri_noon, -1), Some(utc(2022, 1, 7, 14, 0)));
        assert_eq!(schedule.shift(fri_noon, 1), Some(utc(2022, 1, 10, 14, 0)));
        assert_eq!(schedule.shift(utc(2022, 1, 3, 14, 0), -1), None);
    }

    #[test]
    fn test_instants_between() {
        let schedule = weekday_schedule();
        let between = schedule.instants_between(utc(2022, 1, 3, 14, 0), utc(2022, 1, 4, 14, 0));
        assert_eq!(between, vec![utc(2022, 1, 3, 17, 0), utc(2022, 1, 4, 14, 0)]);
    }

    #[test]
    fn test_fall_back_ambiguous_time_uses_later_instant() {
        let schedule = Schedule::new(
            Calendar::with_mask([Weekday::Sun]),
            [hm(1, 30)],
            new_york(),
            utc(2022, 11, 1, 0, 0),
            Some(utc(2022, 11, 8, 0, 0)),
        )
        .unwrap();
        // 01:30 happens twice on 2022-11-06: 05:30Z (EDT) and 06:30Z (EST)
        assert_eq!(schedule.first_instant(), Some(utc(2022, 11, 6, 6, 30)));
    }

    #[test]
    fn test_spring_forward_gap_is_skipped() {
        let schedule = Schedule::new(
            Calendar::with_mask([Weekday::Sun]),
            [hm(2, 30), hm(3, 30)],
            new_york(),
            utc(2022, 3, 12, 0, 0),
            Some(utc(2022, 3, 14, 0, 0)),
        )
        .unwrap();
        // 02:30 does not exist on 2022-03-13; 03:30 EDT is 07:30Z
        let all: Vec<_> = schedule.instants().collect();
        assert_eq!(all, vec![utc(2022, 3, 13, 7, 30)]);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = weekday_schedule();
        let b = weekday_schedule();
        let after = utc(2022, 1, 5, 0, 0);
        assert_eq!(a.next_instants(after, 20), b.next_instants(after, 20));
    }

    #[test]
    fn test_serde_round_trip_preserves_instants() {
        let schedule = weekday_schedule();
        let json = serde_json::to_string(&schedule).unwrap();
        let restored: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(
            schedule.next_instants(utc(2022, 1, 1, 0, 0), 10),
            restored.next_instants(utc(2022, 1, 1, 0, 0), 10)
        );
    }
}
