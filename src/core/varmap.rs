//! `${VAR}` substitution for command templates.
//!
//! World variables are merged with fields computed from the interval a
//! task instance closes, so commands can refer to `${yyyymmdd}` and friends.

use chrono::{Datelike, Timelike};
use chrono_tz::Tz;
use std::collections::BTreeMap;

use super::interval::Interval;

/// Variables available to a command at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarMap(BTreeMap<String, String>);

impl VarMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Time fields derived from an interval, rendered in `tz`.
    ///
    /// Date and time fields describe the interval's end, which is the
    /// scheduled instant that owns it.
    pub fn from_interval(interval: &Interval, tz: Tz) -> Self {
        let start = interval.start.with_timezone(&tz);
        let end = interval.end.with_timezone(&tz);

        let mut vars = BTreeMap::new();
        vars.insert("PERIOD_START".to_string(), start.to_rfc3339());
        vars.insert("PERIOD_END".to_string(), end.to_rfc3339());
        vars.insert("yyyy".to_string(), format!("{:04}", end.year()));
        vars.insert("mm".to_string(), format!("{:02}", end.month()));
        vars.insert("dd".to_string(), format!("{:02}", end.day()));
        vars.insert(
            "yyyymmdd".to_string(),
            format!("{:04}{:02}{:02}", end.year(), end.month(), end.day()),
        );
        vars.insert(
            "hhmmss".to_string(),
            format!("{:02}{:02}{:02}", end.hour(), end.minute(), end.second()),
        );
        Self(vars)
    }

    /// Builder: set a variable.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Merge `other` into this map. Existing keys keep their value.
    pub fn merge_missing(mut self, other: &BTreeMap<String, String>) -> Self {
        for (k, v) in other {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Replace every `${name}` with its value. Unknown names are left verbatim.
    pub fn apply_to(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(open) = rest.find("${") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            match after.find('}') {
                Some(close) => {
                    let name = &after[..close];
                    match self.0.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("${");
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl From<BTreeMap<String, String>> for VarMap {
    fn from(vars: BTreeMap<String, String>) -> Self {
        Self(vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    #[test]
    fn test_simple_apply() {
        let vm = VarMap::new().with_var("test", "alpha");
        assert_eq!(
            vm.apply_to("This is a ${test} of home and ${test} of away ${beep}"),
            "This is a alpha of home and alpha of away ${beep}"
        );
    }

    #[test]
    fn test_unterminated_reference_is_kept() {
        let vm = VarMap::new().with_var("a", "1");
        assert_eq!(vm.apply_to("x ${a} ${b"), "x 1 ${b");
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let vm = VarMap::new().with_var("a", "${b}").with_var("b", "no");
        assert_eq!(vm.apply_to("${a}"), "${b}");
    }

    #[test]
    fn test_time_fields_are_zero_padded_in_timezone() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let end = Utc.with_ymd_and_hms(2022, 1, 7, 14, 5, 9).unwrap();
        let interval = Interval::new(DateTime::<Utc>::UNIX_EPOCH, end);
        let vm = VarMap::from_interval(&interval, tz);

        assert_eq!(vm.get("yyyy"), Some("2022"));
        assert_eq!(vm.get("mm"), Some("01"));
        assert_eq!(vm.get("dd"), Some("07"));
        assert_eq!(vm.get("yyyymmdd"), Some("20220107"));
        assert_eq!(vm.get("hhmmss"), Some("090509"));
        assert_eq!(vm.get("PERIOD_END"), Some("2022-01-07T09:05:09-05:00"));
    }

    #[test]
    fn test_merge_missing_keeps_computed_fields() {
        let mut world = BTreeMap::new();
        world.insert("yyyy".to_string(), "1999".to_string());
        world.insert("BUCKET".to_string(), "s3://data".to_string());

        let vm = VarMap::new().with_var("yyyy", "2022").merge_missing(&world);
        assert_eq!(vm.apply_to("${BUCKET}/${yyyy}"), "s3://data/2022");
    }
}
