//! Left-open time intervals.
//!
//! Every interval is `(start, end]`: the end instant belongs to the interval
//! that it closes, which is what lets a task's scheduled instant own the
//! period leading up to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(start, end]` interval in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    /// Exclusive start.
    pub start: DateTime<Utc>,
    /// Inclusive end.
    pub end: DateTime<Utc>,
}

impl Interval {
    /// Create an interval, swapping the bounds if they are reversed.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start > end {
            Self {
                start: end,
                end: start,
            }
        } else {
            Self { start, end }
        }
    }

    /// True if the interval holds no instants.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True if `start < t <= end`.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start < t && t <= self.end
    }

    /// True if the two intervals share at least one instant.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True if `other` lies entirely within this interval.
    pub fn has_subset(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}
