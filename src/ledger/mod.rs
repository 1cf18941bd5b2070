//! Resource Ledger.
//!
//! Records, per resource, the `(start, end]` intervals over which a producing
//! task made that resource available. The ledger is append-only: intervals
//! are never removed, and a `down` is kept as metadata next to them.

mod resolver;

pub use resolver::{Blocker, DependencyEdge, DependencyGraph, Resolver};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::core::interval::Interval;
use crate::core::types::{ResourceName, TaskName};

/// A producer tried to record an interval overlapping one it already recorded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{producer} already produced {resource} over {existing}, cannot record {attempted}")]
pub struct OverlapError {
    pub resource: ResourceName,
    pub producer: TaskName,
    pub existing: Interval,
    pub attempted: Interval,
}

/// One recorded interval of resource availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub resource: ResourceName,
    pub producer: TaskName,
    pub interval: Interval,
    pub recorded_at: DateTime<Utc>,
}

/// A successful `down` against a previously produced interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownRecord {
    pub resource: ResourceName,
    pub producer: TaskName,
    pub interval: Interval,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only interval store for one DagRun.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLedger {
    /// Entries per resource, sorted by interval start.
    entries: BTreeMap<ResourceName, Vec<LedgerEntry>>,
    downs: Vec<DownRecord>,
}

impl ResourceLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted entries and down records.
    pub fn restore(
        entries: impl IntoIterator<Item = LedgerEntry>,
        downs: impl IntoIterator<Item = DownRecord>,
    ) -> Result<Self, OverlapError> {
        let mut ledger = Self::new();
        for entry in entries {
            ledger.insert(entry)?;
        }
        ledger.downs.extend(downs);
        Ok(ledger)
    }

    /// Check that `interval` could be recorded for `producer` without overlap.
    pub fn check(
        &self,
        resource: &ResourceName,
        producer: &TaskName,
        interval: &Interval,
    ) -> Result<(), OverlapError> {
        let Some(entries) = self.entries.get(resource) else {
            return Ok(());
        };
        match entries
            .iter()
            .find(|e| &e.producer == producer && e.interval.overlaps(interval))
        {
            Some(existing) => Err(OverlapError {
                resource: resource.clone(),
                producer: producer.clone(),
                existing: existing.interval,
                attempted: *interval,
            }),
            None => Ok(()),
        }
    }

    /// Append an interval for `resource`.
    pub fn record(
        &mut self,
        resource: ResourceName,
        producer: TaskName,
        interval: Interval,
        recorded_at: DateTime<Utc>,
    ) -> Result<LedgerEntry, OverlapError> {
        let entry = LedgerEntry {
            resource,
            producer,
            interval,
            recorded_at,
        };
        self.insert(entry.clone())?;
        Ok(entry)
    }

    fn insert(&mut self, entry: LedgerEntry) -> Result<(), OverlapError> {
        self.check(&entry.resource, &entry.producer, &entry.interval)?;
        let entries = self.entries.entry(entry.resource.clone()).or_default();
        let at = entries.partition_point(|e| e.interval.start <= entry.interval.start);
        entries.insert(at, entry);
        Ok(())
    }

    /// True if exactly this interval was already recorded by `producer`.
    pub fn contains_exact(
        &self,
        resource: &ResourceName,
        producer: &TaskName,
        interval: &Interval,
    ) -> bool {
        self.entries.get(resource).is_some_and(|entries| {
            entries
                .iter()
                .any(|e| &e.producer == producer && &e.interval == interval)
        })
    }

    /// True if some recorded interval of `resource` contains `instant`.
    pub fn covers(&self, resource: &ResourceName, instant: DateTime<Utc>) -> bool {
        self.interval_containing(resource, instant).is_some()
    }

    /// The recorded entry whose interval contains `instant`.
    pub fn interval_containing(
        &self,
        resource: &ResourceName,
        instant: DateTime<Utc>,
    ) -> Option<&LedgerEntry> {
        let entries = self.entries.get(resource)?;
        // Entries are sorted by start, so only those starting before `instant` can match.
        let upto = entries.partition_point(|e| e.interval.start < instant);
        entries[..upto]
            .iter()
            .rev()
            .find(|e| e.interval.contains(instant))
    }

    /// All entries for a resource in start order.
    pub fn intervals(&self, resource: &ResourceName) -> &[LedgerEntry] {
        self.entries.get(resource).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Entries of `resource` overlapping `(start, end]`.
    pub fn overlapping(
        &self,
        resource: &ResourceName,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Iterator<Item = &LedgerEntry> {
        let window = Interval::new(start, end);
        self.intervals(resource)
            .iter()
            .filter(move |e| e.interval.overlaps(&window))
    }

    /// Every resource that has at least one entry.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceName> {
        self.entries.keys()
    }

    /// Total number of recorded intervals.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// True if nothing was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Note that a producer tore down one of its intervals.
    pub fn note_down(&mut self, record: DownRecord) {
        self.downs.push(record);
    }

    /// Down records in the order they were noted.
    pub fn downs(&self) -> &[DownRecord] {
        &self.downs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 1, d, h, 0, 0).unwrap()
    }

    fn alpha() -> ResourceName {
        ResourceName::new("alpha")
    }

    fn task_a() -> TaskName {
        TaskName::new("task_a")
    }

    #[test]
    fn test_record_and_cover() {
        let mut ledger = ResourceLedger::new();
        ledger
            .record(alpha(), task_a(), Interval::new(at(3, 9), at(3, 12)), at(3, 12))
            .unwrap();

        assert!(ledger.covers(&alpha(), at(3, 12)));
        assert!(ledger.covers(&alpha(), at(3, 10)));
        assert!(!ledger.covers(&alpha(), at(3, 9)));
        assert!(!ledger.covers(&alpha(), at(3, 13)));
        assert!(!ledger.covers(&ResourceName::new("beta"), at(3, 10)));
    }

    #[test]
    fn test_overlap_is_rejected_without_mutation() {
        let mut ledger = ResourceLedger::new();
        ledger
            .record(alpha(), task_a(), Interval::new(at(3, 9), at(3, 12)), at(3, 12))
            .unwrap();

        let err = ledger
            .record(alpha(), task_a(), Interval::new(at(3, 11), at(3, 14)), at(3, 14))
            .unwrap_err();
        assert_eq!(err.existing, Interval::new(at(3, 9), at(3, 12)));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_exact_duplicate_is_an_overlap() {
        let mut ledger = ResourceLedger::new();
        let iv = Interval::new(at(3, 9), at(3, 12));
        ledger.record(alpha(), task_a(), iv, at(3, 12)).unwrap();
        assert!(ledger.contains_exact(&alpha(), &task_a(), &iv));
        assert!(ledger.record(alpha(), task_a(), iv, at(3, 13)).is_err());
    }

    #[test]
    fn test_adjacent_intervals_are_accepted() {
        let mut ledger = ResourceLedger::new();
        ledger
            .record(alpha(), task_a(), Interval::new(at(3, 9), at(3, 12)), at(3, 12))
            .unwrap();
        ledger
            .record(alpha(), task_a(), Interval::new(at(3, 12), at(4, 9)), at(4, 9))
            .unwrap();
        assert_eq!(ledger.intervals(&alpha()).len(), 2);
    }

    #[test]
    fn test_intervals_stay_sorted_and_disjoint() {
        let mut ledger = ResourceLedger::new();
        let bounds = [(5, 6), (1, 2), (3, 4), (2, 3), (4, 5)];
        for (s, e) in bounds {
            ledger
                .record(alpha(), task_a(), Interval::new(at(s, 0), at(e, 0)), at(e, 0))
                .unwrap();
        }

        let entries = ledger.intervals(&alpha());
        for pair in entries.windows(2) {
            assert!(pair[0].interval.start <= pair[1].interval.start);
            assert!(!pair[0].interval.overlaps(&pair[1].interval));
        }
    }

    #[test]
    fn test_interval_containing_returns_entry() {
        let mut ledger = ResourceLedger::new();
        ledger
            .record(alpha(), task_a(), Interval::new(at(1, 0), at(2, 0)), at(2, 0))
            .unwrap();
        ledger
            .record(alpha(), task_a(), Interval::new(at(2, 0), at(3, 0)), at(3, 0))
            .unwrap();

        let entry = ledger.interval_containing(&alpha(), at(2, 12)).unwrap();
        assert_eq!(entry.interval.end, at(3, 0));
        assert!(ledger.interval_containing(&alpha(), at(4, 0)).is_none());
    }

    #[test]
    fn test_overlapping_window() {
        let mut ledger = ResourceLedger::new();
        for d in 1..5 {
            ledger
                .record(alpha(), task_a(), Interval::new(at(d, 0), at(d + 1, 0)), at(d + 1, 0))
                .unwrap();
        }
        let hits: Vec<_> = ledger.overlapping(&alpha(), at(2, 12), at(3, 12)).collect();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_down_does_not_retract() {
        let mut ledger = ResourceLedger::new();
        let iv = Interval::new(at(3, 9), at(3, 12));
        ledger.record(alpha(), task_a(), iv, at(3, 12)).unwrap();
        ledger.note_down(DownRecord {
            resource: alpha(),
            producer: task_a(),
            interval: iv,
            recorded_at: at(3, 13),
        });

        assert!(ledger.covers(&alpha(), at(3, 12)));
        assert_eq!(ledger.downs().len(), 1);
    }

    #[test]
    fn test_restore_rejects_corrupt_history() {
        let entry = |s, e| LedgerEntry {
            resource: alpha(),
            producer: task_a(),
            interval: Interval::new(at(s, 0), at(e, 0)),
            recorded_at: at(e, 0),
        };
        assert!(ResourceLedger::restore(vec![entry(1, 2), entry(2, 3)], vec![]).is_ok());
        assert!(ResourceLedger::restore(vec![entry(1, 3), entry(2, 4)], vec![]).is_err());
    }
}
