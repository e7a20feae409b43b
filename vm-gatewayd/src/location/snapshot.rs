use std::collections::{BTreeSet, HashMap};
use chrono::{DateTime, Utc};
use shared::types::LocationRecord;
use super::hash::compute_fingerprint;

/// Immutable name -> zone mapping. Replaced wholesale, never edited in place.
#[derive(Debug, Clone)]
pub struct Snapshot {
    records: HashMap<String, LocationRecord>,
    built_at: Option<DateTime<Utc>>,
    fingerprint: String,
}

impl Snapshot {
    pub fn new(records: HashMap<String, LocationRecord>, built_at: DateTime<Utc>) -> Self {
        Self::build(records, Some(built_at))
    }

    /// Placeholder used before the first load or scan
    pub fn empty() -> Self {
        Self::build(HashMap::new(), None)
    }

    /// Build from a list of records; a later duplicate replaces an earlier one.
    pub fn from_records(records: impl IntoIterator<Item = LocationRecord>, built_at: DateTime<Utc>) -> Self {
        let records = records.into_iter().map(|r| (r.name.clone(), r)).collect();
        Self::new(records, built_at)
    }

    fn build(records: HashMap<String, LocationRecord>, built_at: Option<DateTime<Utc>>) -> Self {
        let fingerprint = compute_fingerprint(&records);
        Self {
            records,
            built_at,
            fingerprint,
        }
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&LocationRecord> {
        self.records.get(name)
    }

    /// Exact match first, then a case-insensitive match.
    pub fn find(&self, name: &str) -> Option<&LocationRecord> {
        self.records.get(name).or_else(|| {
            self.records
                .values()
                .find(|r| r.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn records(&self) -> impl Iterator<Item = &LocationRecord> {
        self.records.values()
    }

    /// Records sorted by name
    pub fn sorted_records(&self) -> Vec<LocationRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Zones hosting at least one machine
    pub fn zones(&self) -> BTreeSet<String> {
        self.records.values().map(|r| r.zone.clone()).collect()
    }

    /// Age relative to `now`, None before the first build
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.built_at.map(|t| now - t)
    }

    /// New snapshot with `found` layered over this one. Existing records
    /// not in `found` are kept; build time is unchanged.
    pub fn merged(&self, found: impl IntoIterator<Item = LocationRecord>) -> Self {
        let mut records = self.records.clone();
        for record in found {
            records.insert(record.name.clone(), record);
        }
        Self::build(records, self.built_at)
    }
}
