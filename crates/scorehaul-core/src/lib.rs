//! Core domain model for scorehaul: harvest targets, date windows, match records
//! and the per-competition aggregate with its dedup rule.

use std::collections::HashSet;
use std::fmt;

use chrono::NaiveDate;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "scorehaul-core";

/// One competition to harvest. Identity is `competition_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HarvestTarget {
    pub competition_id: String,
    pub competition_url: String,
}

impl HarvestTarget {
    pub fn new(competition_id: impl Into<String>, competition_url: impl Into<String>) -> Self {
        Self {
            competition_id: competition_id.into(),
            competition_url: competition_url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("date window start {start} is after end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
}

/// Inclusive date range walked one day at a time in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct DateWindow {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Deserialize)]
struct RawWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawWindow> for DateWindow {
    type Error = WindowError;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }

    pub fn len(&self) -> usize {
        usize::try_from((self.end - self.start).num_days())
            .map_or(0, |span| span.saturating_add(1))
    }

    /// Always false; a window holds at least one day.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// One (competition, date) pair: the granularity of fetching and retrying.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HarvestUnit {
    pub target: HarvestTarget,
    pub date: NaiveDate,
}

impl HarvestUnit {
    pub fn new(target: HarvestTarget, date: NaiveDate) -> Self {
        Self { target, date }
    }

    pub fn competition_id(&self) -> &str {
        &self.target.competition_id
    }
}

impl fmt::Display for HarvestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.target.competition_id, self.date)
    }
}

/// Home/away pair where either side may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidePair<T> {
    pub home: Option<T>,
    pub away: Option<T>,
}

impl<T> Default for SidePair<T> {
    fn default() -> Self {
        Self {
            home: None,
            away: None,
        }
    }
}

impl<T> SidePair<T> {
    pub fn new(home: Option<T>, away: Option<T>) -> Self {
        Self { home, away }
    }

    pub fn is_empty(&self) -> bool {
        self.home.is_none() && self.away.is_none()
    }
}

/// Home/away integer counts (scores, cards, corners).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub home: u32,
    pub away: u32,
}

impl Tally {
    pub fn new(home: u32, away: u32) -> Self {
        Self { home, away }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEntry {
    pub label: String,
    pub values: SidePair<String>,
}

/// Statistic label -> home/away values, kept in document order.
///
/// Labels are not canonicalized. Re-inserting a label replaces its values in
/// place, so the last-seen row wins while the first-seen position is kept.
/// Serializes as a JSON object whose keys follow insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatisticTable {
    entries: Vec<StatEntry>,
}

impl StatisticTable {
    pub fn insert(&mut self, label: impl Into<String>, values: SidePair<String>) {
        let label = label.into();
        match self.entries.iter_mut().find(|e| e.label == label) {
            Some(existing) => existing.values = values,
            None => self.entries.push(StatEntry { label, values }),
        }
    }

    pub fn get(&self, label: &str) -> Option<&SidePair<String>> {
        self.entries
            .iter()
            .find(|e| e.label == label)
            .map(|e| &e.values)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Later tables win on shared labels.
    pub fn absorb(&mut self, other: StatisticTable) {
        for entry in other.entries {
            self.insert(entry.label, entry.values);
        }
    }
}

impl Serialize for StatisticTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.label, &entry.values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StatisticTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = StatisticTable;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of statistic label to home/away values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut table = StatisticTable::default();
                while let Some((label, values)) = access.next_entry::<String, SidePair<String>>()? {
                    table.insert(label, values);
                }
                Ok(table)
            }
        }

        deserializer.deserialize_map(TableVisitor)
    }
}

/// A harvested match. Everything except `competition_id` and `harvest_date`
/// may be missing; absent values serialize as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    #[serde(default)]
    pub external_id: Option<String>,
    pub competition_id: String,
    #[serde(default)]
    pub competition_name: Option<String>,
    pub harvest_date: NaiveDate,
    /// Raw date/time text as rendered by the site.
    #[serde(default, rename = "date")]
    pub date_text: Option<String>,
    #[serde(default)]
    pub home_team: Option<String>,
    #[serde(default)]
    pub away_team: Option<String>,
    #[serde(default)]
    pub score: Option<Tally>,
    #[serde(default)]
    pub statistics: StatisticTable,
    #[serde(default)]
    pub possession: Option<SidePair<String>>,
    #[serde(default)]
    pub cards: Option<Tally>,
    #[serde(default)]
    pub corners: Option<Tally>,
}

impl MatchRecord {
    pub fn new(competition_id: impl Into<String>, harvest_date: NaiveDate) -> Self {
        Self {
            external_id: None,
            competition_id: competition_id.into(),
            competition_name: None,
            harvest_date,
            date_text: None,
            home_team: None,
            away_team: None,
            score: None,
            statistics: StatisticTable::default(),
            possession: None,
            cards: None,
            corners: None,
        }
    }

    /// A record with neither an id nor any team name carries no signal.
    pub fn has_identity(&self) -> bool {
        self.external_id.is_some() || self.home_team.is_some() || self.away_team.is_some()
    }

    pub fn dedup_key(&self) -> DedupKey {
        match &self.external_id {
            Some(id) => DedupKey::External(id.clone()),
            None => DedupKey::Composite {
                date: self.date_text.clone(),
                home: self.home_team.clone(),
                away: self.away_team.clone(),
            },
        }
    }
}

/// `external_id` when present, else best-effort (date, home, away).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    External(String),
    Composite {
        date: Option<String>,
        home: Option<String>,
        away: Option<String>,
    },
}

/// Records of one competition in discovery order, unique by [`DedupKey`].
#[derive(Debug, Clone, Default)]
pub struct CompetitionAggregate {
    competition_id: String,
    records: Vec<MatchRecord>,
    seen: HashSet<DedupKey>,
}

impl CompetitionAggregate {
    pub fn new(competition_id: impl Into<String>) -> Self {
        Self {
            competition_id: competition_id.into(),
            records: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Builds an aggregate keeping the first occurrence of every dedup key.
    pub fn from_records(
        competition_id: impl Into<String>,
        records: impl IntoIterator<Item = MatchRecord>,
    ) -> Self {
        let mut aggregate = Self::new(competition_id);
        aggregate.extend_unique(records);
        aggregate
    }

    /// Appends unless the dedup key is already present. Returns whether it was kept.
    pub fn push_unique(&mut self, record: MatchRecord) -> bool {
        if !self.seen.insert(record.dedup_key()) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Returns the number of records dropped as duplicates.
    pub fn extend_unique(&mut self, records: impl IntoIterator<Item = MatchRecord>) -> usize {
        let mut dropped = 0;
        for record in records {
            if !self.push_unique(record) {
                dropped += 1;
            }
        }
        dropped
    }

    pub fn competition_id(&self) -> &str {
        &self.competition_id
    }

    pub fn records(&self) -> &[MatchRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<MatchRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
