//! Bulk snapshots of every table.
//!
//! A table set to `None` was not loaded by the caller. Bulk-save paths must
//! leave such tables untouched; whole-file rewrites refuse them outright.

use super::{Edge, KvEntry, MemoryRecord, StatCounter, Trajectory, ValueTableRow};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// The logical tables of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Memory records.
    Memories,
    /// Value-table rows.
    ValueRows,
    /// Trajectories with their steps.
    Trajectories,
    /// Co-occurrence edges.
    Edges,
    /// Key-value entries.
    Kv,
    /// Named counters.
    Stats,
}

impl Table {
    /// All tables.
    pub const ALL: [Self; 6] = [
        Self::Memories,
        Self::ValueRows,
        Self::Trajectories,
        Self::Edges,
        Self::Kv,
        Self::Stats,
    ];

    /// Returns the table name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memories => "memories",
            Self::ValueRows => "value_rows",
            Self::Trajectories => "trajectories",
            Self::Edges => "edges",
            Self::Kv => "kv",
            Self::Stats => "stats",
        }
    }

    /// Bit used for this table in presence masks.
    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::Memories => 1,
            Self::ValueRows => 1 << 1,
            Self::Trajectories => 1 << 2,
            Self::Edges => 1 << 3,
            Self::Kv => 1 << 4,
            Self::Stats => 1 << 5,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    /// Memory records.
    pub memories: usize,
    /// Value-table rows.
    pub value_rows: usize,
    /// Trajectories.
    pub trajectories: usize,
    /// Trajectory steps across all trajectories.
    pub trajectory_steps: usize,
    /// Edges.
    pub edges: usize,
    /// Key-value entries.
    pub kv: usize,
    /// Counters with a stored value.
    pub stats: usize,
}

impl TableCounts {
    /// Total rows across all data tables (counters excluded).
    #[must_use]
    pub const fn total_rows(&self) -> usize {
        self.memories + self.value_rows + self.trajectories + self.edges + self.kv
    }

    /// True if any table holds a row, counters included.
    ///
    /// A store with nothing but counters still holds data a migration must
    /// not overwrite.
    #[must_use]
    pub const fn has_any_rows(&self) -> bool {
        self.total_rows() + self.trajectory_steps + self.stats > 0
    }
}

/// A full or partial in-memory copy of the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FullSnapshot {
    /// Memory records, if loaded.
    pub memories: Option<Vec<MemoryRecord>>,
    /// Value-table rows, if loaded.
    pub value_rows: Option<Vec<ValueTableRow>>,
    /// Trajectories (with steps), if loaded.
    pub trajectories: Option<Vec<Trajectory>>,
    /// Edges, if loaded.
    pub edges: Option<Vec<Edge>>,
    /// Key-value entries, if loaded.
    pub kv: Option<Vec<KvEntry>>,
    /// Counters, if loaded.
    pub stats: Option<BTreeMap<StatCounter, u64>>,
}

impl FullSnapshot {
    /// A complete snapshot with every table present and empty.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            memories: Some(Vec::new()),
            value_rows: Some(Vec::new()),
            trajectories: Some(Vec::new()),
            edges: Some(Vec::new()),
            kv: Some(Vec::new()),
            stats: Some(BTreeMap::new()),
        }
    }

    /// Returns true if the table is present.
    #[must_use]
    pub const fn has(&self, table: Table) -> bool {
        match table {
            Table::Memories => self.memories.is_some(),
            Table::ValueRows => self.value_rows.is_some(),
            Table::Trajectories => self.trajectories.is_some(),
            Table::Edges => self.edges.is_some(),
            Table::Kv => self.kv.is_some(),
            Table::Stats => self.stats.is_some(),
        }
    }

    /// Tables absent from this snapshot.
    #[must_use]
    pub fn missing_tables(&self) -> Vec<Table> {
        Table::ALL.into_iter().filter(|t| !self.has(*t)).collect()
    }

    /// Presence bitmask (see [`Table::bit`]).
    #[must_use]
    pub fn presence_mask(&self) -> u8 {
        Table::ALL
            .into_iter()
            .filter(|t| self.has(*t))
            .fold(0, |mask, t| mask | t.bit())
    }

    /// Returns true if every table is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing_tables().is_empty()
    }

    /// Guard for whole-state rewrites.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartialSnapshot`] naming the absent tables.
    pub fn require_complete(&self) -> Result<()> {
        let missing = self.missing_tables();
        if missing.is_empty() {
            return Ok(());
        }
        Err(Error::PartialSnapshot {
            missing: missing.iter().map(|t| t.as_str().to_string()).collect(),
        })
    }

    /// Converts into a [`CompleteSnapshot`], the only input a whole-file
    /// rewrite accepts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartialSnapshot`] naming the absent tables.
    pub fn into_complete(self) -> Result<CompleteSnapshot> {
        self.require_complete()?;
        match self {
            Self {
                memories: Some(memories),
                value_rows: Some(value_rows),
                trajectories: Some(trajectories),
                edges: Some(edges),
                kv: Some(kv),
                stats: Some(stats),
            } => Ok(CompleteSnapshot {
                memories,
                value_rows,
                trajectories,
                edges,
                kv,
                stats,
            }),
            partial => partial.require_complete().map(|()| CompleteSnapshot::default()),
        }
    }

    /// Fills every absent table from `base`, leaving present tables alone.
    pub fn fill_missing_from(&mut self, base: &Self) {
        if self.memories.is_none() {
            self.memories.clone_from(&base.memories);
        }
        if self.value_rows.is_none() {
            self.value_rows.clone_from(&base.value_rows);
        }
        if self.trajectories.is_none() {
            self.trajectories.clone_from(&base.trajectories);
        }
        if self.edges.is_none() {
            self.edges.clone_from(&base.edges);
        }
        if self.kv.is_none() {
            self.kv.clone_from(&base.kv);
        }
        if self.stats.is_none() {
            self.stats.clone_from(&base.stats);
        }
    }

    /// Row counts; absent tables count as zero.
    #[must_use]
    pub fn counts(&self) -> TableCounts {
        TableCounts {
            memories: self.memories.as_ref().map_or(0, Vec::len),
            value_rows: self.value_rows.as_ref().map_or(0, Vec::len),
            trajectories: self.trajectories.as_ref().map_or(0, Vec::len),
            trajectory_steps: self
                .trajectories
                .as_ref()
                .map_or(0, |ts| ts.iter().map(|t| t.steps.len()).sum()),
            edges: self.edges.as_ref().map_or(0, Vec::len),
            kv: self.kv.as_ref().map_or(0, Vec::len),
            stats: self.stats.as_ref().map_or(0, BTreeMap::len),
        }
    }
}

/// A snapshot in which every table is present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompleteSnapshot {
    /// Memory records.
    pub memories: Vec<MemoryRecord>,
    /// Value-table rows.
    pub value_rows: Vec<ValueTableRow>,
    /// Trajectories with steps.
    pub trajectories: Vec<Trajectory>,
    /// Edges.
    pub edges: Vec<Edge>,
    /// Key-value entries.
    pub kv: Vec<KvEntry>,
    /// Counters.
    pub stats: BTreeMap<StatCounter, u64>,
}

impl From<CompleteSnapshot> for FullSnapshot {
    fn from(complete: CompleteSnapshot) -> Self {
        Self {
            memories: Some(complete.memories),
            value_rows: Some(complete.value_rows),
            trajectories: Some(complete.trajectories),
            edges: Some(complete.edges),
            kv: Some(complete.kv),
            stats: Some(complete.stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_complete() {
        let snapshot = FullSnapshot::empty();
        assert!(snapshot.is_complete());
        assert!(snapshot.require_complete().is_ok());
        assert_eq!(snapshot.presence_mask(), 0b0011_1111);
    }

    #[test]
    fn test_default_is_partial() {
        let snapshot = FullSnapshot::default();
        assert_eq!(snapshot.missing_tables().len(), Table::ALL.len());
        let err = snapshot.require_complete().unwrap_err();
        assert!(matches!(err, Error::PartialSnapshot { ref missing } if missing.len() == 6));
    }

    #[test]
    fn test_into_complete_rejects_partial() {
        let partial = FullSnapshot {
            memories: Some(Vec::new()),
            ..FullSnapshot::default()
        };
        let err = partial.into_complete().unwrap_err();
        assert!(
            matches!(err, Error::PartialSnapshot { ref missing } if !missing.contains(&"memories".to_string()))
        );

        let complete = FullSnapshot::empty().into_complete().unwrap();
        assert_eq!(FullSnapshot::from(complete), FullSnapshot::empty());
    }

    #[test]
    fn test_fill_missing_keeps_present_tables() {
        let mut base = FullSnapshot::empty();
        base.memories = Some(vec![MemoryRecord::new("kept", "note", None)]);
        base.kv = Some(vec![KvEntry::new("k", "old")]);

        let mut partial = FullSnapshot {
            kv: Some(vec![KvEntry::new("k", "new")]),
            ..FullSnapshot::default()
        };
        partial.fill_missing_from(&base);

        assert!(partial.is_complete());
        assert_eq!(partial.counts().memories, 1);
        assert_eq!(partial.kv.unwrap()[0].value, "new");
    }

    #[test]
    fn test_counts_include_steps() {
        let mut t = Trajectory::begin("ctx", "agent");
        t.steps.push(crate::models::TrajectoryStep::new("a", "ok", 1.0));
        t.steps.push(crate::models::TrajectoryStep::new("b", "ok", 0.5));
        let snapshot = FullSnapshot {
            trajectories: Some(vec![t]),
            ..FullSnapshot::default()
        };
        let counts = snapshot.counts();
        assert_eq!(counts.trajectories, 1);
        assert_eq!(counts.trajectory_steps, 2);
        assert_eq!(counts.total_rows(), 1);
    }

    #[test]
    fn test_counters_alone_count_as_data() {
        let snapshot = FullSnapshot {
            stats: Some(BTreeMap::from([(StatCounter::SessionCount, 5)])),
            ..FullSnapshot::default()
        };
        let counts = snapshot.counts();
        assert_eq!(counts.total_rows(), 0);
        assert!(counts.has_any_rows());
        assert!(!FullSnapshot::empty().counts().has_any_rows());
    }
}
