//! Named counters.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed set of counters maintained alongside the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatCounter {
    /// Number of memory records added.
    TotalMemories,
    /// Number of distinct value-table rows.
    TotalPatterns,
    /// Number of trajectories begun.
    TotalTrajectories,
    /// Number of distinct edges.
    TotalEdges,
    /// Number of sessions (incremented explicitly by callers).
    SessionCount,
}

impl StatCounter {
    /// All counters.
    pub const ALL: [Self; 5] = [
        Self::TotalMemories,
        Self::TotalPatterns,
        Self::TotalTrajectories,
        Self::TotalEdges,
        Self::SessionCount,
    ];

    /// Returns the persisted name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TotalMemories => "total_memories",
            Self::TotalPatterns => "total_patterns",
            Self::TotalTrajectories => "total_trajectories",
            Self::TotalEdges => "total_edges",
            Self::SessionCount => "session_count",
        }
    }

    /// Parses a persisted name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for StatCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for counter in StatCounter::ALL {
            assert_eq!(StatCounter::parse(counter.as_str()), Some(counter));
        }
        assert_eq!(StatCounter::parse("total_bananas"), None);
    }

    #[test]
    fn test_serde_name_matches_as_str() {
        let json = serde_json::to_string(&StatCounter::SessionCount).unwrap();
        assert_eq!(json, "\"session_count\"");
    }
}
