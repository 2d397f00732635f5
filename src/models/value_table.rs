//! Learned value-table rows.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique key of a value-table row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueKey {
    /// Learning algorithm that owns the row.
    pub algorithm_id: String,
    /// Observed state.
    pub state_key: String,
    /// Action taken in that state.
    pub action_key: String,
}

impl ValueKey {
    /// Creates a key.
    #[must_use]
    pub fn new(
        algorithm_id: impl Into<String>,
        state_key: impl Into<String>,
        action_key: impl Into<String>,
    ) -> Self {
        Self {
            algorithm_id: algorithm_id.into(),
            state_key: state_key.into(),
            action_key: action_key.into(),
        }
    }
}

impl fmt::Display for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.algorithm_id, self.state_key, self.action_key)
    }
}

/// A value-table row.
///
/// Inserted with `visit_count = 1` on first observation, then updated in
/// place: `value` is last-writer-wins and `visit_count` grows by one per
/// observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueTableRow {
    /// Learning algorithm that owns the row.
    pub algorithm_id: String,
    /// Observed state.
    pub state_key: String,
    /// Action taken in that state.
    pub action_key: String,
    /// Current learned value.
    pub value: f64,
    /// Number of observations folded into this row.
    pub visit_count: u64,
}

impl ValueTableRow {
    /// Creates a first-observation row.
    #[must_use]
    pub fn first_observation(key: ValueKey, value: f64) -> Self {
        Self {
            algorithm_id: key.algorithm_id,
            state_key: key.state_key,
            action_key: key.action_key,
            value,
            visit_count: 1,
        }
    }

    /// Returns the row's unique key.
    #[must_use]
    pub fn key(&self) -> ValueKey {
        ValueKey::new(&self.algorithm_id, &self.state_key, &self.action_key)
    }

    /// Folds another observation into the row.
    pub const fn observe(&mut self, value: f64) {
        self.value = value;
        self.visit_count = self.visit_count.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_counts_visits() {
        let mut row = ValueTableRow::first_observation(ValueKey::new("q", "s", "a"), 0.5);
        row.observe(0.5);
        assert_eq!(row.visit_count, 2);
        row.observe(0.9);
        assert_eq!(row.visit_count, 3);
        assert!((row.value - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(ValueKey::new("q", "s", "a").to_string(), "q/s/a");
    }
}
