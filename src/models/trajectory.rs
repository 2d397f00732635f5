//! Execution trajectories.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a trajectory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrajectoryId(String);

impl TrajectoryId {
    /// Creates a trajectory ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh, time-ordered ID (UUID v7).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrajectoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TrajectoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One step of a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    /// Action taken.
    pub action: String,
    /// Observed result.
    pub result: String,
    /// Reward assigned to the step.
    pub reward: f64,
}

impl TrajectoryStep {
    /// Creates a step.
    #[must_use]
    pub fn new(action: impl Into<String>, result: impl Into<String>, reward: f64) -> Self {
        Self {
            action: action.into(),
            result: result.into(),
            reward,
        }
    }
}

/// An ordered sequence of steps taken by an agent in some context.
///
/// Open until sealed; sealing sets `terminal_quality` and `ended_at`, after
/// which the trajectory is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Unique identifier.
    pub id: TrajectoryId,
    /// Context the trajectory ran in.
    pub context: String,
    /// Agent that produced it.
    pub agent: String,
    /// Steps in append order.
    #[serde(default)]
    pub steps: Vec<TrajectoryStep>,
    /// Quality assigned when sealed.
    #[serde(default)]
    pub terminal_quality: Option<f64>,
    /// Start timestamp (Unix epoch milliseconds).
    pub started_at: i64,
    /// End timestamp, set when sealed.
    #[serde(default)]
    pub ended_at: Option<i64>,
}

impl Trajectory {
    /// Begins a new, empty trajectory.
    #[must_use]
    pub fn begin(context: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: TrajectoryId::generate(),
            context: context.into(),
            agent: agent.into(),
            steps: Vec::new(),
            terminal_quality: None,
            started_at: crate::current_timestamp_ms(),
            ended_at: None,
        }
    }

    /// Returns true once the trajectory has been sealed.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_is_open() {
        let t = Trajectory::begin("ctx", "coder");
        assert!(!t.is_sealed());
        assert!(t.steps.is_empty());
        assert!(t.terminal_quality.is_none());
    }
}
