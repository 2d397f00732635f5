//! File co-occurrence edges.

use serde::{Deserialize, Serialize};

/// Weighted co-occurrence between two files.
///
/// Weights only grow; an edge is never replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source file (or lexically smaller file under the symmetric policy).
    pub file_a: String,
    /// Target file.
    pub file_b: String,
    /// Accumulated weight.
    pub weight: u64,
}

impl Edge {
    /// Creates an edge.
    #[must_use]
    pub fn new(file_a: impl Into<String>, file_b: impl Into<String>, weight: u64) -> Self {
        Self {
            file_a: file_a.into(),
            file_b: file_b.into(),
            weight,
        }
    }
}
