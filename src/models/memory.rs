//! Memory records and identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a memory record.
///
/// Also serves as the caller-supplied deduplication key for `add_memory`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(String);

impl MemoryId {
    /// Creates a new memory ID.
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

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MemoryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MemoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A remembered piece of content.
///
/// Immutable once stored: records are superseded by new records, never
/// updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier.
    pub id: MemoryId,
    /// The remembered content.
    pub content: String,
    /// Free-form kind tag (e.g. "edit", "command", "note").
    pub kind: String,
    /// Optional embedding. When present its length equals the configured
    /// dimension; records without one are excluded from vector search.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Creation timestamp (Unix epoch milliseconds).
    pub created_at: i64,
}

impl MemoryRecord {
    /// Creates a record with a generated ID and the current timestamp.
    #[must_use]
    pub fn new(
        content: impl Into<String>,
        kind: impl Into<String>,
        embedding: Option<Vec<f32>>,
    ) -> Self {
        Self {
            id: MemoryId::generate(),
            content: content.into(),
            kind: kind.into(),
            embedding,
            created_at: crate::current_timestamp_ms(),
        }
    }

    /// Sets an explicit ID (deduplication key).
    #[must_use]
    pub fn with_id(mut self, id: impl Into<MemoryId>) -> Self {
        self.id = id.into();
        self
    }

    /// Returns the embedding length, if any.
    #[must_use]
    pub fn embedding_dimension(&self) -> Option<usize> {
        self.embedding.as_ref().map(Vec::len)
    }
}

/// A memory returned from a similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryResult {
    /// The memory data.
    pub memory: MemoryRecord,
    /// Cosine similarity normalized to 0.0..=1.0.
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = MemoryId::generate();
        let b = MemoryId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_with_id_overrides_generated() {
        let record = MemoryRecord::new("hello", "note", None).with_id("fixed");
        assert_eq!(record.id.as_str(), "fixed");
        assert_eq!(record.embedding_dimension(), None);
    }

    #[test]
    fn test_missing_embedding_deserializes_as_none() {
        let json = r#"{"id":"m1","content":"c","kind":"k","created_at":5}"#;
        let record: MemoryRecord = serde_json::from_str(json).unwrap();
        assert!(record.embedding.is_none());
        assert_eq!(record.created_at, 5);
    }
}
