//! Small cross-call key-value state.

use serde::{Deserialize, Serialize};

/// A key-value entry. Last writer wins on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    /// Key, e.g. `last_touched_file`.
    pub key: String,
    /// Value.
    pub value: String,
    /// Last write timestamp (Unix epoch milliseconds).
    pub updated_at: i64,
}

impl KvEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            updated_at: crate::current_timestamp_ms(),
        }
    }
}
