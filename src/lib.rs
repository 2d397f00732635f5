//! # Intellistore
//!
//! Crash-safe persistence for an evolving "intelligence" state.
//!
//! Intellistore stores memory records, learned value tables, execution
//! trajectories, co-occurrence edges and small key-value state written by many
//! short-lived hook processes. Each mutation is applied atomically, concurrent
//! invocations from unrelated processes are safe, and a legacy flat-file state
//! is migrated exactly once into the transactional store.
//!
//! ## Features
//!
//! - `SQLite` WAL backend with one transaction per logical operation
//! - Legacy JSON flat-file backend kept as migration source and fallback
//! - Startup capability probe with cached, observable fallback
//! - One-time migration with a timestamped, hash-verified backup
//! - Versioned binary codec with fixed-width embedding vectors
//!
//! ## Example
//!
//! ```rust,ignore
//! use intellistore::{BackendFactory, BackendKind, MemoryRecord, StorageConfig};
//!
//! let config = StorageConfig::new()
//!     .with_backend(BackendKind::Transactional)
//!     .with_path("./.intellistore")
//!     .with_dimension(384);
//! let store = BackendFactory::default().open(&config)?;
//! store.add_memory(&MemoryRecord::new("hello", "note", None))?;
//! assert!(!store.status().is_degraded());
//! store.close()?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod codec;
pub mod config;
pub mod io;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

pub use codec::{Codec, Record, RecordKind};
pub use config::{BackendKind, EdgePolicy, StorageConfig};
pub use models::{
    CompleteSnapshot, Edge, FullSnapshot, KvEntry, MemoryId, MemoryRecord, MemoryResult,
    StatCounter, Table, TableCounts, Trajectory, TrajectoryId, TrajectoryStep, ValueKey,
    ValueTableRow,
};
pub use services::{
    BackendFactory, BackendStatus, CapabilityProbe, MigrationCoordinator, MigrationOutcome,
    ProbeReport, Resolution, SqliteSelfTest, StoreHandle,
};
pub use storage::{FlatFileBackend, PersistenceBackend, SqlitePersistenceBackend};

/// Error type for intellistore operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `OpenError` | Store path unwritable, schema creation failed, unsupported on-disk format |
/// | `CorruptRecord` | Encoded bytes do not match the declared record shape |
/// | `DimensionMismatch` | A vector's length differs from the configured dimension |
/// | `TransactionError` | Begin, statement or commit failed; the operation was rolled back |
/// | `AmbiguousMigrationState` | Legacy file and populated store both present without a marker |
/// | `PartialSnapshot` | A whole-file rewrite was requested from an incomplete snapshot |
/// | `Configuration` | Missing or invalid configuration values |
/// | `InvalidInput` | Caller supplied an invalid argument |
/// | `NotFound` | A referenced record does not exist |
/// | `OperationFailed` | I/O and other failures outside a transaction |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The store could not be opened.
    ///
    /// Fatal to the invocation that attempted the open.
    #[error("failed to open store at '{path}': {cause}")]
    OpenError {
        /// Path that was being opened.
        path: String,
        /// The underlying cause.
        cause: String,
    },

    /// A record failed to decode.
    ///
    /// Bulk loads skip the record and continue; point reads return this error.
    #[error("corrupt {kind} record: {reason}")]
    CorruptRecord {
        /// Record kind that was being decoded.
        kind: String,
        /// What was wrong with the bytes.
        reason: String,
    },

    /// A vector's length does not match the configured dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },

    /// A transaction failed and was rolled back.
    ///
    /// Retrying is safe for upsert-style operations only. Appends
    /// (`append_trajectory_step`) must not be retried blindly.
    #[error("transaction '{operation}' failed: {cause}")]
    TransactionError {
        /// The operation whose transaction failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// Both a legacy flat file and a populated transactional store exist.
    ///
    /// Nothing is written; an operator must pick a
    /// [`Resolution`](crate::services::Resolution).
    #[error(
        "ambiguous migration state: legacy file '{legacy}' and populated store '{store}' both exist"
    )]
    AmbiguousMigrationState {
        /// Path of the legacy flat file.
        legacy: String,
        /// Path of the transactional store.
        store: String,
    },

    /// A full rewrite was attempted from a snapshot missing some tables.
    #[error("refusing full rewrite from partial snapshot (missing: {})", missing.join(", "))]
    PartialSnapshot {
        /// Names of the absent tables.
        missing: Vec<String>,
    },

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation failed.
    ///
    /// Raised for filesystem I/O, serialization of the legacy document and
    /// use of a closed handle.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Returns true if retrying the same logical operation may succeed.
    ///
    /// Only transaction failures are transient; whether a retry is *safe*
    /// additionally depends on the operation being an upsert.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransactionError { .. })
    }
}

/// Result type alias for intellistore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in milliseconds.
///
/// Falls back to 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("test error".to_string());
        assert_eq!(err.to_string(), "invalid input: test error");

        let err = Error::DimensionMismatch {
            expected: 384,
            actual: 768,
        };
        assert_eq!(err.to_string(), "dimension mismatch: expected 384, got 768");

        let err = Error::PartialSnapshot {
            missing: vec!["memories".to_string(), "kv".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "refusing full rewrite from partial snapshot (missing: memories, kv)"
        );
    }

    #[test]
    fn test_only_transaction_errors_are_retryable() {
        let tx = Error::TransactionError {
            operation: "upsert_value_row".to_string(),
            cause: "database is locked".to_string(),
        };
        assert!(tx.is_retryable());
        assert!(!Error::Configuration("x".to_string()).is_retryable());
    }

    #[test]
    fn test_current_timestamp_ms() {
        assert!(current_timestamp_ms() > 1_600_000_000_000);
    }
}
