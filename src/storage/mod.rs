//! Storage layer.
//!
//! Two interchangeable implementations of [`PersistenceBackend`]:
//! - **Transactional**: `SQLite` in WAL mode, one transaction per operation
//! - **Legacy flat file**: one JSON document rewritten on every change
//!
//! [`sqlite`] holds the connection, schema and row plumbing shared by the
//! transactional backend and the capability probe.

// Allow cast precision loss for similarity scores.
#![allow(clippy::cast_precision_loss)]
// Allow significant_drop_tightening - dropping database connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]
// Allow manual_let_else for clearer error handling in some contexts.
#![allow(clippy::manual_let_else)]
// Allow match_same_arms for explicit enum handling.
#![allow(clippy::match_same_arms)]

pub mod persistence;
pub mod similarity;
pub mod sqlite;
pub mod traits;

pub use persistence::{
    FlatFileBackend, ImportMode, ImportOutcome, MigrationMarker, SqlitePersistenceBackend,
};
pub use traits::PersistenceBackend;
