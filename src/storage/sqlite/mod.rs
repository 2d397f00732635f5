//! Shared `SQLite` infrastructure for the transactional backend and the
//! capability probe.
//!
//! ## Module Structure
//!
//! - [`connection`]: lock acquisition, connection configuration and the
//!   `BEGIN IMMEDIATE` transaction wrapper
//! - [`schema`]: table definitions and the `meta` table
//! - [`rows`]: row conversion for each data model
//! - [`bulk`]: whole-table writes for `save_all` and import

mod bulk;
mod connection;
mod rows;
mod schema;

pub use bulk::{BulkWrite, WriteMode, bump_stat};
pub use connection::{
    acquire_lock, configure_connection, read_error, tx_error, with_write_transaction,
};
pub use rows::{
    MEMORY_COLUMNS, MemoryRow, TRAJECTORY_COLUMNS, VALUE_ROW_COLUMNS, count_rows,
    decode_embedding, edge_from_row, from_sql_count, kv_from_row, load_steps, load_trajectory,
    to_sql_count, trajectory_header_from_row, value_row_from_row,
};
pub use schema::{
    META_DIMENSION, META_FORMAT_VERSION, META_MIGRATION_BACKUP, META_MIGRATION_COMPLETED_AT,
    META_MIGRATION_SOURCE, SCHEMA_VERSION, get_meta, initialize, set_meta,
};
