//! Schema for the transactional store.

use super::connection::{read_error, tx_error, with_write_transaction};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};

/// Current on-disk schema version, recorded in `meta.format_version`.
pub const SCHEMA_VERSION: u32 = 1;

/// Meta key holding the schema version.
pub const META_FORMAT_VERSION: &str = "format_version";
/// Meta key holding the embedding dimension of stored vectors.
pub const META_DIMENSION: &str = "dimension";
/// Meta key set when a legacy migration committed.
pub const META_MIGRATION_COMPLETED_AT: &str = "migration_completed_at";
/// Meta key naming the legacy file a migration read.
pub const META_MIGRATION_SOURCE: &str = "migration_source";
/// Meta key naming the backup the legacy file was renamed to.
pub const META_MIGRATION_BACKUP: &str = "migration_backup";

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        kind TEXT NOT NULL,
        embedding BLOB,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories (created_at DESC);

    CREATE TABLE IF NOT EXISTS value_rows (
        algorithm_id TEXT NOT NULL,
        state_key TEXT NOT NULL,
        action_key TEXT NOT NULL,
        value REAL NOT NULL,
        visit_count INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (algorithm_id, state_key, action_key)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS trajectories (
        id TEXT PRIMARY KEY,
        context TEXT NOT NULL,
        agent TEXT NOT NULL,
        terminal_quality REAL,
        started_at INTEGER NOT NULL,
        ended_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS trajectory_steps (
        trajectory_id TEXT NOT NULL REFERENCES trajectories (id) ON DELETE CASCADE,
        step_index INTEGER NOT NULL,
        action TEXT NOT NULL,
        result TEXT NOT NULL,
        reward REAL NOT NULL,
        PRIMARY KEY (trajectory_id, step_index)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS edges (
        file_a TEXT NOT NULL,
        file_b TEXT NOT NULL,
        weight INTEGER NOT NULL,
        PRIMARY KEY (file_a, file_b)
    ) WITHOUT ROWID;
    CREATE INDEX IF NOT EXISTS idx_edges_file_b ON edges (file_b);

    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS stats (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );
";

/// Creates the schema if needed and checks the recorded version.
///
/// Runs in one write transaction so concurrent first opens from several
/// processes serialize on the write lock.
///
/// # Errors
///
/// Returns [`Error::TransactionError`] if the DDL fails, or
/// [`Error::Configuration`] if the store was written by a newer schema.
pub fn initialize(conn: &Connection) -> Result<()> {
    with_write_transaction(conn, "initialize_schema", |conn| {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(tx_error("initialize_schema"))?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, ?2)",
            params![META_FORMAT_VERSION, SCHEMA_VERSION.to_string()],
        )
        .map_err(tx_error("initialize_schema"))?;
        Ok(())
    })?;

    let stored = get_meta(conn, META_FORMAT_VERSION)?
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(SCHEMA_VERSION);
    if stored > SCHEMA_VERSION {
        return Err(Error::Configuration(format!(
            "store schema version {stored} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    Ok(())
}

/// Reads a meta value.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the query fails.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
    .map_err(read_error("get_meta"))
}

/// Writes a meta value. Call inside a write transaction.
///
/// # Errors
///
/// Returns [`Error::TransactionError`] if the statement fails.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(tx_error("set_meta"))?;
    Ok(())
}
