//! Row conversion between `SQLite` and the data models.

use super::connection::read_error;
use crate::codec::Codec;
use crate::models::{
    Edge, KvEntry, MemoryId, MemoryRecord, TableCounts, Trajectory, TrajectoryId, TrajectoryStep,
    ValueTableRow,
};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Column list matching [`MemoryRow::from_row`].
pub const MEMORY_COLUMNS: &str = "id, content, kind, embedding, created_at";
/// Column list matching [`value_row_from_row`].
pub const VALUE_ROW_COLUMNS: &str = "algorithm_id, state_key, action_key, value, visit_count";
/// Column list matching [`trajectory_header_from_row`].
pub const TRAJECTORY_COLUMNS: &str = "id, context, agent, terminal_quality, started_at, ended_at";

/// Converts a count for storage in an `INTEGER` column.
///
/// `SQLite` integers are signed; rusqlite offers no `ToSql` for `u64`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the value exceeds `i64::MAX`.
pub fn to_sql_count(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::InvalidInput(format!("{what} {value} exceeds the storable range")))
}

/// Converts a stored count back, clamping negatives to zero.
#[must_use]
pub fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

/// Decodes an `embedding` column.
///
/// Without a configured dimension the blob length decides the dimension.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] or [`Error::DimensionMismatch`].
pub fn decode_embedding(blob: &[u8], dimension: Option<usize>) -> Result<Vec<f32>> {
    Codec::new(dimension.unwrap_or(blob.len() / 4)).decode_vector(blob)
}

/// Raw `memories` row before the embedding is decoded.
#[derive(Debug)]
pub struct MemoryRow {
    id: String,
    content: String,
    kind: String,
    embedding: Option<Vec<u8>>,
    created_at: i64,
}

impl MemoryRow {
    /// Reads the columns listed in [`MEMORY_COLUMNS`].
    ///
    /// # Errors
    ///
    /// Returns the rusqlite error for a missing or mistyped column.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            kind: row.get(2)?,
            embedding: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    /// Returns the row ID, for logging skipped rows.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Decodes the embedding and builds the record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] or [`Error::DimensionMismatch`] if the
    /// embedding blob does not decode.
    pub fn into_record(self, dimension: Option<usize>) -> Result<MemoryRecord> {
        let embedding = self
            .embedding
            .as_deref()
            .map(|blob| decode_embedding(blob, dimension))
            .transpose()?;
        Ok(MemoryRecord {
            id: MemoryId::new(self.id),
            content: self.content,
            kind: self.kind,
            embedding,
            created_at: self.created_at,
        })
    }
}

/// Builds a value-table row from [`VALUE_ROW_COLUMNS`].
///
/// # Errors
///
/// Returns the rusqlite error for a missing or mistyped column.
pub fn value_row_from_row(row: &Row<'_>) -> rusqlite::Result<ValueTableRow> {
    Ok(ValueTableRow {
        algorithm_id: row.get(0)?,
        state_key: row.get(1)?,
        action_key: row.get(2)?,
        value: row.get(3)?,
        visit_count: from_sql_count(row.get(4)?),
    })
}

/// Builds a trajectory without steps from [`TRAJECTORY_COLUMNS`].
///
/// # Errors
///
/// Returns the rusqlite error for a missing or mistyped column.
pub fn trajectory_header_from_row(row: &Row<'_>) -> rusqlite::Result<Trajectory> {
    Ok(Trajectory {
        id: TrajectoryId::new(row.get::<_, String>(0)?),
        context: row.get(1)?,
        agent: row.get(2)?,
        steps: Vec::new(),
        terminal_quality: row.get(3)?,
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
    })
}

/// Builds an edge from `file_a, file_b, weight`.
///
/// # Errors
///
/// Returns the rusqlite error for a missing or mistyped column.
pub fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<Edge> {
    Ok(Edge {
        file_a: row.get(0)?,
        file_b: row.get(1)?,
        weight: from_sql_count(row.get(2)?),
    })
}

/// Builds a key-value entry from `key, value, updated_at`.
///
/// # Errors
///
/// Returns the rusqlite error for a missing or mistyped column.
pub fn kv_from_row(row: &Row<'_>) -> rusqlite::Result<KvEntry> {
    Ok(KvEntry {
        key: row.get(0)?,
        value: row.get(1)?,
        updated_at: row.get(2)?,
    })
}

/// Loads the steps of one trajectory in append order.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the query fails.
pub fn load_steps(conn: &Connection, id: &str) -> Result<Vec<TrajectoryStep>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT action, result, reward FROM trajectory_steps
             WHERE trajectory_id = ?1 ORDER BY step_index",
        )
        .map_err(read_error("load_steps"))?;
    let steps = stmt
        .query_map(params![id], |row| {
            Ok(TrajectoryStep {
                action: row.get(0)?,
                result: row.get(1)?,
                reward: row.get(2)?,
            })
        })
        .map_err(read_error("load_steps"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(read_error("load_steps"))?;
    Ok(steps)
}

/// Loads one trajectory with its steps.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if a query fails.
pub fn load_trajectory(conn: &Connection, id: &str) -> Result<Option<Trajectory>> {
    let header = conn
        .query_row(
            &format!("SELECT {TRAJECTORY_COLUMNS} FROM trajectories WHERE id = ?1"),
            params![id],
            trajectory_header_from_row,
        )
        .optional()
        .map_err(read_error("get_trajectory"))?;
    match header {
        Some(mut trajectory) => {
            trajectory.steps = load_steps(conn, id)?;
            Ok(Some(trajectory))
        },
        None => Ok(None),
    }
}

fn count(conn: &Connection, table: &str) -> Result<usize> {
    let n: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .map_err(read_error("count_rows"))?;
    Ok(usize::try_from(n).unwrap_or_default())
}

/// Counts the rows of every table.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if a count query fails.
pub fn count_rows(conn: &Connection) -> Result<TableCounts> {
    Ok(TableCounts {
        memories: count(conn, "memories")?,
        value_rows: count(conn, "value_rows")?,
        trajectories: count(conn, "trajectories")?,
        trajectory_steps: count(conn, "trajectory_steps")?,
        edges: count(conn, "edges")?,
        kv: count(conn, "kv")?,
        stats: count(conn, "stats")?,
    })
}
