//! `SQLite`-based persistence backend.
//!
//! The transactional store: every mutation is one `BEGIN IMMEDIATE`
//! transaction holding the row change and its counter bump, so a crash at
//! any instant leaves the store at the state before or after the operation.

use crate::codec::Codec;
use crate::config::{BackendKind, EdgePolicy, StorageConfig};
use crate::models::{
    Edge, FullSnapshot, KvEntry, MemoryId, MemoryRecord, MemoryResult, StatCounter, TableCounts,
    Trajectory, TrajectoryId, TrajectoryStep, ValueKey, ValueTableRow,
};
use crate::observability::timed;
use crate::storage::similarity::rank_by_similarity;
use crate::storage::sqlite::{
    BulkWrite, MEMORY_COLUMNS, META_DIMENSION, META_MIGRATION_BACKUP,
    META_MIGRATION_COMPLETED_AT, META_MIGRATION_SOURCE, MemoryRow, TRAJECTORY_COLUMNS,
    VALUE_ROW_COLUMNS, WriteMode, acquire_lock, bump_stat, configure_connection, count_rows,
    edge_from_row, from_sql_count, get_meta, initialize, kv_from_row, load_steps,
    load_trajectory, read_error, set_meta, to_sql_count, trajectory_header_from_row, tx_error,
    value_row_from_row, with_write_transaction,
};
use super::{closed_error, require_finite, require_non_empty, validate_edge};
use crate::storage::traits::PersistenceBackend;
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::instrument;

const BACKEND: &str = "sqlite";

/// Marker recorded in `meta` when a legacy migration commits.
///
/// Its presence means the legacy file has been imported; a legacy file
/// still on disk afterwards is a stale copy waiting to be backed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationMarker {
    /// RFC 3339 UTC time the import committed.
    pub completed_at: String,
    /// Legacy file that was imported.
    pub source: PathBuf,
    /// Backup path the legacy file is renamed to.
    pub backup: PathBuf,
}

/// How [`SqlitePersistenceBackend::import_snapshot`] treats existing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Import into an empty, unmarked store. Row counts are verified before
    /// commit.
    Fresh,
    /// Fold rows into a populated store.
    Merge,
}

/// Result of [`SqlitePersistenceBackend::import_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Rows were written; carries the store's counts after commit.
    Imported(TableCounts),
    /// Another process committed the migration first; nothing was written.
    AlreadyMigrated(MigrationMarker),
}

/// `SQLite`-based persistence backend.
///
/// # Concurrency Model
///
/// Uses a `Mutex<Option<Connection>>` for thread-safe access within a
/// process; each process opens its own connection. `SQLite`'s WAL mode and
/// `busy_timeout` pragma handle cross-process contention:
///
/// - **WAL mode**: concurrent readers with a single writer
/// - **`busy_timeout`**: writers wait for the lock instead of failing
/// - **`BEGIN IMMEDIATE`**: the write lock is taken before the first read of
///   a read-modify-write, so two processes never interleave an upsert
///
/// The connection is `None` once [`close`](PersistenceBackend::close) ran.
pub struct SqlitePersistenceBackend {
    conn: Mutex<Option<Connection>>,
    /// Path to the `SQLite` database (None for in-memory).
    db_path: Option<PathBuf>,
    dimension: Option<usize>,
    edge_policy: EdgePolicy,
}

impl SqlitePersistenceBackend {
    /// Opens (creating if needed) the store at `config.store_path()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OpenError`] if the directory or database cannot be
    /// created, or the schema cannot be initialized, and
    /// [`Error::DimensionMismatch`] if the configured dimension differs from
    /// the stored one.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        Self::open_at(config.store_path(), config)
    }

    /// Opens the store at an explicit path, taking the remaining settings
    /// from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OpenError`] if the database cannot be opened or
    /// initialized, and [`Error::DimensionMismatch`] if the store already
    /// holds vectors of a dimension other than the configured one.
    pub fn open_at(db_path: impl Into<PathBuf>, config: &StorageConfig) -> Result<Self> {
        let db_path = db_path.into();
        let open_error = |cause: String| Error::OpenError {
            path: db_path.display().to_string(),
            cause,
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| open_error(e.to_string()))?;
        }
        let conn = Connection::open(&db_path).map_err(|e| open_error(e.to_string()))?;
        configure_connection(&conn, config.busy_timeout_ms).map_err(|e| open_error(e.to_string()))?;
        initialize(&conn).map_err(|e| open_error(e.to_string()))?;
        verify_dimension(&conn, config.dimension)?;

        tracing::debug!(path = %db_path.display(), "opened sqlite store");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            db_path: Some(db_path),
            dimension: config.dimension,
            edge_policy: config.edge_policy,
        })
    }

    /// Creates an in-memory store (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns [`Error::OpenError`] if the schema cannot be initialized.
    pub fn in_memory(config: &StorageConfig) -> Result<Self> {
        let open_error = |cause: String| Error::OpenError {
            path: ":memory:".to_string(),
            cause,
        };
        let conn = Connection::open_in_memory().map_err(|e| open_error(e.to_string()))?;
        configure_connection(&conn, config.busy_timeout_ms).map_err(|e| open_error(e.to_string()))?;
        initialize(&conn).map_err(|e| open_error(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            db_path: None,
            dimension: config.dimension,
            edge_policy: config.edge_policy,
        })
    }

    /// Returns the database path.
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Returns the configured embedding dimension.
    #[must_use]
    pub const fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Runs `f` against the open connection.
    fn with_conn<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = acquire_lock(&self.conn);
        let conn = guard.as_ref().ok_or_else(|| closed_error(operation))?;
        f(conn)
    }

    /// Runs `f` inside one write transaction.
    fn write<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        self.with_conn(operation, |conn| with_write_transaction(conn, operation, f))
    }

    /// Codec for writes carrying memory records.
    fn memory_codec(&self) -> Result<Codec> {
        self.dimension.map(Codec::new).ok_or_else(|| {
            Error::Configuration(
                "vector dimension is not set; memory records cannot be written".to_string(),
            )
        })
    }

    fn store_label(&self) -> String {
        self.db_path
            .as_ref()
            .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string())
    }

    /// Returns the migration marker, if a legacy import has committed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the store is closed or the
    /// query fails.
    pub fn migration_marker(&self) -> Result<Option<MigrationMarker>> {
        self.with_conn("migration_marker", read_marker)
    }

    /// Records the migration marker on its own, importing nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransactionError`] if the write fails.
    pub fn record_migration_marker(&self, marker: &MigrationMarker) -> Result<()> {
        self.write("record_migration_marker", |conn| write_marker(conn, marker))
    }

    /// Writes every present table of a legacy snapshot in one transaction,
    /// recording `marker` in the same transaction.
    ///
    /// When a marker is given, the transaction first re-checks under the
    /// write lock that no other process migrated in the meantime. In
    /// [`ImportMode::Fresh`] it also requires the store to be empty, then
    /// verifies the stored row counts match the snapshot before committing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AmbiguousMigrationState`] if a fresh import finds a
    /// populated store, [`Error::OperationFailed`] if the counts disagree,
    /// and the usual write errors otherwise. Nothing is written on error.
    #[instrument(skip(self, snapshot, marker), fields(operation = "import_snapshot", backend = BACKEND, mode = ?mode))]
    pub fn import_snapshot(
        &self,
        snapshot: &FullSnapshot,
        mode: ImportMode,
        marker: Option<&MigrationMarker>,
    ) -> Result<ImportOutcome> {
        timed(BACKEND, "import_snapshot", || {
            let codec = self.bulk_codec(snapshot)?;
            let bulk = BulkWrite {
                mode: match mode {
                    ImportMode::Fresh => WriteMode::Import,
                    ImportMode::Merge => WriteMode::Merge,
                },
                codec,
                edge_policy: self.edge_policy,
            };
            self.write("import_snapshot", |conn| {
                if marker.is_some() {
                    if let Some(existing) = read_marker(conn)? {
                        return Ok(ImportOutcome::AlreadyMigrated(existing));
                    }
                }
                if mode == ImportMode::Fresh {
                    if count_rows(conn)?.has_any_rows() {
                        return Err(Error::AmbiguousMigrationState {
                            legacy: marker.map_or_else(
                                || "<legacy>".to_string(),
                                |m| m.source.display().to_string(),
                            ),
                            store: self.store_label(),
                        });
                    }
                }

                claim_dimension_for(conn, snapshot, codec)?;
                bulk.write(conn, snapshot)?;
                if let Some(marker) = marker {
                    write_marker(conn, marker)?;
                }

                let counts = count_rows(conn)?;
                if mode == ImportMode::Fresh {
                    verify_counts(&snapshot.counts(), &counts, snapshot)?;
                }
                Ok(ImportOutcome::Imported(counts))
            })
        })
    }

    /// Codec for a bulk write, required only when memories are present.
    fn bulk_codec(&self, snapshot: &FullSnapshot) -> Result<Option<Codec>> {
        if snapshot.memories.as_ref().is_some_and(|m| !m.is_empty()) {
            self.memory_codec().map(Some)
        } else {
            Ok(self.dimension.map(Codec::new))
        }
    }

    fn load_memories(&self, conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<MemoryRecord>> {
        let mut stmt = conn.prepare_cached(sql).map_err(read_error("load_memories"))?;
        let rows = stmt
            .query_map(args, MemoryRow::from_row)
            .map_err(read_error("load_memories"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(read_error("load_memories"))?;

        let mut memories = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id().to_string();
            match row.into_record(self.dimension) {
                Ok(memory) => memories.push(memory),
                Err(e) => {
                    tracing::warn!(memory.id = %id, error = %e, "skipping corrupt memory record");
                    metrics::counter!("storage_corrupt_records_total", "backend" => BACKEND)
                        .increment(1);
                },
            }
        }
        Ok(memories)
    }
}

fn stored_dimension(conn: &Connection) -> Result<Option<usize>> {
    get_meta(conn, META_DIMENSION)?
        .map(|stored| {
            stored.parse().map_err(|_| Error::CorruptRecord {
                kind: "meta".to_string(),
                reason: format!("dimension '{stored}' is not a number"),
            })
        })
        .transpose()
}

/// Records the configured dimension on first use and rejects a different
/// one afterwards.
fn claim_dimension(conn: &Connection, dimension: usize) -> Result<()> {
    match stored_dimension(conn)? {
        Some(stored) if stored == dimension => Ok(()),
        Some(stored) => Err(Error::DimensionMismatch {
            expected: stored,
            actual: dimension,
        }),
        None => set_meta(conn, META_DIMENSION, &dimension.to_string()),
    }
}

/// Rejects a configured dimension that differs from the one the store's
/// vectors were written with.
fn verify_dimension(conn: &Connection, configured: Option<usize>) -> Result<()> {
    match (stored_dimension(conn)?, configured) {
        (Some(stored), Some(configured)) if stored != configured => {
            Err(Error::DimensionMismatch {
                expected: stored,
                actual: configured,
            })
        },
        _ => Ok(()),
    }
}

fn claim_dimension_for(conn: &Connection, snapshot: &FullSnapshot, codec: Option<Codec>) -> Result<()> {
    let has_embeddings = snapshot
        .memories
        .iter()
        .flatten()
        .any(|m| m.embedding.is_some());
    match codec {
        Some(codec) if has_embeddings => claim_dimension(conn, codec.dimension()),
        _ => Ok(()),
    }
}

fn read_marker(conn: &Connection) -> Result<Option<MigrationMarker>> {
    let Some(completed_at) = get_meta(conn, META_MIGRATION_COMPLETED_AT)? else {
        return Ok(None);
    };
    Ok(Some(MigrationMarker {
        completed_at,
        source: PathBuf::from(get_meta(conn, META_MIGRATION_SOURCE)?.unwrap_or_default()),
        backup: PathBuf::from(get_meta(conn, META_MIGRATION_BACKUP)?.unwrap_or_default()),
    }))
}

fn write_marker(conn: &Connection, marker: &MigrationMarker) -> Result<()> {
    set_meta(conn, META_MIGRATION_COMPLETED_AT, &marker.completed_at)?;
    set_meta(conn, META_MIGRATION_SOURCE, &marker.source.display().to_string())?;
    set_meta(conn, META_MIGRATION_BACKUP, &marker.backup.display().to_string())
}

fn verify_counts(expected: &TableCounts, actual: &TableCounts, snapshot: &FullSnapshot) -> Result<()> {
    // Absent tables were not written, so only present ones are compared.
    let checks = [
        (snapshot.memories.is_some(), "memories", expected.memories, actual.memories),
        (snapshot.value_rows.is_some(), "value_rows", expected.value_rows, actual.value_rows),
        (snapshot.trajectories.is_some(), "trajectories", expected.trajectories, actual.trajectories),
        (
            snapshot.trajectories.is_some(),
            "trajectory_steps",
            expected.trajectory_steps,
            actual.trajectory_steps,
        ),
        (snapshot.edges.is_some(), "edges", expected.edges, actual.edges),
        (snapshot.kv.is_some(), "kv", expected.kv, actual.kv),
        (snapshot.stats.is_some(), "stats", expected.stats, actual.stats),
    ];
    for (present, table, want, got) in checks {
        if present && want != got {
            return Err(Error::OperationFailed {
                operation: "import_snapshot".to_string(),
                cause: format!("{table}: expected {want} rows after import, found {got}"),
            });
        }
    }
    Ok(())
}

impl PersistenceBackend for SqlitePersistenceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Transactional
    }

    #[instrument(skip(self), fields(operation = "load_all", backend = BACKEND))]
    fn load_all(&self) -> Result<FullSnapshot> {
        timed(BACKEND, "load_all", || {
            self.with_conn("load_all", |conn| {
                let op = "load_all";
                let memories = self.load_memories(
                    conn,
                    &format!("SELECT {MEMORY_COLUMNS} FROM memories ORDER BY created_at, rowid"),
                    &[],
                )?;

                let value_rows = conn
                    .prepare(&format!(
                        "SELECT {VALUE_ROW_COLUMNS} FROM value_rows
                         ORDER BY algorithm_id, state_key, action_key"
                    ))
                    .and_then(|mut stmt| {
                        stmt.query_map([], value_row_from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()
                    })
                    .map_err(read_error(op))?;

                let mut trajectories = conn
                    .prepare(&format!(
                        "SELECT {TRAJECTORY_COLUMNS} FROM trajectories ORDER BY started_at, id"
                    ))
                    .and_then(|mut stmt| {
                        stmt.query_map([], trajectory_header_from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()
                    })
                    .map_err(read_error(op))?;
                for trajectory in &mut trajectories {
                    trajectory.steps = load_steps(conn, trajectory.id.as_str())?;
                }

                let edges = conn
                    .prepare("SELECT file_a, file_b, weight FROM edges ORDER BY file_a, file_b")
                    .and_then(|mut stmt| {
                        stmt.query_map([], edge_from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()
                    })
                    .map_err(read_error(op))?;

                let kv = conn
                    .prepare("SELECT key, value, updated_at FROM kv ORDER BY key")
                    .and_then(|mut stmt| {
                        stmt.query_map([], kv_from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()
                    })
                    .map_err(read_error(op))?;

                let stats = read_stats(conn)?;

                Ok(FullSnapshot {
                    memories: Some(memories),
                    value_rows: Some(value_rows),
                    trajectories: Some(trajectories),
                    edges: Some(edges),
                    kv: Some(kv),
                    stats: Some(stats),
                })
            })
        })
    }

    #[instrument(skip(self, snapshot), fields(operation = "save_all", backend = BACKEND, tables = snapshot.presence_mask()))]
    fn save_all(&self, snapshot: &FullSnapshot) -> Result<()> {
        timed(BACKEND, "save_all", || {
            let codec = self.bulk_codec(snapshot)?;
            let bulk = BulkWrite {
                mode: WriteMode::Replace,
                codec,
                edge_policy: self.edge_policy,
            };
            self.write("save_all", |conn| {
                claim_dimension_for(conn, snapshot, codec)?;
                bulk.write(conn, snapshot)
            })
        })
    }

    #[instrument(skip(self, memory), fields(operation = "add_memory", backend = BACKEND, memory.id = %memory.id))]
    fn add_memory(&self, memory: &MemoryRecord) -> Result<bool> {
        timed(BACKEND, "add_memory", || {
            require_non_empty("memory id", memory.id.as_str())?;
            let codec = self.memory_codec()?;
            let blob = memory
                .embedding
                .as_deref()
                .map(|e| codec.encode_vector(e))
                .transpose()?;

            self.write("add_memory", |conn| {
                if blob.is_some() {
                    claim_dimension(conn, codec.dimension())?;
                }
                let inserted = conn
                    .execute(
                        "INSERT INTO memories (id, content, kind, embedding, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT (id) DO NOTHING",
                        params![
                            memory.id.as_str(),
                            memory.content,
                            memory.kind,
                            blob,
                            memory.created_at
                        ],
                    )
                    .map_err(tx_error("add_memory"))?;
                if inserted == 0 {
                    tracing::debug!("memory already present");
                    return Ok(false);
                }
                bump_stat(conn, StatCounter::TotalMemories, 1)?;
                Ok(true)
            })
        })
    }

    #[instrument(skip(self), fields(operation = "upsert_value_row", backend = BACKEND, key = %key))]
    fn upsert_value_row(&self, key: &ValueKey, value: f64) -> Result<ValueTableRow> {
        timed(BACKEND, "upsert_value_row", || {
            require_non_empty("algorithm_id", &key.algorithm_id)?;
            require_non_empty("state_key", &key.state_key)?;
            require_non_empty("action_key", &key.action_key)?;
            require_finite("value", value)?;

            self.write("upsert_value_row", |conn| {
                let op = "upsert_value_row";
                let existed = conn
                    .prepare_cached(
                        "SELECT 1 FROM value_rows
                         WHERE algorithm_id = ?1 AND state_key = ?2 AND action_key = ?3",
                    )
                    .and_then(|mut stmt| {
                        stmt.exists(params![key.algorithm_id, key.state_key, key.action_key])
                    })
                    .map_err(tx_error(op))?;

                let row = conn
                    .query_row(
                        &format!(
                            "INSERT INTO value_rows
                                 (algorithm_id, state_key, action_key, value, visit_count)
                             VALUES (?1, ?2, ?3, ?4, 1)
                             ON CONFLICT (algorithm_id, state_key, action_key) DO UPDATE SET
                                 value = excluded.value,
                                 visit_count = value_rows.visit_count + 1
                             RETURNING {VALUE_ROW_COLUMNS}"
                        ),
                        params![key.algorithm_id, key.state_key, key.action_key, value],
                        value_row_from_row,
                    )
                    .map_err(tx_error(op))?;

                if !existed {
                    bump_stat(conn, StatCounter::TotalPatterns, 1)?;
                }
                Ok(row)
            })
        })
    }

    #[instrument(skip(self, trajectory), fields(operation = "begin_trajectory", backend = BACKEND, trajectory.id = %trajectory.id))]
    fn begin_trajectory(&self, trajectory: &Trajectory) -> Result<()> {
        timed(BACKEND, "begin_trajectory", || {
            require_non_empty("trajectory id", trajectory.id.as_str())?;
            if trajectory.is_sealed() || !trajectory.steps.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "trajectory '{}' must begin open and without steps",
                    trajectory.id
                )));
            }

            self.write("begin_trajectory", |conn| {
                let inserted = conn
                    .execute(
                        "INSERT INTO trajectories (id, context, agent, terminal_quality, started_at, ended_at)
                         VALUES (?1, ?2, ?3, NULL, ?4, NULL)
                         ON CONFLICT (id) DO NOTHING",
                        params![
                            trajectory.id.as_str(),
                            trajectory.context,
                            trajectory.agent,
                            trajectory.started_at
                        ],
                    )
                    .map_err(tx_error("begin_trajectory"))?;
                if inserted > 0 {
                    bump_stat(conn, StatCounter::TotalTrajectories, 1)?;
                }
                Ok(())
            })
        })
    }

    #[instrument(skip(self, step), fields(operation = "append_trajectory_step", backend = BACKEND, trajectory.id = %id))]
    fn append_trajectory_step(&self, id: &TrajectoryId, step: &TrajectoryStep) -> Result<usize> {
        timed(BACKEND, "append_trajectory_step", || {
            require_finite("reward", step.reward)?;

            self.write("append_trajectory_step", |conn| {
                let op = "append_trajectory_step";
                let ended_at: Option<Option<i64>> = conn
                    .query_row(
                        "SELECT ended_at FROM trajectories WHERE id = ?1",
                        params![id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(tx_error(op))?;
                match ended_at {
                    None => return Err(Error::NotFound(format!("trajectory '{id}'"))),
                    Some(Some(_)) => {
                        return Err(Error::InvalidInput(format!(
                            "trajectory '{id}' is sealed"
                        )));
                    },
                    Some(None) => {},
                }

                let next: i64 = conn
                    .query_row(
                        "SELECT COALESCE(MAX(step_index) + 1, 0) FROM trajectory_steps
                         WHERE trajectory_id = ?1",
                        params![id.as_str()],
                        |row| row.get(0),
                    )
                    .map_err(tx_error(op))?;
                conn.execute(
                    "INSERT INTO trajectory_steps (trajectory_id, step_index, action, result, reward)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id.as_str(), next, step.action, step.result, step.reward],
                )
                .map_err(tx_error(op))?;

                usize::try_from(next).map_err(|_| Error::CorruptRecord {
                    kind: "trajectory_step".to_string(),
                    reason: format!("step index {next} out of range"),
                })
            })
        })
    }

    #[instrument(skip(self), fields(operation = "seal_trajectory", backend = BACKEND, trajectory.id = %id))]
    fn seal_trajectory(&self, id: &TrajectoryId, quality: f64) -> Result<()> {
        timed(BACKEND, "seal_trajectory", || {
            require_finite("quality", quality)?;

            self.write("seal_trajectory", |conn| {
                let op = "seal_trajectory";
                let ended_at: Option<Option<i64>> = conn
                    .query_row(
                        "SELECT ended_at FROM trajectories WHERE id = ?1",
                        params![id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(tx_error(op))?;
                match ended_at {
                    None => Err(Error::NotFound(format!("trajectory '{id}'"))),
                    Some(Some(_)) => Err(Error::InvalidInput(format!(
                        "trajectory '{id}' is already sealed"
                    ))),
                    Some(None) => {
                        conn.execute(
                            "UPDATE trajectories SET terminal_quality = ?2, ended_at = ?3
                             WHERE id = ?1",
                            params![id.as_str(), quality, crate::current_timestamp_ms()],
                        )
                        .map_err(tx_error(op))?;
                        Ok(())
                    },
                }
            })
        })
    }

    #[instrument(skip(self), fields(operation = "increment_edge", backend = BACKEND))]
    fn increment_edge(&self, file_a: &str, file_b: &str, delta: u64) -> Result<u64> {
        timed(BACKEND, "increment_edge", || {
            validate_edge(file_a, file_b, delta)?;
            let delta = to_sql_count(delta, "edge delta")?;
            let (a, b) = self.edge_policy.normalize(file_a, file_b);

            self.write("increment_edge", |conn| {
                let op = "increment_edge";
                let existed = conn
                    .prepare_cached("SELECT 1 FROM edges WHERE file_a = ?1 AND file_b = ?2")
                    .and_then(|mut stmt| stmt.exists(params![a, b]))
                    .map_err(tx_error(op))?;
                let weight: i64 = conn
                    .query_row(
                        "INSERT INTO edges (file_a, file_b, weight) VALUES (?1, ?2, ?3)
                         ON CONFLICT (file_a, file_b) DO UPDATE SET weight = edges.weight + excluded.weight
                         RETURNING weight",
                        params![a, b, delta],
                        |row| row.get(0),
                    )
                    .map_err(tx_error(op))?;
                if !existed {
                    bump_stat(conn, StatCounter::TotalEdges, 1)?;
                }
                Ok(from_sql_count(weight))
            })
        })
    }

    #[instrument(skip(self, value), fields(operation = "set_kv", backend = BACKEND))]
    fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        timed(BACKEND, "set_kv", || {
            require_non_empty("kv key", key)?;
            self.write("set_kv", |conn| {
                conn.execute(
                    "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                         updated_at = excluded.updated_at",
                    params![key, value, crate::current_timestamp_ms()],
                )
                .map_err(tx_error("set_kv"))?;
                Ok(())
            })
        })
    }

    #[instrument(skip(self), fields(operation = "increment_stat", backend = BACKEND, counter = %counter))]
    fn increment_stat(&self, counter: StatCounter, delta: u64) -> Result<u64> {
        timed(BACKEND, "increment_stat", || {
            self.write("increment_stat", |conn| bump_stat(conn, counter, delta))
        })
    }

    #[instrument(skip(self), fields(operation = "get_memory", backend = BACKEND, memory.id = %id))]
    fn get_memory(&self, id: &MemoryId) -> Result<Option<MemoryRecord>> {
        timed(BACKEND, "get_memory", || {
            self.with_conn("get_memory", |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                        params![id.as_str()],
                        MemoryRow::from_row,
                    )
                    .optional()
                    .map_err(read_error("get_memory"))?;
                row.map(|r| r.into_record(self.dimension)).transpose()
            })
        })
    }

    #[instrument(skip(self), fields(operation = "recent_memories", backend = BACKEND))]
    fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        timed(BACKEND, "recent_memories", || {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            self.with_conn("recent_memories", |conn| {
                self.load_memories(
                    conn,
                    &format!(
                        "SELECT {MEMORY_COLUMNS} FROM memories
                         ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                    ),
                    &[&limit as &dyn rusqlite::ToSql],
                )
            })
        })
    }

    #[instrument(skip(self, query), fields(operation = "search_similar", backend = BACKEND))]
    fn search_similar(&self, query: &[f32], limit: usize) -> Result<Vec<MemoryResult>> {
        timed(BACKEND, "search_similar", || {
            if let Some(dimension) = self.dimension {
                Codec::new(dimension).check_dimension(query)?;
            }
            self.with_conn("search_similar", |conn| {
                let candidates = self.load_memories(
                    conn,
                    &format!(
                        "SELECT {MEMORY_COLUMNS} FROM memories
                         WHERE embedding IS NOT NULL ORDER BY created_at DESC, rowid DESC"
                    ),
                    &[],
                )?;
                Ok(rank_by_similarity(candidates, query, limit))
            })
        })
    }

    #[instrument(skip(self), fields(operation = "get_value_row", backend = BACKEND, key = %key))]
    fn get_value_row(&self, key: &ValueKey) -> Result<Option<ValueTableRow>> {
        timed(BACKEND, "get_value_row", || {
            self.with_conn("get_value_row", |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {VALUE_ROW_COLUMNS} FROM value_rows
                         WHERE algorithm_id = ?1 AND state_key = ?2 AND action_key = ?3"
                    ),
                    params![key.algorithm_id, key.state_key, key.action_key],
                    value_row_from_row,
                )
                .optional()
                .map_err(read_error("get_value_row"))
            })
        })
    }

    #[instrument(skip(self), fields(operation = "value_rows_for_state", backend = BACKEND))]
    fn value_rows_for_state(
        &self,
        algorithm_id: &str,
        state_key: &str,
    ) -> Result<Vec<ValueTableRow>> {
        timed(BACKEND, "value_rows_for_state", || {
            self.with_conn("value_rows_for_state", |conn| {
                conn.prepare_cached(&format!(
                    "SELECT {VALUE_ROW_COLUMNS} FROM value_rows
                     WHERE algorithm_id = ?1 AND state_key = ?2
                     ORDER BY value DESC, action_key"
                ))
                .and_then(|mut stmt| {
                    stmt.query_map(params![algorithm_id, state_key], value_row_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                })
                .map_err(read_error("value_rows_for_state"))
            })
        })
    }

    #[instrument(skip(self), fields(operation = "get_trajectory", backend = BACKEND, trajectory.id = %id))]
    fn get_trajectory(&self, id: &TrajectoryId) -> Result<Option<Trajectory>> {
        timed(BACKEND, "get_trajectory", || {
            self.with_conn("get_trajectory", |conn| load_trajectory(conn, id.as_str()))
        })
    }

    #[instrument(skip(self), fields(operation = "edge_weight", backend = BACKEND))]
    fn edge_weight(&self, file_a: &str, file_b: &str) -> Result<u64> {
        timed(BACKEND, "edge_weight", || {
            let (a, b) = self.edge_policy.normalize(file_a, file_b);
            self.with_conn("edge_weight", |conn| {
                let weight: Option<i64> = conn
                    .query_row(
                        "SELECT weight FROM edges WHERE file_a = ?1 AND file_b = ?2",
                        params![a, b],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(read_error("edge_weight"))?;
                Ok(weight.map_or(0, from_sql_count))
            })
        })
    }

    #[instrument(skip(self), fields(operation = "edges_from", backend = BACKEND))]
    fn edges_from(&self, file: &str) -> Result<Vec<Edge>> {
        timed(BACKEND, "edges_from", || {
            let sql = match self.edge_policy {
                EdgePolicy::Directed => {
                    "SELECT file_a, file_b, weight FROM edges WHERE file_a = ?1
                     ORDER BY weight DESC, file_b"
                },
                EdgePolicy::Symmetric => {
                    "SELECT file_a, file_b, weight FROM edges WHERE file_a = ?1 OR file_b = ?1
                     ORDER BY weight DESC, file_a, file_b"
                },
            };
            self.with_conn("edges_from", |conn| {
                conn.prepare_cached(sql)
                    .and_then(|mut stmt| {
                        stmt.query_map(params![file], edge_from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()
                    })
                    .map_err(read_error("edges_from"))
            })
        })
    }

    #[instrument(skip(self), fields(operation = "get_kv", backend = BACKEND))]
    fn get_kv(&self, key: &str) -> Result<Option<KvEntry>> {
        timed(BACKEND, "get_kv", || {
            self.with_conn("get_kv", |conn| {
                conn.query_row(
                    "SELECT key, value, updated_at FROM kv WHERE key = ?1",
                    params![key],
                    kv_from_row,
                )
                .optional()
                .map_err(read_error("get_kv"))
            })
        })
    }

    #[instrument(skip(self), fields(operation = "get_stat", backend = BACKEND, counter = %counter))]
    fn get_stat(&self, counter: StatCounter) -> Result<u64> {
        timed(BACKEND, "get_stat", || {
            self.with_conn("get_stat", |conn| {
                let value: Option<i64> = conn
                    .query_row(
                        "SELECT value FROM stats WHERE name = ?1",
                        params![counter.as_str()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(read_error("get_stat"))?;
                Ok(value.map_or(0, from_sql_count))
            })
        })
    }

    #[instrument(skip(self), fields(operation = "stats", backend = BACKEND))]
    fn stats(&self) -> Result<BTreeMap<StatCounter, u64>> {
        timed(BACKEND, "stats", || self.with_conn("stats", read_stats))
    }

    #[instrument(skip(self), fields(operation = "counts", backend = BACKEND))]
    fn counts(&self) -> Result<TableCounts> {
        timed(BACKEND, "counts", || self.with_conn("counts", count_rows))
    }

    #[instrument(skip(self), fields(operation = "close", backend = BACKEND))]
    fn close(&self) -> Result<()> {
        let mut guard = acquire_lock(&self.conn);
        if let Some(conn) = guard.take() {
            // Fold the WAL back into the main file; a busy checkpoint is fine.
            let _ = conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()));
            conn.close().map_err(|(_, e)| Error::OperationFailed {
                operation: "close".to_string(),
                cause: e.to_string(),
            })?;
            tracing::debug!("closed sqlite store");
        }
        Ok(())
    }
}

/// Reads every known counter; unknown names are ignored.
fn read_stats(conn: &Connection) -> Result<BTreeMap<StatCounter, u64>> {
    let rows = conn
        .prepare("SELECT name, value FROM stats")
        .and_then(|mut stmt| {
            stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .map_err(read_error("stats"))?;
    Ok(rows
        .into_iter()
        .filter_map(|(name, value)| {
            StatCounter::parse(&name).map(|counter| (counter, from_sql_count(value)))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig::new().with_dimension(3)
    }

    fn backend() -> SqlitePersistenceBackend {
        SqlitePersistenceBackend::in_memory(&config()).unwrap()
    }

    #[test]
    fn test_add_memory_dedups_by_id() {
        let backend = backend();
        let memory = MemoryRecord::new("hello", "note", Some(vec![0.1, 0.2, 0.3])).with_id("m1");

        assert!(backend.add_memory(&memory).unwrap());
        assert!(!backend.add_memory(&memory).unwrap());

        assert_eq!(backend.get_stat(StatCounter::TotalMemories).unwrap(), 1);
        assert_eq!(backend.get_memory(&MemoryId::new("m1")).unwrap(), Some(memory));
    }

    #[test]
    fn test_add_memory_rejects_wrong_dimension() {
        let backend = backend();
        let memory = MemoryRecord::new("hello", "note", Some(vec![0.1, 0.2]));

        let err = backend.add_memory(&memory).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert_eq!(backend.counts().unwrap().memories, 0);
        assert_eq!(backend.get_stat(StatCounter::TotalMemories).unwrap(), 0);
    }

    #[test]
    fn test_add_memory_without_dimension_is_configuration_error() {
        let backend = SqlitePersistenceBackend::in_memory(&StorageConfig::new()).unwrap();
        let err = backend
            .add_memory(&MemoryRecord::new("hello", "note", None))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_upsert_value_row_counts_visits() {
        let backend = backend();
        let key = ValueKey::new("q", "state", "action");

        let first = backend.upsert_value_row(&key, 0.5).unwrap();
        assert_eq!(first.visit_count, 1);
        let second = backend.upsert_value_row(&key, 0.9).unwrap();
        assert_eq!(second.visit_count, 2);
        assert!((second.value - 0.9).abs() < f64::EPSILON);

        assert_eq!(backend.counts().unwrap().value_rows, 1);
        assert_eq!(backend.get_stat(StatCounter::TotalPatterns).unwrap(), 1);
    }

    #[test]
    fn test_value_rows_for_state_sorted_by_value() {
        let backend = backend();
        backend
            .upsert_value_row(&ValueKey::new("q", "s", "low"), 0.1)
            .unwrap();
        backend
            .upsert_value_row(&ValueKey::new("q", "s", "high"), 0.8)
            .unwrap();
        backend
            .upsert_value_row(&ValueKey::new("q", "other", "x"), 1.0)
            .unwrap();

        let rows = backend.value_rows_for_state("q", "s").unwrap();
        let actions: Vec<_> = rows.iter().map(|r| r.action_key.as_str()).collect();
        assert_eq!(actions, vec!["high", "low"]);
    }

    #[test]
    fn test_trajectory_lifecycle() {
        let backend = backend();
        let trajectory = Trajectory::begin("ctx", "agent");
        let id = trajectory.id.clone();

        backend.begin_trajectory(&trajectory).unwrap();
        backend.begin_trajectory(&trajectory).unwrap();
        assert_eq!(backend.get_stat(StatCounter::TotalTrajectories).unwrap(), 1);

        let step = TrajectoryStep::new("edit", "ok", 0.5);
        assert_eq!(backend.append_trajectory_step(&id, &step).unwrap(), 0);
        assert_eq!(backend.append_trajectory_step(&id, &step).unwrap(), 1);

        backend.seal_trajectory(&id, 0.75).unwrap();
        let err = backend.append_trajectory_step(&id, &step).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let err = backend.seal_trajectory(&id, 0.1).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let stored = backend.get_trajectory(&id).unwrap().unwrap();
        assert_eq!(stored.steps.len(), 2);
        assert_eq!(stored.terminal_quality, Some(0.75));
        assert!(stored.is_sealed());
    }

    #[test]
    fn test_append_to_missing_trajectory_is_not_found() {
        let backend = backend();
        let err = backend
            .append_trajectory_step(
                &TrajectoryId::new("missing"),
                &TrajectoryStep::new("a", "b", 0.0),
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_symmetric_edges_share_a_row() {
        let backend = backend();
        assert_eq!(backend.increment_edge("b.rs", "a.rs", 1).unwrap(), 1);
        assert_eq!(backend.increment_edge("a.rs", "b.rs", 2).unwrap(), 3);

        assert_eq!(backend.edge_weight("b.rs", "a.rs").unwrap(), 3);
        assert_eq!(backend.get_stat(StatCounter::TotalEdges).unwrap(), 1);

        let edges = backend.edges_from("b.rs").unwrap();
        assert_eq!(edges, vec![Edge::new("a.rs", "b.rs", 3)]);
    }

    #[test]
    fn test_directed_edges_are_distinct() {
        let config = config().with_edge_policy(EdgePolicy::Directed);
        let backend = SqlitePersistenceBackend::in_memory(&config).unwrap();
        backend.increment_edge("b.rs", "a.rs", 1).unwrap();
        backend.increment_edge("a.rs", "b.rs", 1).unwrap();

        assert_eq!(backend.counts().unwrap().edges, 2);
        assert_eq!(backend.edges_from("a.rs").unwrap().len(), 1);
    }

    #[test]
    fn test_kv_last_writer_wins() {
        let backend = backend();
        backend.set_kv("last_touched_file", "a.rs").unwrap();
        backend.set_kv("last_touched_file", "b.rs").unwrap();
        assert_eq!(
            backend.get_kv("last_touched_file").unwrap().unwrap().value,
            "b.rs"
        );
        assert!(backend.set_kv("", "x").is_err());
    }

    #[test]
    fn test_search_similar_ranks_by_cosine() {
        let backend = backend();
        backend
            .add_memory(&MemoryRecord::new("near", "note", Some(vec![1.0, 0.0, 0.0])).with_id("near"))
            .unwrap();
        backend
            .add_memory(&MemoryRecord::new("far", "note", Some(vec![0.0, 1.0, 0.0])).with_id("far"))
            .unwrap();
        backend
            .add_memory(&MemoryRecord::new("plain", "note", None).with_id("plain"))
            .unwrap();

        let results = backend.search_similar(&[0.9, 0.1, 0.0], 5).unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.memory.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);

        assert!(matches!(
            backend.search_similar(&[1.0], 5),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_save_all_leaves_absent_tables_untouched() {
        let backend = backend();
        backend
            .add_memory(&MemoryRecord::new("keep me", "note", None).with_id("m1"))
            .unwrap();
        backend.set_kv("old", "value").unwrap();

        let snapshot = FullSnapshot {
            kv: Some(vec![KvEntry::new("new", "value")]),
            ..FullSnapshot::default()
        };
        backend.save_all(&snapshot).unwrap();

        assert!(backend.get_memory(&MemoryId::new("m1")).unwrap().is_some());
        assert!(backend.get_kv("old").unwrap().is_none());
        assert!(backend.get_kv("new").unwrap().is_some());
    }

    #[test]
    fn test_save_all_stats_upserts_and_drops_missing_counters() {
        let backend = backend();
        backend
            .add_memory(&MemoryRecord::new("m", "note", None))
            .unwrap();
        backend.increment_stat(StatCounter::SessionCount, 3).unwrap();

        let snapshot = FullSnapshot {
            stats: Some(BTreeMap::from([(StatCounter::SessionCount, 7)])),
            ..FullSnapshot::default()
        };
        backend.save_all(&snapshot).unwrap();

        assert_eq!(
            backend.stats().unwrap(),
            BTreeMap::from([(StatCounter::SessionCount, 7)])
        );
        assert_eq!(backend.counts().unwrap().memories, 1);
    }

    #[test]
    fn test_open_rejects_other_dimension_than_stored() {
        let dir = tempfile::TempDir::new().unwrap();
        let narrow = StorageConfig::new().with_path(dir.path()).with_dimension(3);
        {
            let backend = SqlitePersistenceBackend::open(&narrow).unwrap();
            backend
                .add_memory(&MemoryRecord::new("m", "note", Some(vec![0.1, 0.2, 0.3])))
                .unwrap();
            backend.close().unwrap();
        }

        let wide = narrow.clone().with_dimension(8);
        assert!(matches!(
            SqlitePersistenceBackend::open(&wide),
            Err(Error::DimensionMismatch {
                expected: 3,
                actual: 8
            })
        ));
        // Without a configured dimension the store still opens for reads.
        assert!(SqlitePersistenceBackend::open(&StorageConfig::new().with_path(dir.path())).is_ok());
    }

    #[test]
    fn test_load_all_then_save_all_is_stable() {
        let backend = backend();
        backend
            .add_memory(&MemoryRecord::new("m", "note", Some(vec![0.1, 0.2, 0.3])))
            .unwrap();
        backend
            .upsert_value_row(&ValueKey::new("q", "s", "a"), 0.4)
            .unwrap();
        backend.increment_edge("a.rs", "b.rs", 2).unwrap();

        let before = backend.load_all().unwrap();
        backend.save_all(&before).unwrap();
        assert_eq!(backend.load_all().unwrap(), before);
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_later_calls() {
        let backend = backend();
        backend.close().unwrap();
        backend.close().unwrap();

        let err = backend.get_stat(StatCounter::SessionCount).unwrap_err();
        assert!(matches!(err, Error::OperationFailed { .. }));
    }

    #[test]
    fn test_fresh_import_refuses_populated_store() {
        let backend = backend();
        backend.set_kv("k", "v").unwrap();

        let err = backend
            .import_snapshot(&FullSnapshot::empty(), ImportMode::Fresh, None)
            .unwrap_err();
        assert!(matches!(err, Error::AmbiguousMigrationState { .. }));
    }

    #[test]
    fn test_fresh_import_refuses_counter_only_store() {
        let backend = backend();
        backend.increment_stat(StatCounter::SessionCount, 5).unwrap();

        let mut snapshot = FullSnapshot::empty();
        snapshot.stats = Some(BTreeMap::from([(StatCounter::SessionCount, 9)]));
        let err = backend
            .import_snapshot(&snapshot, ImportMode::Fresh, None)
            .unwrap_err();
        assert!(matches!(err, Error::AmbiguousMigrationState { .. }));
        assert_eq!(backend.get_stat(StatCounter::SessionCount).unwrap(), 5);
    }

    #[test]
    fn test_fresh_import_records_marker() {
        let backend = backend();
        let mut snapshot = FullSnapshot::empty();
        snapshot.kv = Some(vec![KvEntry::new("k", "v")]);
        snapshot.stats = Some(BTreeMap::from([(StatCounter::SessionCount, 4)]));
        let marker = MigrationMarker {
            completed_at: "2026-01-01T00:00:00Z".to_string(),
            source: PathBuf::from("intelligence.json"),
            backup: PathBuf::from("intelligence.json.bak-20260101T000000Z"),
        };

        let outcome = backend
            .import_snapshot(&snapshot, ImportMode::Fresh, Some(&marker))
            .unwrap();
        assert!(matches!(outcome, ImportOutcome::Imported(counts) if counts.kv == 1));
        assert_eq!(backend.migration_marker().unwrap(), Some(marker.clone()));
        assert_eq!(backend.get_stat(StatCounter::SessionCount).unwrap(), 4);

        let again = backend
            .import_snapshot(&snapshot, ImportMode::Fresh, Some(&marker))
            .unwrap();
        assert_eq!(again, ImportOutcome::AlreadyMigrated(marker));
    }
}
