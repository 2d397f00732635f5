//! Persistence backend trait.

use crate::Result;
use crate::config::BackendKind;
use crate::models::{
    Edge, FullSnapshot, KvEntry, MemoryId, MemoryRecord, MemoryResult, StatCounter, TableCounts,
    Trajectory, TrajectoryId, TrajectoryStep, ValueKey, ValueTableRow,
};
use std::collections::BTreeMap;

/// Trait for persistence layer backends.
///
/// Backends are the authoritative store for intelligence state. Callers
/// hold a `dyn PersistenceBackend` and never learn which implementation
/// is active.
///
/// # Incremental writes
///
/// Every mutating method other than [`save_all`](Self::save_all) is
/// incremental: it changes exactly the rows it names and, where noted,
/// bumps the matching counter in the same atomic unit.
///
/// # Errors
///
/// All methods return [`Error::OperationFailed`](crate::Error::OperationFailed)
/// once [`close`](Self::close) has been called.
pub trait PersistenceBackend: Send + Sync {
    /// Returns which implementation this is.
    fn kind(&self) -> BackendKind;

    /// Loads every table. Corrupt records are skipped and logged.
    fn load_all(&self) -> Result<FullSnapshot>;

    /// Writes every table present in the snapshot.
    ///
    /// Present tables replace their stored counterparts (rows absent from
    /// the snapshot are removed). Absent tables are left untouched.
    fn save_all(&self, snapshot: &FullSnapshot) -> Result<()>;

    /// Adds a memory record.
    ///
    /// The record ID is the deduplication key: re-adding an existing ID is a
    /// no-op that returns `false` and does not bump `total_memories`.
    fn add_memory(&self, memory: &MemoryRecord) -> Result<bool>;

    /// Records an observation for a value-table key.
    ///
    /// Inserts with `visit_count = 1`, otherwise sets the value to the new
    /// observation and increments `visit_count`. Bumps `total_patterns` on
    /// first sight of the key.
    fn upsert_value_row(&self, key: &ValueKey, value: f64) -> Result<ValueTableRow>;

    /// Starts a trajectory. Idempotent by ID; bumps `total_trajectories`
    /// when the trajectory is new.
    fn begin_trajectory(&self, trajectory: &Trajectory) -> Result<()>;

    /// Appends a step and returns its index.
    ///
    /// Not idempotent: a blind retry after an ambiguous failure may append
    /// the step twice.
    fn append_trajectory_step(&self, id: &TrajectoryId, step: &TrajectoryStep) -> Result<usize>;

    /// Seals a trajectory with a terminal quality.
    fn seal_trajectory(&self, id: &TrajectoryId, quality: f64) -> Result<()>;

    /// Adds `delta` to an edge weight and returns the new weight.
    fn increment_edge(&self, file_a: &str, file_b: &str, delta: u64) -> Result<u64>;

    /// Sets a key-value entry (last writer wins).
    fn set_kv(&self, key: &str, value: &str) -> Result<()>;

    /// Adds `delta` to a counter and returns the new value.
    fn increment_stat(&self, counter: StatCounter, delta: u64) -> Result<u64>;

    /// Gets a memory by ID.
    fn get_memory(&self, id: &MemoryId) -> Result<Option<MemoryRecord>>;

    /// Returns the most recently created memories, newest first.
    fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>>;

    /// Finds memories whose embeddings are most similar to `query`.
    ///
    /// Records without an embedding never match.
    fn search_similar(&self, query: &[f32], limit: usize) -> Result<Vec<MemoryResult>>;

    /// Gets a value-table row.
    fn get_value_row(&self, key: &ValueKey) -> Result<Option<ValueTableRow>>;

    /// Returns every action row for a state, highest value first.
    fn value_rows_for_state(&self, algorithm_id: &str, state_key: &str)
    -> Result<Vec<ValueTableRow>>;

    /// Gets a trajectory with its steps in append order.
    fn get_trajectory(&self, id: &TrajectoryId) -> Result<Option<Trajectory>>;

    /// Returns an edge weight, or zero if the edge does not exist.
    fn edge_weight(&self, file_a: &str, file_b: &str) -> Result<u64>;

    /// Returns every edge touching `file`, heaviest first.
    fn edges_from(&self, file: &str) -> Result<Vec<Edge>>;

    /// Gets a key-value entry.
    fn get_kv(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Returns a counter value, or zero if it was never written.
    fn get_stat(&self, counter: StatCounter) -> Result<u64>;

    /// Returns every known counter.
    fn stats(&self) -> Result<BTreeMap<StatCounter, u64>> {
        let mut stats = BTreeMap::new();
        for counter in StatCounter::ALL {
            stats.insert(counter, self.get_stat(counter)?);
        }
        Ok(stats)
    }

    /// Returns per-table row counts.
    fn counts(&self) -> Result<TableCounts>;

    /// Flushes and releases the backend. Idempotent.
    fn close(&self) -> Result<()>;
}
