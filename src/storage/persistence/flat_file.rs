//! Legacy flat-file persistence backend.
//!
//! The whole state lives in one JSON document (`intelligence.json`). Every
//! mutation updates a copy of the in-memory document and rewrites the entire
//! file with a plain truncate-and-write.
//!
//! # Limitations
//!
//! - A crash during the rewrite can leave a truncated or empty file; the
//!   next open then starts from empty state.
//! - Concurrent writers from different processes overwrite each other
//!   (last rewrite wins, earlier updates are lost).
//!
//! These are the reasons the transactional backend exists. This backend is
//! kept as the migration source and as the fallback when the transactional
//! store cannot be used.

use super::flat_document::{parse_document, render_document};
use super::{closed_error, require_finite, require_non_empty, validate_edge};
use crate::config::{BackendKind, EdgePolicy, StorageConfig};
use crate::models::{
    CompleteSnapshot, Edge, FullSnapshot, KvEntry, MemoryId, MemoryRecord, MemoryResult,
    StatCounter, TableCounts, Trajectory, TrajectoryId, TrajectoryStep, ValueKey, ValueTableRow,
};
use crate::observability::timed;
use crate::storage::similarity::rank_by_similarity;
use crate::storage::sqlite::acquire_lock;
use crate::storage::traits::PersistenceBackend;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::instrument;

const BACKEND: &str = "flat_file";

/// Legacy flat-file backend.
pub struct FlatFileBackend {
    path: PathBuf,
    /// Current document; `None` once closed.
    state: Mutex<Option<CompleteSnapshot>>,
    dimension: Option<usize>,
    edge_policy: EdgePolicy,
    skipped_on_load: usize,
}

impl FlatFileBackend {
    /// Opens the document at `config.legacy_file_path()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OpenError`] if the file exists but cannot be read or
    /// is not a JSON object.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        Self::open_at(config.legacy_file_path(), config)
    }

    /// Opens the document at an explicit path.
    ///
    /// A missing file is empty state; it is created on the first write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OpenError`] if the file exists but cannot be read or
    /// is not a JSON object.
    pub fn open_at(path: impl Into<PathBuf>, config: &StorageConfig) -> Result<Self> {
        let path = path.into();
        let open_error = |cause: String| Error::OpenError {
            path: path.display().to_string(),
            cause,
        };

        let (state, skipped) = if path.exists() {
            let bytes = fs::read(&path).map_err(|e| open_error(e.to_string()))?;
            let parsed = parse_document(&bytes, config.dimension, config.edge_policy)
                .map_err(|e| open_error(e.to_string()))?;
            (parsed.snapshot, parsed.skipped)
        } else {
            (CompleteSnapshot::default(), 0)
        };

        tracing::debug!(path = %path.display(), skipped, "opened flat-file store");
        Ok(Self {
            path,
            state: Mutex::new(Some(state)),
            dimension: config.dimension,
            edge_policy: config.edge_policy,
            skipped_on_load: skipped,
        })
    }

    /// Returns the document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of malformed entries skipped when the document was opened.
    #[must_use]
    pub const fn skipped_on_load(&self) -> usize {
        self.skipped_on_load
    }

    /// Runs `f` against the current document.
    fn read<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(&CompleteSnapshot) -> Result<T>,
    {
        let guard = acquire_lock(&self.state);
        let state = guard.as_ref().ok_or_else(|| closed_error(operation))?;
        f(state)
    }

    /// Applies `f` to a copy of the document, rewrites the file, then
    /// publishes the copy. A failed write leaves the in-memory state as it
    /// was.
    fn mutate<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut CompleteSnapshot) -> Result<T>,
    {
        let mut guard = acquire_lock(&self.state);
        let state = guard.as_mut().ok_or_else(|| closed_error(operation))?;
        let mut next = state.clone();
        let out = f(&mut next)?;
        self.write_document(&next)?;
        *state = next;
        Ok(out)
    }

    fn write_document(&self, snapshot: &CompleteSnapshot) -> Result<()> {
        let bytes = render_document(snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::OperationFailed {
                operation: "create_data_dir".to_string(),
                cause: e.to_string(),
            })?;
        }
        fs::write(&self.path, bytes).map_err(|e| Error::OperationFailed {
            operation: "write_legacy_document".to_string(),
            cause: format!("{}: {e}", self.path.display()),
        })
    }

    fn require_dimension(&self) -> Result<usize> {
        self.dimension.ok_or_else(|| {
            Error::Configuration(
                "vector dimension is not set; memory records cannot be written".to_string(),
            )
        })
    }

    fn check_memory(&self, memory: &MemoryRecord) -> Result<()> {
        let dimension = self.require_dimension()?;
        match memory.embedding_dimension() {
            Some(actual) if actual != dimension => Err(Error::DimensionMismatch {
                expected: dimension,
                actual,
            }),
            _ => Ok(()),
        }
    }
}

fn bump(stats: &mut BTreeMap<StatCounter, u64>, counter: StatCounter, delta: u64) -> u64 {
    let value = stats.entry(counter).or_insert(0);
    *value = value.saturating_add(delta);
    *value
}

fn find_trajectory<'a>(
    state: &'a mut CompleteSnapshot,
    id: &TrajectoryId,
) -> Result<&'a mut Trajectory> {
    state
        .trajectories
        .iter_mut()
        .find(|t| &t.id == id)
        .ok_or_else(|| Error::NotFound(format!("trajectory '{id}'")))
}

impl PersistenceBackend for FlatFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LegacyFlatFile
    }

    #[instrument(skip(self), fields(operation = "load_all", backend = BACKEND))]
    fn load_all(&self) -> Result<FullSnapshot> {
        timed(BACKEND, "load_all", || {
            self.read("load_all", |state| Ok(FullSnapshot::from(state.clone())))
        })
    }

    #[instrument(skip(self, snapshot), fields(operation = "save_all", backend = BACKEND, tables = snapshot.presence_mask()))]
    fn save_all(&self, snapshot: &FullSnapshot) -> Result<()> {
        timed(BACKEND, "save_all", || {
            if let Some(memories) = &snapshot.memories {
                for memory in memories {
                    self.check_memory(memory)?;
                }
            }
            self.mutate("save_all", |state| {
                // Tables the caller did not load keep their stored contents;
                // the whole-file rewrite only ever sees a complete document.
                let mut merged = snapshot.clone();
                merged.fill_missing_from(&FullSnapshot::from(state.clone()));
                *state = merged.into_complete()?;
                Ok(())
            })
        })
    }

    #[instrument(skip(self, memory), fields(operation = "add_memory", backend = BACKEND, memory.id = %memory.id))]
    fn add_memory(&self, memory: &MemoryRecord) -> Result<bool> {
        timed(BACKEND, "add_memory", || {
            require_non_empty("memory id", memory.id.as_str())?;
            self.check_memory(memory)?;
            // Checked before mutating so a duplicate does not rewrite the file.
            if self.read("add_memory", |state| {
                Ok(state.memories.iter().any(|m| m.id == memory.id))
            })? {
                return Ok(false);
            }
            self.mutate("add_memory", |state| {
                if state.memories.iter().any(|m| m.id == memory.id) {
                    return Ok(false);
                }
                state.memories.push(memory.clone());
                bump(&mut state.stats, StatCounter::TotalMemories, 1);
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
            self.mutate("upsert_value_row", |state| {
                if let Some(row) = state.value_rows.iter_mut().find(|r| r.key() == *key) {
                    row.observe(value);
                    return Ok(row.clone());
                }
                let row = ValueTableRow::first_observation(key.clone(), value);
                state.value_rows.push(row.clone());
                bump(&mut state.stats, StatCounter::TotalPatterns, 1);
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
            if self.read("begin_trajectory", |state| {
                Ok(state.trajectories.iter().any(|t| t.id == trajectory.id))
            })? {
                return Ok(());
            }
            self.mutate("begin_trajectory", |state| {
                state.trajectories.push(trajectory.clone());
                bump(&mut state.stats, StatCounter::TotalTrajectories, 1);
                Ok(())
            })
        })
    }

    #[instrument(skip(self, step), fields(operation = "append_trajectory_step", backend = BACKEND, trajectory.id = %id))]
    fn append_trajectory_step(&self, id: &TrajectoryId, step: &TrajectoryStep) -> Result<usize> {
        timed(BACKEND, "append_trajectory_step", || {
            require_finite("reward", step.reward)?;
            self.mutate("append_trajectory_step", |state| {
                let trajectory = find_trajectory(state, id)?;
                if trajectory.is_sealed() {
                    return Err(Error::InvalidInput(format!("trajectory '{id}' is sealed")));
                }
                trajectory.steps.push(step.clone());
                Ok(trajectory.steps.len() - 1)
            })
        })
    }

    #[instrument(skip(self), fields(operation = "seal_trajectory", backend = BACKEND, trajectory.id = %id))]
    fn seal_trajectory(&self, id: &TrajectoryId, quality: f64) -> Result<()> {
        timed(BACKEND, "seal_trajectory", || {
            require_finite("quality", quality)?;
            self.mutate("seal_trajectory", |state| {
                let trajectory = find_trajectory(state, id)?;
                if trajectory.is_sealed() {
                    return Err(Error::InvalidInput(format!(
                        "trajectory '{id}' is already sealed"
                    )));
                }
                trajectory.terminal_quality = Some(quality);
                trajectory.ended_at = Some(crate::current_timestamp_ms());
                Ok(())
            })
        })
    }

    #[instrument(skip(self), fields(operation = "increment_edge", backend = BACKEND))]
    fn increment_edge(&self, file_a: &str, file_b: &str, delta: u64) -> Result<u64> {
        timed(BACKEND, "increment_edge", || {
            validate_edge(file_a, file_b, delta)?;
            let (a, b) = self.edge_policy.normalize(file_a, file_b);
            self.mutate("increment_edge", |state| {
                if let Some(edge) = state
                    .edges
                    .iter_mut()
                    .find(|e| e.file_a == a && e.file_b == b)
                {
                    edge.weight = edge.weight.saturating_add(delta);
                    return Ok(edge.weight);
                }
                state.edges.push(Edge::new(a, b, delta));
                bump(&mut state.stats, StatCounter::TotalEdges, 1);
                Ok(delta)
            })
        })
    }

    #[instrument(skip(self, value), fields(operation = "set_kv", backend = BACKEND))]
    fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        timed(BACKEND, "set_kv", || {
            require_non_empty("kv key", key)?;
            self.mutate("set_kv", |state| {
                let entry = KvEntry::new(key, value);
                match state.kv.iter_mut().find(|e| e.key == key) {
                    Some(existing) => *existing = entry,
                    None => state.kv.push(entry),
                }
                Ok(())
            })
        })
    }

    #[instrument(skip(self), fields(operation = "increment_stat", backend = BACKEND, counter = %counter))]
    fn increment_stat(&self, counter: StatCounter, delta: u64) -> Result<u64> {
        timed(BACKEND, "increment_stat", || {
            self.mutate("increment_stat", |state| {
                Ok(bump(&mut state.stats, counter, delta))
            })
        })
    }

    #[instrument(skip(self), fields(operation = "get_memory", backend = BACKEND, memory.id = %id))]
    fn get_memory(&self, id: &MemoryId) -> Result<Option<MemoryRecord>> {
        timed(BACKEND, "get_memory", || {
            self.read("get_memory", |state| {
                Ok(state.memories.iter().find(|m| &m.id == id).cloned())
            })
        })
    }

    #[instrument(skip(self), fields(operation = "recent_memories", backend = BACKEND))]
    fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        timed(BACKEND, "recent_memories", || {
            self.read("recent_memories", |state| {
                // Newest first; among equal timestamps the later insert wins.
                let mut memories: Vec<_> = state.memories.iter().rev().cloned().collect();
                memories.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                memories.truncate(limit);
                Ok(memories)
            })
        })
    }

    #[instrument(skip(self, query), fields(operation = "search_similar", backend = BACKEND))]
    fn search_similar(&self, query: &[f32], limit: usize) -> Result<Vec<MemoryResult>> {
        timed(BACKEND, "search_similar", || {
            if let Some(expected) = self.dimension {
                if query.len() != expected {
                    return Err(Error::DimensionMismatch {
                        expected,
                        actual: query.len(),
                    });
                }
            }
            self.read("search_similar", |state| {
                let candidates = state.memories.iter().rev().cloned();
                Ok(rank_by_similarity(candidates, query, limit))
            })
        })
    }

    #[instrument(skip(self), fields(operation = "get_value_row", backend = BACKEND, key = %key))]
    fn get_value_row(&self, key: &ValueKey) -> Result<Option<ValueTableRow>> {
        timed(BACKEND, "get_value_row", || {
            self.read("get_value_row", |state| {
                Ok(state.value_rows.iter().find(|r| r.key() == *key).cloned())
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
            self.read("value_rows_for_state", |state| {
                let mut rows: Vec<_> = state
                    .value_rows
                    .iter()
                    .filter(|r| r.algorithm_id == algorithm_id && r.state_key == state_key)
                    .cloned()
                    .collect();
                rows.sort_by(|a, b| {
                    b.value
                        .total_cmp(&a.value)
                        .then_with(|| a.action_key.cmp(&b.action_key))
                });
                Ok(rows)
            })
        })
    }

    #[instrument(skip(self), fields(operation = "get_trajectory", backend = BACKEND, trajectory.id = %id))]
    fn get_trajectory(&self, id: &TrajectoryId) -> Result<Option<Trajectory>> {
        timed(BACKEND, "get_trajectory", || {
            self.read("get_trajectory", |state| {
                Ok(state.trajectories.iter().find(|t| &t.id == id).cloned())
            })
        })
    }

    #[instrument(skip(self), fields(operation = "edge_weight", backend = BACKEND))]
    fn edge_weight(&self, file_a: &str, file_b: &str) -> Result<u64> {
        timed(BACKEND, "edge_weight", || {
            let (a, b) = self.edge_policy.normalize(file_a, file_b);
            self.read("edge_weight", |state| {
                Ok(state
                    .edges
                    .iter()
                    .find(|e| e.file_a == a && e.file_b == b)
                    .map_or(0, |e| e.weight))
            })
        })
    }

    #[instrument(skip(self), fields(operation = "edges_from", backend = BACKEND))]
    fn edges_from(&self, file: &str) -> Result<Vec<Edge>> {
        timed(BACKEND, "edges_from", || {
            let symmetric = self.edge_policy == EdgePolicy::Symmetric;
            self.read("edges_from", |state| {
                let mut edges: Vec<_> = state
                    .edges
                    .iter()
                    .filter(|e| e.file_a == file || (symmetric && e.file_b == file))
                    .cloned()
                    .collect();
                edges.sort_by(|x, y| {
                    y.weight
                        .cmp(&x.weight)
                        .then_with(|| x.file_a.cmp(&y.file_a))
                        .then_with(|| x.file_b.cmp(&y.file_b))
                });
                Ok(edges)
            })
        })
    }

    #[instrument(skip(self), fields(operation = "get_kv", backend = BACKEND))]
    fn get_kv(&self, key: &str) -> Result<Option<KvEntry>> {
        timed(BACKEND, "get_kv", || {
            self.read("get_kv", |state| {
                Ok(state.kv.iter().find(|e| e.key == key).cloned())
            })
        })
    }

    #[instrument(skip(self), fields(operation = "get_stat", backend = BACKEND, counter = %counter))]
    fn get_stat(&self, counter: StatCounter) -> Result<u64> {
        timed(BACKEND, "get_stat", || {
            self.read("get_stat", |state| {
                Ok(state.stats.get(&counter).copied().unwrap_or(0))
            })
        })
    }

    #[instrument(skip(self), fields(operation = "stats", backend = BACKEND))]
    fn stats(&self) -> Result<BTreeMap<StatCounter, u64>> {
        timed(BACKEND, "stats", || {
            self.read("stats", |state| Ok(state.stats.clone()))
        })
    }

    #[instrument(skip(self), fields(operation = "counts", backend = BACKEND))]
    fn counts(&self) -> Result<TableCounts> {
        timed(BACKEND, "counts", || {
            self.read("counts", |state| {
                Ok(TableCounts {
                    memories: state.memories.len(),
                    value_rows: state.value_rows.len(),
                    trajectories: state.trajectories.len(),
                    trajectory_steps: state.trajectories.iter().map(|t| t.steps.len()).sum(),
                    edges: state.edges.len(),
                    kv: state.kv.len(),
                    stats: state.stats.len(),
                })
            })
        })
    }

    #[instrument(skip(self), fields(operation = "close", backend = BACKEND))]
    fn close(&self) -> Result<()> {
        // Every mutation already rewrote the file; only the handle goes.
        acquire_lock(&self.state).take();
        Ok(())
    }
}
