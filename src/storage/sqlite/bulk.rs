//! Whole-table writes used by `save_all` and legacy import.
//!
//! All functions expect to run inside a write transaction opened by
//! [`with_write_transaction`](super::with_write_transaction).

use super::connection::tx_error;
use super::rows::to_sql_count;
use crate::codec::Codec;
use crate::config::EdgePolicy;
use crate::models::{
    Edge, FullSnapshot, KvEntry, MemoryRecord, StatCounter, Trajectory, ValueTableRow,
};
use crate::{Error, Result};
use rusqlite::{Connection, params};
use std::collections::{BTreeMap, HashSet};

/// How present tables combine with rows already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The snapshot is authoritative: rows are overwritten and stored rows
    /// absent from the snapshot are deleted.
    Replace,
    /// Rows are added without deleting anything; counters are copied
    /// verbatim. Used to migrate into an empty store.
    Import,
    /// Rows are folded into existing state: visits and weights add up,
    /// existing memories and trajectories win, newer kv entries win.
    /// Derived counters grow by the number of new rows.
    Merge,
}

/// Settings shared by every table writer.
#[derive(Debug, Clone, Copy)]
pub struct BulkWrite {
    /// Combination mode.
    pub mode: WriteMode,
    /// Codec for embeddings; `None` when no dimension is configured.
    pub codec: Option<Codec>,
    /// Edge keying policy.
    pub edge_policy: EdgePolicy,
}

/// Rows that did not exist before a [`WriteMode::Merge`] write.
#[derive(Debug, Default)]
struct NewRows {
    memories: u64,
    value_rows: u64,
    trajectories: u64,
    edges: u64,
}

impl BulkWrite {
    /// Writes every table present in `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for embeddings without a configured
    /// dimension, [`Error::DimensionMismatch`] for embeddings of the wrong
    /// length and [`Error::TransactionError`] for statement failures.
    pub fn write(&self, conn: &Connection, snapshot: &FullSnapshot) -> Result<()> {
        let mut new_rows = NewRows::default();
        if let Some(memories) = &snapshot.memories {
            new_rows.memories = self.write_memories(conn, memories)?;
        }
        if let Some(rows) = &snapshot.value_rows {
            new_rows.value_rows = self.write_value_rows(conn, rows)?;
        }
        if let Some(trajectories) = &snapshot.trajectories {
            new_rows.trajectories = self.write_trajectories(conn, trajectories)?;
        }
        if let Some(edges) = &snapshot.edges {
            new_rows.edges = self.write_edges(conn, edges)?;
        }
        if let Some(kv) = &snapshot.kv {
            self.write_kv(conn, kv)?;
        }
        if let Some(stats) = &snapshot.stats {
            self.write_stats(conn, stats)?;
        }
        if self.mode == WriteMode::Merge {
            bump_derived_counters(conn, &new_rows)?;
        }
        Ok(())
    }

    fn encode_embedding(&self, memory: &MemoryRecord) -> Result<Option<Vec<u8>>> {
        let Some(embedding) = &memory.embedding else {
            return Ok(None);
        };
        let codec = self.codec.ok_or_else(|| {
            Error::Configuration(format!(
                "vector dimension is not set; cannot store embedding of memory '{}'",
                memory.id
            ))
        })?;
        codec.encode_vector(embedding).map(Some)
    }

    fn write_memories(&self, conn: &Connection, memories: &[MemoryRecord]) -> Result<u64> {
        let op = "save_memories";
        let sql = match self.mode {
            WriteMode::Replace => {
                "INSERT INTO memories (id, content, kind, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO UPDATE SET content = excluded.content,
                     kind = excluded.kind, embedding = excluded.embedding,
                     created_at = excluded.created_at"
            },
            WriteMode::Import | WriteMode::Merge => {
                "INSERT INTO memories (id, content, kind, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO NOTHING"
            },
        };
        let mut stmt = conn.prepare_cached(sql).map_err(tx_error(op))?;
        let mut inserted = 0u64;
        for memory in memories {
            let blob = self.encode_embedding(memory)?;
            let changed = stmt
                .execute(params![
                    memory.id.as_str(),
                    memory.content,
                    memory.kind,
                    blob,
                    memory.created_at
                ])
                .map_err(tx_error(op))?;
            if changed > 0 {
                inserted += 1;
            }
        }

        if self.mode == WriteMode::Replace {
            let keep: HashSet<&str> = memories.iter().map(|m| m.id.as_str()).collect();
            let stored = select_keys(conn, "SELECT id FROM memories", op)?;
            let mut delete = conn
                .prepare_cached("DELETE FROM memories WHERE id = ?1")
                .map_err(tx_error(op))?;
            for id in stored.iter().filter(|id| !keep.contains(id.as_str())) {
                delete.execute(params![id]).map_err(tx_error(op))?;
            }
        }
        Ok(inserted)
    }

    fn write_value_rows(&self, conn: &Connection, rows: &[ValueTableRow]) -> Result<u64> {
        let op = "save_value_rows";
        let sql = match self.mode {
            WriteMode::Replace | WriteMode::Import => {
                "INSERT INTO value_rows (algorithm_id, state_key, action_key, value, visit_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (algorithm_id, state_key, action_key) DO UPDATE SET
                     value = excluded.value, visit_count = excluded.visit_count"
            },
            WriteMode::Merge => {
                "INSERT INTO value_rows (algorithm_id, state_key, action_key, value, visit_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (algorithm_id, state_key, action_key) DO UPDATE SET
                     value = excluded.value,
                     visit_count = value_rows.visit_count + excluded.visit_count"
            },
        };
        let mut exists = conn
            .prepare_cached(
                "SELECT 1 FROM value_rows
                 WHERE algorithm_id = ?1 AND state_key = ?2 AND action_key = ?3",
            )
            .map_err(tx_error(op))?;
        let mut stmt = conn.prepare_cached(sql).map_err(tx_error(op))?;
        let mut inserted = 0u64;
        for row in rows {
            let existed = exists
                .exists(params![row.algorithm_id, row.state_key, row.action_key])
                .map_err(tx_error(op))?;
            stmt.execute(params![
                row.algorithm_id,
                row.state_key,
                row.action_key,
                row.value,
                to_sql_count(row.visit_count, "visit_count")?
            ])
            .map_err(tx_error(op))?;
            if !existed {
                inserted += 1;
            }
        }

        if self.mode == WriteMode::Replace {
            let keep: HashSet<(&str, &str, &str)> = rows
                .iter()
                .map(|r| {
                    (
                        r.algorithm_id.as_str(),
                        r.state_key.as_str(),
                        r.action_key.as_str(),
                    )
                })
                .collect();
            let mut select = conn
                .prepare("SELECT algorithm_id, state_key, action_key FROM value_rows")
                .map_err(tx_error(op))?;
            let stored = select
                .query_map([], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
                })
                .map_err(tx_error(op))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(tx_error(op))?;
            let mut delete = conn
                .prepare_cached(
                    "DELETE FROM value_rows
                     WHERE algorithm_id = ?1 AND state_key = ?2 AND action_key = ?3",
                )
                .map_err(tx_error(op))?;
            for (a, s, x) in &stored {
                if !keep.contains(&(a.as_str(), s.as_str(), x.as_str())) {
                    delete.execute(params![a, s, x]).map_err(tx_error(op))?;
                }
            }
        }
        Ok(inserted)
    }

    fn write_trajectories(&self, conn: &Connection, trajectories: &[Trajectory]) -> Result<u64> {
        let op = "save_trajectories";
        let header_sql = match self.mode {
            WriteMode::Replace => {
                "INSERT INTO trajectories (id, context, agent, terminal_quality, started_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO UPDATE SET context = excluded.context,
                     agent = excluded.agent, terminal_quality = excluded.terminal_quality,
                     started_at = excluded.started_at, ended_at = excluded.ended_at"
            },
            WriteMode::Import | WriteMode::Merge => {
                "INSERT INTO trajectories (id, context, agent, terminal_quality, started_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO NOTHING"
            },
        };
        let mut header = conn.prepare_cached(header_sql).map_err(tx_error(op))?;
        let mut step_stmt = conn
            .prepare_cached(
                "INSERT INTO trajectory_steps (trajectory_id, step_index, action, result, reward)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (trajectory_id, step_index) DO UPDATE SET
                     action = excluded.action, result = excluded.result,
                     reward = excluded.reward",
            )
            .map_err(tx_error(op))?;
        let mut trim = conn
            .prepare_cached(
                "DELETE FROM trajectory_steps WHERE trajectory_id = ?1 AND step_index >= ?2",
            )
            .map_err(tx_error(op))?;

        let mut inserted = 0u64;
        for trajectory in trajectories {
            let changed = header
                .execute(params![
                    trajectory.id.as_str(),
                    trajectory.context,
                    trajectory.agent,
                    trajectory.terminal_quality,
                    trajectory.started_at,
                    trajectory.ended_at
                ])
                .map_err(tx_error(op))?;
            if self.mode != WriteMode::Replace && changed == 0 {
                // Existing trajectory wins; its steps stay as stored.
                continue;
            }
            if changed > 0 {
                inserted += 1;
            }
            for (index, step) in trajectory.steps.iter().enumerate() {
                step_stmt
                    .execute(params![
                        trajectory.id.as_str(),
                        to_sql_count(index as u64, "step_index")?,
                        step.action,
                        step.result,
                        step.reward
                    ])
                    .map_err(tx_error(op))?;
            }
            trim.execute(params![
                trajectory.id.as_str(),
                to_sql_count(trajectory.steps.len() as u64, "step_index")?
            ])
            .map_err(tx_error(op))?;
        }

        if self.mode == WriteMode::Replace {
            let keep: HashSet<&str> = trajectories.iter().map(|t| t.id.as_str()).collect();
            let stored = select_keys(conn, "SELECT id FROM trajectories", op)?;
            let mut delete_steps = conn
                .prepare_cached("DELETE FROM trajectory_steps WHERE trajectory_id = ?1")
                .map_err(tx_error(op))?;
            let mut delete = conn
                .prepare_cached("DELETE FROM trajectories WHERE id = ?1")
                .map_err(tx_error(op))?;
            for id in stored.iter().filter(|id| !keep.contains(id.as_str())) {
                delete_steps.execute(params![id]).map_err(tx_error(op))?;
                delete.execute(params![id]).map_err(tx_error(op))?;
            }
        }
        Ok(inserted)
    }

    fn write_edges(&self, conn: &Connection, edges: &[Edge]) -> Result<u64> {
        let op = "save_edges";
        let sql = match self.mode {
            WriteMode::Replace | WriteMode::Import => {
                "INSERT INTO edges (file_a, file_b, weight) VALUES (?1, ?2, ?3)
                 ON CONFLICT (file_a, file_b) DO UPDATE SET weight = excluded.weight"
            },
            WriteMode::Merge => {
                "INSERT INTO edges (file_a, file_b, weight) VALUES (?1, ?2, ?3)
                 ON CONFLICT (file_a, file_b) DO UPDATE SET weight = edges.weight + excluded.weight"
            },
        };
        let mut exists = conn
            .prepare_cached("SELECT 1 FROM edges WHERE file_a = ?1 AND file_b = ?2")
            .map_err(tx_error(op))?;
        let mut stmt = conn.prepare_cached(sql).map_err(tx_error(op))?;
        let mut keep: HashSet<(&str, &str)> = HashSet::new();
        let mut inserted = 0u64;
        for edge in edges {
            let (a, b) = self.edge_policy.normalize(&edge.file_a, &edge.file_b);
            keep.insert((a, b));
            let existed = exists.exists(params![a, b]).map_err(tx_error(op))?;
            stmt.execute(params![a, b, to_sql_count(edge.weight, "weight")?])
                .map_err(tx_error(op))?;
            if !existed {
                inserted += 1;
            }
        }

        if self.mode == WriteMode::Replace {
            let mut select = conn
                .prepare("SELECT file_a, file_b FROM edges")
                .map_err(tx_error(op))?;
            let stored = select
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
                .map_err(tx_error(op))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(tx_error(op))?;
            let mut delete = conn
                .prepare_cached("DELETE FROM edges WHERE file_a = ?1 AND file_b = ?2")
                .map_err(tx_error(op))?;
            for (a, b) in &stored {
                if !keep.contains(&(a.as_str(), b.as_str())) {
                    delete.execute(params![a, b]).map_err(tx_error(op))?;
                }
            }
        }
        Ok(inserted)
    }

    fn write_kv(&self, conn: &Connection, entries: &[KvEntry]) -> Result<()> {
        let op = "save_kv";
        let sql = match self.mode {
            WriteMode::Replace | WriteMode::Import => {
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                     updated_at = excluded.updated_at"
            },
            WriteMode::Merge => {
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                     updated_at = excluded.updated_at
                 WHERE excluded.updated_at > kv.updated_at"
            },
        };
        let mut stmt = conn.prepare_cached(sql).map_err(tx_error(op))?;
        for entry in entries {
            stmt.execute(params![entry.key, entry.value, entry.updated_at])
                .map_err(tx_error(op))?;
        }

        if self.mode == WriteMode::Replace {
            let keep: HashSet<&str> = entries.iter().map(|e| e.key.as_str()).collect();
            let stored = select_keys(conn, "SELECT key FROM kv", op)?;
            let mut delete = conn
                .prepare_cached("DELETE FROM kv WHERE key = ?1")
                .map_err(tx_error(op))?;
            for key in stored.iter().filter(|k| !keep.contains(k.as_str())) {
                delete.execute(params![key]).map_err(tx_error(op))?;
            }
        }
        Ok(())
    }

    fn write_stats(&self, conn: &Connection, stats: &BTreeMap<StatCounter, u64>) -> Result<()> {
        let op = "save_stats";
        match self.mode {
            WriteMode::Replace | WriteMode::Import => {
                let mut stmt = conn
                    .prepare_cached(
                        "INSERT INTO stats (name, value) VALUES (?1, ?2)
                         ON CONFLICT (name) DO UPDATE SET value = excluded.value",
                    )
                    .map_err(tx_error(op))?;
                for (counter, value) in stats {
                    stmt.execute(params![counter.as_str(), to_sql_count(*value, "stat")?])
                        .map_err(tx_error(op))?;
                }

                if self.mode == WriteMode::Replace {
                    let keep: HashSet<&str> = stats.keys().map(|c| c.as_str()).collect();
                    let stored = select_keys(conn, "SELECT name FROM stats", op)?;
                    let mut delete = conn
                        .prepare_cached("DELETE FROM stats WHERE name = ?1")
                        .map_err(tx_error(op))?;
                    for name in stored.iter().filter(|n| !keep.contains(n.as_str())) {
                        delete.execute(params![name]).map_err(tx_error(op))?;
                    }
                }
            },
            WriteMode::Merge => {
                // Derived counters follow the rows actually added; only the
                // session count carries over from the other side.
                if let Some(sessions) = stats.get(&StatCounter::SessionCount) {
                    bump_stat(conn, StatCounter::SessionCount, *sessions)?;
                }
            },
        }
        Ok(())
    }
}

fn bump_derived_counters(conn: &Connection, new_rows: &NewRows) -> Result<()> {
    for (counter, delta) in [
        (StatCounter::TotalMemories, new_rows.memories),
        (StatCounter::TotalPatterns, new_rows.value_rows),
        (StatCounter::TotalTrajectories, new_rows.trajectories),
        (StatCounter::TotalEdges, new_rows.edges),
    ] {
        if delta > 0 {
            bump_stat(conn, counter, delta)?;
        }
    }
    Ok(())
}

/// Adds `delta` to a counter and returns the new value.
///
/// # Errors
///
/// Returns [`Error::TransactionError`] if the statement fails.
pub fn bump_stat(conn: &Connection, counter: StatCounter, delta: u64) -> Result<u64> {
    let value: i64 = conn
        .query_row(
            "INSERT INTO stats (name, value) VALUES (?1, ?2)
             ON CONFLICT (name) DO UPDATE SET value = stats.value + excluded.value
             RETURNING value",
            params![counter.as_str(), to_sql_count(delta, "stat delta")?],
            |row| row.get(0),
        )
        .map_err(tx_error("increment_stat"))?;
    Ok(super::rows::from_sql_count(value))
}

fn select_keys(conn: &Connection, sql: &str, op: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql).map_err(tx_error(op))?;
    let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(tx_error(op))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(tx_error(op))?;
    Ok(keys)
}
