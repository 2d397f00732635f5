//! The legacy flat-file document.
//!
//! One JSON object with a `version` field and the named collections
//! `memories`, `value_table`, `trajectories`, `edges`, `kv` and `stats`.
//! Readers tolerate missing collections and skip malformed entries;
//! writers always emit every collection.

use crate::config::EdgePolicy;
use crate::models::{
    CompleteSnapshot, Edge, FullSnapshot, KvEntry, MemoryRecord, StatCounter, Trajectory,
    ValueKey, ValueTableRow,
};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Version written into new legacy documents.
pub const LEGACY_FORMAT_VERSION: u32 = 1;

/// Document as read: every collection optional, every entry untyped so one
/// bad entry cannot fail the whole parse.
#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    memories: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    value_table: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    trajectories: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    edges: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    kv: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    stats: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Document as written.
#[derive(Debug, Serialize)]
struct WrittenDocument<'a> {
    version: u32,
    memories: &'a [MemoryRecord],
    value_table: &'a [ValueTableRow],
    trajectories: &'a [Trajectory],
    edges: &'a [Edge],
    kv: &'a [KvEntry],
    stats: &'a BTreeMap<StatCounter, u64>,
}

/// A parsed legacy document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    /// Every collection, empty where the document had none.
    pub snapshot: CompleteSnapshot,
    /// Version the document declared (1 when absent).
    pub version: u32,
    /// Entries dropped because they were malformed, had the wrong embedding
    /// dimension, or duplicated an earlier key.
    pub skipped: usize,
}

impl ParsedDocument {
    /// The parsed state as a full snapshot.
    #[must_use]
    pub fn to_snapshot(&self) -> FullSnapshot {
        FullSnapshot::from(self.snapshot.clone())
    }
}

/// Parses legacy document bytes.
///
/// An empty (or whitespace-only) file parses as empty state: that is what a
/// crash between truncate and write leaves behind.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] if the bytes are not a JSON object.
/// Malformed individual entries never fail the parse.
pub fn parse_document(
    bytes: &[u8],
    dimension: Option<usize>,
    edge_policy: EdgePolicy,
) -> Result<ParsedDocument> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        tracing::warn!("legacy document is empty, treating as empty state");
        return Ok(ParsedDocument {
            snapshot: CompleteSnapshot::default(),
            version: LEGACY_FORMAT_VERSION,
            skipped: 0,
        });
    }

    let raw: RawDocument = serde_json::from_slice(bytes).map_err(|e| Error::CorruptRecord {
        kind: "legacy_document".to_string(),
        reason: e.to_string(),
    })?;

    let version = raw.version.unwrap_or(LEGACY_FORMAT_VERSION);
    if version > LEGACY_FORMAT_VERSION {
        tracing::warn!(
            version,
            supported = LEGACY_FORMAT_VERSION,
            "legacy document is newer than supported, reading known fields"
        );
    }

    let mut skipped = 0usize;
    let memories = parse_memories(raw.memories, dimension, &mut skipped);
    let value_rows = parse_value_rows(raw.value_table, &mut skipped);
    let trajectories = parse_trajectories(raw.trajectories, &mut skipped);
    let edges = parse_edges(raw.edges, edge_policy, &mut skipped);
    let kv = parse_kv(raw.kv, &mut skipped);
    let stats = parse_stats(raw.stats, &mut skipped);

    if skipped > 0 {
        tracing::warn!(skipped, "skipped malformed entries in legacy document");
        metrics::counter!("storage_corrupt_records_total", "backend" => "flat_file")
            .increment(skipped as u64);
    }

    Ok(ParsedDocument {
        snapshot: CompleteSnapshot {
            memories,
            value_rows,
            trajectories,
            edges,
            kv,
            stats,
        },
        version,
        skipped,
    })
}

/// Renders a complete snapshot as legacy document bytes.
///
/// Only a [`CompleteSnapshot`] can be rendered, so a written document always
/// carries every collection.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if serialization fails.
pub fn render_document(snapshot: &CompleteSnapshot) -> Result<Vec<u8>> {
    let document = WrittenDocument {
        version: LEGACY_FORMAT_VERSION,
        memories: &snapshot.memories,
        value_table: &snapshot.value_rows,
        trajectories: &snapshot.trajectories,
        edges: &snapshot.edges,
        kv: &snapshot.kv,
        stats: &snapshot.stats,
    };
    serde_json::to_vec_pretty(&document).map_err(|e| Error::OperationFailed {
        operation: "render_legacy_document".to_string(),
        cause: e.to_string(),
    })
}

/// Decodes each entry, logging and counting the ones that fail.
fn decode_entries<T: DeserializeOwned>(
    entries: Option<Vec<serde_json::Value>>,
    kind: &str,
    skipped: &mut usize,
) -> Vec<T> {
    entries
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(kind, index, error = %e, "skipping malformed legacy entry");
                *skipped += 1;
                None
            },
        })
        .collect()
}

fn parse_memories(
    entries: Option<Vec<serde_json::Value>>,
    dimension: Option<usize>,
    skipped: &mut usize,
) -> Vec<MemoryRecord> {
    let mut seen = HashSet::new();
    decode_entries::<MemoryRecord>(entries, "memory", skipped)
        .into_iter()
        .filter(|memory| {
            if let (Some(expected), Some(actual)) = (dimension, memory.embedding_dimension()) {
                if expected != actual {
                    tracing::warn!(
                        memory.id = %memory.id,
                        expected,
                        actual,
                        "skipping legacy memory with wrong embedding dimension"
                    );
                    *skipped += 1;
                    return false;
                }
            }
            if memory.id.as_str().is_empty() || !seen.insert(memory.id.clone()) {
                *skipped += 1;
                return false;
            }
            true
        })
        .collect()
}

fn parse_value_rows(
    entries: Option<Vec<serde_json::Value>>,
    skipped: &mut usize,
) -> Vec<ValueTableRow> {
    // Last occurrence of a key wins, at the position of its first occurrence.
    let mut order: Vec<ValueKey> = Vec::new();
    let mut rows: HashMap<ValueKey, ValueTableRow> = HashMap::new();
    for row in decode_entries::<ValueTableRow>(entries, "value_row", skipped) {
        let key = row.key();
        if rows.insert(key.clone(), row).is_some() {
            *skipped += 1;
        } else {
            order.push(key);
        }
    }
    order.into_iter().filter_map(|k| rows.remove(&k)).collect()
}

fn parse_trajectories(
    entries: Option<Vec<serde_json::Value>>,
    skipped: &mut usize,
) -> Vec<Trajectory> {
    let mut seen = HashSet::new();
    decode_entries::<Trajectory>(entries, "trajectory", skipped)
        .into_iter()
        .filter(|t| {
            let keep = !t.id.as_str().is_empty() && seen.insert(t.id.clone());
            if !keep {
                *skipped += 1;
            }
            keep
        })
        .collect()
}

fn parse_edges(
    entries: Option<Vec<serde_json::Value>>,
    policy: EdgePolicy,
    skipped: &mut usize,
) -> Vec<Edge> {
    // Reversed duplicates under the symmetric policy are the same edge; their
    // weights add up.
    let mut order: Vec<(String, String)> = Vec::new();
    let mut weights: HashMap<(String, String), u64> = HashMap::new();
    for edge in decode_entries::<Edge>(entries, "edge", skipped) {
        let (a, b) = policy.normalize(&edge.file_a, &edge.file_b);
        let key = (a.to_string(), b.to_string());
        match weights.get_mut(&key) {
            Some(weight) => *weight = weight.saturating_add(edge.weight),
            None => {
                weights.insert(key.clone(), edge.weight);
                order.push(key);
            },
        }
    }
    order
        .into_iter()
        .filter_map(|key| {
            let weight = weights.remove(&key)?;
            Some(Edge::new(key.0, key.1, weight))
        })
        .collect()
}

fn parse_kv(entries: Option<Vec<serde_json::Value>>, skipped: &mut usize) -> Vec<KvEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, KvEntry> = HashMap::new();
    for entry in decode_entries::<KvEntry>(entries, "kv", skipped) {
        match latest.get_mut(&entry.key) {
            Some(existing) => {
                *skipped += 1;
                if entry.updated_at >= existing.updated_at {
                    *existing = entry;
                }
            },
            None => {
                order.push(entry.key.clone());
                latest.insert(entry.key.clone(), entry);
            },
        }
    }
    order.into_iter().filter_map(|k| latest.remove(&k)).collect()
}

fn parse_stats(
    stats: Option<serde_json::Map<String, serde_json::Value>>,
    skipped: &mut usize,
) -> BTreeMap<StatCounter, u64> {
    let mut out = BTreeMap::new();
    for (name, value) in stats.unwrap_or_default() {
        let Some(counter) = StatCounter::parse(&name) else {
            tracing::debug!(name = %name, "ignoring unknown legacy counter");
            continue;
        };
        match value.as_u64() {
            Some(v) => {
                out.insert(counter, v);
            },
            None => {
                tracing::warn!(name = %name, %value, "skipping non-integer legacy counter");
                *skipped += 1;
            },
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ParsedDocument {
        parse_document(json.as_bytes(), Some(2), EdgePolicy::Symmetric).unwrap()
    }

    #[test]
    fn test_missing_collections_are_empty() {
        let parsed = parse(r#"{"version": 1, "kv": [{"key": "k", "value": "v", "updated_at": 1}]}"#);
        assert_eq!(parsed.snapshot.kv.len(), 1);
        assert!(parsed.snapshot.memories.is_empty());
        assert!(parsed.snapshot.stats.is_empty());
        assert_eq!(parsed.skipped, 0);
    }

    #[test]
    fn test_null_collections_are_empty() {
        let parsed = parse(r#"{"memories": null, "edges": null}"#);
        assert!(parsed.snapshot.memories.is_empty());
        assert!(parsed.snapshot.edges.is_empty());
        assert_eq!(parsed.version, LEGACY_FORMAT_VERSION);
    }

    #[test]
    fn test_malformed_entries_are_skipped_and_counted() {
        let parsed = parse(
            r#"{
                "memories": [
                    {"id": "ok", "content": "c", "kind": "k", "embedding": [0.1, 0.2], "created_at": 1},
                    {"id": "bad-dim", "content": "c", "kind": "k", "embedding": [0.1], "created_at": 2},
                    {"content": "missing id"},
                    42
                ],
                "stats": {"total_memories": 3, "session_count": "many", "unknown": 1}
            }"#,
        );
        assert_eq!(parsed.snapshot.memories.len(), 1);
        assert_eq!(parsed.snapshot.memories[0].id.as_str(), "ok");
        assert_eq!(parsed.snapshot.stats.get(&StatCounter::TotalMemories), Some(&3));
        assert_eq!(parsed.skipped, 4);
    }

    #[test]
    fn test_symmetric_duplicate_edges_merge() {
        let parsed = parse(
            r#"{"edges": [
                {"file_a": "b.rs", "file_b": "a.rs", "weight": 2},
                {"file_a": "a.rs", "file_b": "b.rs", "weight": 3}
            ]}"#,
        );
        assert_eq!(parsed.snapshot.edges, vec![Edge::new("a.rs", "b.rs", 5)]);
    }

    #[test]
    fn test_duplicate_value_rows_keep_last() {
        let parsed = parse(
            r#"{"value_table": [
                {"algorithm_id": "q", "state_key": "s", "action_key": "a", "value": 0.1, "visit_count": 1},
                {"algorithm_id": "q", "state_key": "s", "action_key": "a", "value": 0.7, "visit_count": 4}
            ]}"#,
        );
        assert_eq!(parsed.snapshot.value_rows.len(), 1);
        assert_eq!(parsed.snapshot.value_rows[0].visit_count, 4);
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn test_not_an_object_is_corrupt() {
        let err = parse_document(b"[1, 2]", None, EdgePolicy::Symmetric).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }));
    }

    #[test]
    fn test_empty_file_is_empty_state() {
        let parsed = parse_document(b"  \n", None, EdgePolicy::Symmetric).unwrap();
        assert_eq!(parsed.snapshot, CompleteSnapshot::default());
    }

    #[test]
    fn test_rendered_document_has_every_collection() {
        let bytes = render_document(&CompleteSnapshot::default()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        for key in ["version", "memories", "value_table", "trajectories", "edges", "kv", "stats"] {
            assert!(value.get(key).is_some_and(|v| !v.is_null()), "missing {key}");
        }
    }

    #[test]
    fn test_render_then_parse_preserves_state() {
        let mut snapshot = CompleteSnapshot::default();
        snapshot
            .memories
            .push(MemoryRecord::new("m", "note", Some(vec![0.25, -1.5])).with_id("m1"));
        snapshot
            .value_rows
            .push(ValueTableRow::first_observation(ValueKey::new("q", "s", "a"), 0.5));
        snapshot.stats.insert(StatCounter::TotalMemories, 1);

        let bytes = render_document(&snapshot).unwrap();
        let parsed = parse_document(&bytes, Some(2), EdgePolicy::Symmetric).unwrap();
        assert_eq!(parsed.snapshot, snapshot);
        assert_eq!(parsed.skipped, 0);
    }
}
