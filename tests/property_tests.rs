//! Property-based tests for the codec and the legacy document reader.
//!
//! Uses proptest to verify invariants across random inputs:
//! - Every record kind decodes to the value that was encoded
//! - Embeddings keep their exact bit patterns
//! - Arbitrary bytes never panic the decoders

// Property tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use intellistore::storage::persistence::parse_document;
use intellistore::{
    Codec, Edge, EdgePolicy, KvEntry, MemoryId, MemoryRecord, Record, RecordKind, Trajectory,
    TrajectoryId, TrajectoryStep, ValueTableRow,
};
use proptest::prelude::*;

const DIMENSION: usize = 8;

fn finite_f32() -> impl Strategy<Value = f32> {
    prop::num::f32::NORMAL | prop::num::f32::ZERO
}

fn finite_f64() -> impl Strategy<Value = f64> {
    prop::num::f64::NORMAL | prop::num::f64::ZERO
}

fn memory() -> impl Strategy<Value = MemoryRecord> {
    (
        "[a-z0-9-]{1,36}",
        ".{0,200}",
        "[a-z]{1,12}",
        prop::option::of(prop::collection::vec(finite_f32(), DIMENSION)),
        any::<i64>(),
    )
        .prop_map(|(id, content, kind, embedding, created_at)| MemoryRecord {
            id: MemoryId::new(id),
            content,
            kind,
            embedding,
            created_at,
        })
}

fn step() -> impl Strategy<Value = TrajectoryStep> {
    (".{0,40}", ".{0,40}", finite_f64()).prop_map(|(action, result, reward)| TrajectoryStep {
        action,
        result,
        reward,
    })
}

fn trajectory() -> impl Strategy<Value = Trajectory> {
    (
        "[a-z0-9-]{1,36}",
        ".{0,60}",
        "[a-z]{1,12}",
        prop::collection::vec(step(), 0..8),
        prop::option::of(finite_f64()),
        any::<i64>(),
        prop::option::of(any::<i64>()),
    )
        .prop_map(
            |(id, context, agent, steps, terminal_quality, started_at, ended_at)| Trajectory {
                id: TrajectoryId::new(id),
                context,
                agent,
                steps,
                terminal_quality,
                started_at,
                ended_at,
            },
        )
}

fn record() -> impl Strategy<Value = Record> {
    prop_oneof![
        memory().prop_map(Record::Memory),
        (".{1,20}", ".{1,20}", ".{1,20}", finite_f64(), any::<u64>()).prop_map(
            |(algorithm_id, state_key, action_key, value, visit_count)| {
                Record::ValueRow(ValueTableRow {
                    algorithm_id,
                    state_key,
                    action_key,
                    value,
                    visit_count,
                })
            }
        ),
        trajectory().prop_map(Record::Trajectory),
        step().prop_map(Record::TrajectoryStep),
        (".{1,40}", ".{1,40}", any::<u64>()).prop_map(|(file_a, file_b, weight)| {
            Record::Edge(Edge {
                file_a,
                file_b,
                weight,
            })
        }),
        (".{1,40}", ".{0,200}", any::<i64>()).prop_map(|(key, value, updated_at)| {
            Record::Kv(KvEntry {
                key,
                value,
                updated_at,
            })
        }),
    ]
}

proptest! {
    /// Property: every record decodes to exactly what was encoded.
    #[test]
    fn prop_record_round_trips(record in record()) {
        let codec = Codec::new(DIMENSION);
        let bytes = codec.encode(&record).unwrap();
        let decoded = codec.decode(&bytes, record.kind()).unwrap();
        prop_assert_eq!(decoded, record);
    }

    /// Property: vectors keep their exact bits, including negative zero.
    #[test]
    fn prop_vector_bits_preserved(vector in prop::collection::vec(any::<f32>(), DIMENSION)) {
        let codec = Codec::new(DIMENSION);
        let bytes = codec.encode_vector(&vector).unwrap();
        prop_assert_eq!(bytes.len(), DIMENSION * 4);
        let decoded = codec.decode_vector(&bytes).unwrap();
        let original_bits: Vec<u32> = vector.iter().map(|f| f.to_bits()).collect();
        let decoded_bits: Vec<u32> = decoded.iter().map(|f| f.to_bits()).collect();
        prop_assert_eq!(decoded_bits, original_bits);
    }

    /// Property: decoding arbitrary bytes returns an error instead of panicking.
    #[test]
    fn prop_decode_arbitrary_bytes_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let codec = Codec::new(DIMENSION);
        for kind in [
            RecordKind::Memory,
            RecordKind::ValueRow,
            RecordKind::Trajectory,
            RecordKind::TrajectoryStep,
            RecordKind::Edge,
            RecordKind::Kv,
        ] {
            let _ = codec.decode(&bytes, kind);
        }
        let _ = codec.decode_vector(&bytes);
    }

    /// Property: the legacy reader never panics on arbitrary input.
    #[test]
    fn prop_legacy_parse_never_panics(text in ".{0,512}") {
        let _ = parse_document(text.as_bytes(), Some(DIMENSION), EdgePolicy::Symmetric);
    }

    /// Property: a truncated encoding is always rejected.
    #[test]
    fn prop_truncated_record_rejected(record in record(), cut in 1usize..16) {
        let codec = Codec::new(DIMENSION);
        let bytes = codec.encode(&record).unwrap();
        let keep = bytes.len().saturating_sub(cut);
        prop_assert!(codec.decode(&bytes[..keep], record.kind()).is_err());
    }
}
