//! Benchmarks for hot-path storage operations.
//!
//! Benchmark targets:
//! - Value-table upsert (one transaction): <1ms
//! - Edge increment (one transaction): <1ms
//! - Memory embedding encode/decode at 384 dimensions: <10us
//! - Similarity search over 1,000 memories: <20ms

// Criterion macros generate items without docs - this is expected for benchmarks
#![allow(missing_docs, clippy::unwrap_used, clippy::cast_precision_loss)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;
use tempfile::TempDir;

use intellistore::{
    Codec, MemoryRecord, PersistenceBackend, Record, RecordKind, SqlitePersistenceBackend,
    StorageConfig, ValueKey,
};

const DIMENSION: usize = 384;

fn vector(seed: usize) -> Vec<f32> {
    (0..DIMENSION)
        .map(|i| ((i + seed) % 97) as f32 / 97.0)
        .collect()
}

fn open_store(dir: &TempDir) -> SqlitePersistenceBackend {
    let config = StorageConfig::new()
        .with_path(dir.path())
        .with_dimension(DIMENSION);
    SqlitePersistenceBackend::open(&config).unwrap()
}

// ============================================================================
// Transactional writes
// ============================================================================

fn bench_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("sqlite_writes");
    group.measurement_time(Duration::from_secs(5));

    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let key = ValueKey::new("q-learning", "rust", "coder");

    group.bench_function("upsert_value_row", |b| {
        b.iter(|| store.upsert_value_row(black_box(&key), black_box(0.5)).unwrap());
    });

    group.bench_function("increment_edge", |b| {
        b.iter(|| {
            store
                .increment_edge(black_box("src/lib.rs"), black_box("src/main.rs"), 1)
                .unwrap()
        });
    });

    group.bench_function("set_kv", |b| {
        b.iter(|| store.set_kv(black_box("last_file"), black_box("src/lib.rs")).unwrap());
    });

    group.finish();
}

// ============================================================================
// Codec
// ============================================================================

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let codec = Codec::new(DIMENSION);
    let record = Record::Memory(MemoryRecord::new("content", "note", Some(vector(1))));
    let encoded = codec.encode(&record).unwrap();
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode_memory", |b| {
        b.iter(|| codec.encode(black_box(&record)).unwrap());
    });

    group.bench_function("decode_memory", |b| {
        b.iter(|| codec.decode(black_box(&encoded), RecordKind::Memory).unwrap());
    });

    group.finish();
}

// ============================================================================
// Similarity search
// ============================================================================

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search_similar");
    group.measurement_time(Duration::from_secs(5));

    for count in [100usize, 1_000] {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for i in 0..count {
            store
                .add_memory(&MemoryRecord::new(format!("memory {i}"), "note", Some(vector(i))))
                .unwrap();
        }
        let query = vector(7);

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| store.search_similar(black_box(&query), 10).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_writes, bench_codec, bench_search);
criterion_main!(benches);
