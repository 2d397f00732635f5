//! Chaos testing for concurrent access.
//!
//! Independent handles stand in for separate hook processes:
//! - Concurrent upserts of one value-table key
//! - Concurrent edge increments from many threads
//! - Readers running alongside a writer

// Chaos tests use expect/unwrap/panic for simplicity - panics are acceptable in tests
// Excessive nesting is acceptable in concurrent test code with thread spawns
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::excessive_nesting,
    clippy::float_cmp
)]

use intellistore::{
    PersistenceBackend, SqlitePersistenceBackend, StatCounter, StorageConfig, ValueKey,
};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

fn config(dir: &TempDir) -> StorageConfig {
    StorageConfig::new().with_path(dir.path()).with_dimension(4)
}

// ============================================================================
// Independent handles
// ============================================================================

#[test]
fn test_two_handles_upsert_same_key() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    // Create the schema up front so neither thread races on it.
    SqlitePersistenceBackend::open(&config).unwrap().close().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let key = ValueKey::new("q-learning", "state", "action");
    let handles: Vec<_> = [0.25, 0.75]
        .into_iter()
        .map(|value| {
            let barrier = Arc::clone(&barrier);
            let config = config.clone();
            let key = key.clone();
            thread::spawn(move || {
                let store = SqlitePersistenceBackend::open(&config).unwrap();
                barrier.wait();
                store.upsert_value_row(&key, value).unwrap();
                store.close().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let store = SqlitePersistenceBackend::open(&config).unwrap();
    let row = store.get_value_row(&key).unwrap().unwrap();
    assert_eq!(row.visit_count, 2);
    assert!(row.value == 0.25 || row.value == 0.75, "value {}", row.value);
    assert_eq!(store.counts().unwrap().value_rows, 1);
    assert_eq!(store.get_stat(StatCounter::TotalPatterns).unwrap(), 1);
}

#[test]
fn test_concurrent_edge_increments_are_not_lost() {
    const THREADS: usize = 4;
    const INCREMENTS: u64 = 25;

    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    SqlitePersistenceBackend::open(&config).unwrap().close().unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let config = config.clone();
            thread::spawn(move || {
                let store = SqlitePersistenceBackend::open(&config).unwrap();
                barrier.wait();
                for _ in 0..INCREMENTS {
                    // Alternate argument order; symmetric edges share one row.
                    if i % 2 == 0 {
                        store.increment_edge("a.rs", "b.rs", 1).unwrap();
                    } else {
                        store.increment_edge("b.rs", "a.rs", 1).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let store = SqlitePersistenceBackend::open(&config).unwrap();
    assert_eq!(
        store.edge_weight("a.rs", "b.rs").unwrap(),
        THREADS as u64 * INCREMENTS
    );
    assert_eq!(store.get_stat(StatCounter::TotalEdges).unwrap(), 1);
}

// ============================================================================
// Shared handle
// ============================================================================

#[test]
fn test_readers_alongside_writer_on_shared_handle() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqlitePersistenceBackend::open(&config(&dir)).unwrap());

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 0..50 {
                store.set_kv("counter", &i.to_string()).unwrap();
                store.increment_stat(StatCounter::SessionCount, 1).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..50 {
                    let sessions = store.get_stat(StatCounter::SessionCount).unwrap();
                    assert!(sessions <= 50);
                    if let Some(entry) = store.get_kv("counter").unwrap() {
                        assert!(entry.value.parse::<u32>().unwrap() < 50);
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(store.get_stat(StatCounter::SessionCount).unwrap(), 50);
    assert_eq!(store.get_kv("counter").unwrap().unwrap().value, "49");
}
