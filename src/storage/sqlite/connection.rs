//! Shared connection handling for `SQLite` backends.
//!
//! Provides mutex handling with poison recovery, connection configuration
//! and the `BEGIN IMMEDIATE` transaction wrapper every write goes through.

use crate::{Error, Result};
use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};

/// Helper to acquire mutex lock with poison recovery.
///
/// If the mutex is poisoned (due to a panic in a previous critical section),
/// we recover the inner value and log a warning. `SQLite` rolls back any
/// transaction left open by the panicking thread on the next `BEGIN`.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("SQLite mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Configures a `SQLite` connection for concurrent multi-process access.
///
/// # Configuration Applied
///
/// - **WAL mode**: readers proceed while one writer commits
/// - **NORMAL synchronous**: fsync on checkpoint, not on every commit
/// - **`busy_timeout`**: waits for the write lock instead of failing with
///   `SQLITE_BUSY`
///
/// Returns the journal mode the database reports afterwards. Callers that
/// need WAL (the capability probe) check it; in-memory databases report
/// `"memory"`.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the journal mode cannot be read back.
pub fn configure_connection(conn: &Connection, busy_timeout_ms: u64) -> Result<String> {
    // pragma_update ignores the row journal_mode returns; errors here surface
    // through the read-back below.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", busy_timeout_ms.to_string());
    let _ = conn.pragma_update(None, "foreign_keys", "ON");

    conn.pragma_query_value(None, "journal_mode", |row| row.get::<_, String>(0))
        .map(|mode| mode.to_lowercase())
        .map_err(|e| Error::OperationFailed {
            operation: "configure_connection".to_string(),
            cause: e.to_string(),
        })
}

/// Maps a `rusqlite` error raised inside a transaction.
pub fn tx_error(operation: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::TransactionError {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}

/// Maps a `rusqlite` error raised outside a transaction.
pub fn read_error(operation: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::OperationFailed {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}

/// Runs `f` inside a `BEGIN IMMEDIATE` transaction.
///
/// Commits when `f` succeeds, rolls back when it fails. Errors from `f` are
/// returned unchanged so callers still see `DimensionMismatch`, `NotFound`
/// and the like; `SQLite` failures surface as [`Error::TransactionError`].
///
/// # Errors
///
/// Returns [`Error::TransactionError`] if the transaction cannot begin or
/// commit, or whatever `f` returned.
pub fn with_write_transaction<T, F>(conn: &Connection, operation: &str, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(tx_error(operation))?;

    let result = f(conn);

    match result {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(tx_error(operation)(e));
            }
            Ok(value)
        },
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            tracing::debug!(operation, error = %e, "transaction rolled back");
            Err(e)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_lock_concurrent() {
        let mutex = Arc::new(Mutex::new(0));
        let mut handles = vec![];

        for _ in 0..10 {
            let mutex_clone = Arc::clone(&mutex);
            handles.push(thread::spawn(move || {
                let mut guard = acquire_lock(&mutex_clone);
                *guard += 1;
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*acquire_lock(&mutex), 10);
    }

    #[test]
    fn test_acquire_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = Arc::clone(&mutex);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the mutex");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*acquire_lock(&mutex), 1);
    }

    #[test]
    fn test_configure_connection_file_uses_wal() {
        let dir = tempfile::TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("wal.db")).unwrap();
        let mode = configure_connection(&conn, 1234).unwrap();
        assert_eq!(mode, "wal");

        let synchronous: i32 = conn
            .pragma_query_value(None, "synchronous", |row| row.get(0))
            .unwrap();
        assert_eq!(synchronous, 1, "Expected NORMAL synchronous mode (1)");

        let busy_timeout: i64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .unwrap();
        assert_eq!(busy_timeout, 1234);
    }

    #[test]
    fn test_configure_connection_in_memory() {
        let conn = Connection::open_in_memory().unwrap();
        let mode = configure_connection(&conn, 5000).unwrap();
        assert_eq!(mode, "memory");
    }

    #[test]
    fn test_write_transaction_commits() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();

        let out = with_write_transaction(&conn, "insert", |c| {
            c.execute("INSERT INTO t (v) VALUES (1)", [])
                .map_err(tx_error("insert"))?;
            Ok(7)
        })
        .unwrap();

        assert_eq!(out, 7);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_write_transaction_rolls_back_on_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();

        let result: Result<()> = with_write_transaction(&conn, "insert", |c| {
            c.execute("INSERT INTO t (v) VALUES (1)", [])
                .map_err(tx_error("insert"))?;
            Err(Error::InvalidInput("abort".to_string()))
        });

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        // Connection is usable again after the rollback.
        assert!(with_write_transaction(&conn, "noop", |_| Ok(())).is_ok());
    }

    #[test]
    fn test_statement_failure_is_transaction_error() {
        let conn = Connection::open_in_memory().unwrap();
        let result: Result<()> = with_write_transaction(&conn, "bad_sql", |c| {
            c.execute("INSERT INTO missing_table VALUES (1)", [])
                .map_err(tx_error("bad_sql"))?;
            Ok(())
        });
        assert!(matches!(
            result,
            Err(Error::TransactionError { ref operation, .. }) if operation == "bad_sql"
        ));
    }
}
