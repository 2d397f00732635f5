//! Backend factory for storage layer initialization.
//!
//! Centralizes backend selection so callers never silently assume
//! transactional guarantees:
//!
//! ```text
//! BackendFactory::open(config)
//!   ├── legacy-flat-file → FlatFileBackend
//!   └── transactional
//!         ├── probe (once per factory) fails → FlatFileBackend (degraded)
//!         ├── open fails                     → FlatFileBackend (degraded)
//!         └── SqlitePersistenceBackend + MigrationCoordinator::run
//! ```
//!
//! # Graceful Degradation
//!
//! A failed probe or open falls back to the legacy backend with a warning;
//! [`StoreHandle::status`] reports the backend actually in use and why.

use crate::config::{BackendKind, StorageConfig};
use crate::services::migration::{MigrationCoordinator, MigrationOutcome};
use crate::storage::sqlite::configure_connection;
use crate::storage::{FlatFileBackend, PersistenceBackend, SqlitePersistenceBackend};
use crate::{Error, Result};
use rusqlite::{Connection, TransactionBehavior};
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::sync::OnceLock;

/// Result of a capability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Whether the transactional backend can be used.
    pub available: bool,
    /// Journal mode the probe observed, if it got that far.
    pub journal_mode: Option<String>,
    /// Human-readable outcome.
    pub detail: String,
}

impl ProbeReport {
    /// A successful probe.
    #[must_use]
    pub fn available(journal_mode: impl Into<String>) -> Self {
        Self {
            available: true,
            journal_mode: Some(journal_mode.into()),
            detail: "ok".to_string(),
        }
    }

    /// A failed probe.
    #[must_use]
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            available: false,
            journal_mode: None,
            detail: detail.into(),
        }
    }
}

/// Decides whether the transactional backend works on this host.
///
/// Evaluated at most once per [`BackendFactory`].
pub trait CapabilityProbe: Send + Sync {
    /// Short name used in logs and fallback reasons.
    fn name(&self) -> &'static str;

    /// Checks the store location named by `config`.
    fn probe(&self, config: &StorageConfig) -> ProbeReport;
}

/// Probes by exercising a real `SQLite` connection at the store path.
///
/// Opens the database, confirms WAL journaling took effect, then creates a
/// probe table, writes and reads back a row inside a `BEGIN IMMEDIATE`
/// transaction and rolls it back. Nothing persists except the (possibly new)
/// empty database file.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteSelfTest;

impl SqliteSelfTest {
    fn self_test(path: &Path, busy_timeout_ms: u64) -> Result<String> {
        let probe_error = |stage: &str, cause: String| Error::OperationFailed {
            operation: format!("probe_{stage}"),
            cause,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| probe_error("mkdir", e.to_string()))?;
        }
        let mut conn = Connection::open(path).map_err(|e| probe_error("open", e.to_string()))?;
        let journal_mode = configure_connection(&conn, busy_timeout_ms)?;
        if journal_mode != "wal" {
            return Err(probe_error(
                "journal_mode",
                format!("expected wal, database reports '{journal_mode}'"),
            ));
        }

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| probe_error("begin", e.to_string()))?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS _intellistore_probe (
                id INTEGER PRIMARY KEY,
                token TEXT NOT NULL
            )",
        )
        .map_err(|e| probe_error("create", e.to_string()))?;
        let token = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO _intellistore_probe (token) VALUES (?1)",
            [&token],
        )
        .map_err(|e| probe_error("insert", e.to_string()))?;
        let read_back: String = tx
            .query_row(
                "SELECT token FROM _intellistore_probe WHERE token = ?1",
                [&token],
                |row| row.get(0),
            )
            .map_err(|e| probe_error("select", e.to_string()))?;
        tx.rollback()
            .map_err(|e| probe_error("rollback", e.to_string()))?;

        if read_back != token {
            return Err(probe_error(
                "select",
                "probe row read back with different contents".to_string(),
            ));
        }
        Ok(journal_mode)
    }
}

impl CapabilityProbe for SqliteSelfTest {
    fn name(&self) -> &'static str {
        "sqlite_self_test"
    }

    fn probe(&self, config: &StorageConfig) -> ProbeReport {
        match Self::self_test(&config.store_path(), config.busy_timeout_ms) {
            Ok(mode) => ProbeReport::available(mode),
            Err(e) => ProbeReport::unavailable(e.to_string()),
        }
    }
}

/// Which backend a [`StoreHandle`] uses, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    /// Backend the configuration asked for.
    pub requested: BackendKind,
    /// Backend actually in use.
    pub active: BackendKind,
    /// Why `active` differs from `requested`.
    pub fallback_reason: Option<String>,
    /// Probe result, when a probe ran.
    pub probe: Option<ProbeReport>,
    /// Migration result, when the transactional backend opened.
    pub migration: Option<MigrationOutcome>,
}

impl BackendStatus {
    /// Returns true if the store runs on a weaker backend than requested.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.active != self.requested
    }
}

/// An open store plus the status of how it was selected.
///
/// Dereferences to the backend, so every [`PersistenceBackend`] operation
/// is available directly on the handle.
pub struct StoreHandle {
    backend: Box<dyn PersistenceBackend>,
    status: BackendStatus,
}

impl StoreHandle {
    /// Returns how the backend was selected.
    #[must_use]
    pub const fn status(&self) -> &BackendStatus {
        &self.status
    }

    /// Consumes the handle, returning the backend.
    #[must_use]
    pub fn into_backend(self) -> Box<dyn PersistenceBackend> {
        self.backend
    }
}

impl Deref for StoreHandle {
    type Target = dyn PersistenceBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("backend", &self.backend.kind())
            .field("status", &self.status)
            .finish()
    }
}

/// Factory for opening a store according to a [`StorageConfig`].
///
/// Holds the capability probe and its cached result; there is no global
/// state, so independent factories probe independently.
///
/// # Example
///
/// ```rust,ignore
/// use intellistore::{BackendFactory, StorageConfig};
///
/// let factory = BackendFactory::default();
/// let store = factory.open(&StorageConfig::new().with_dimension(384))?;
/// if store.status().is_degraded() {
///     eprintln!("running without transactions: {:?}", store.status().fallback_reason);
/// }
/// ```
pub struct BackendFactory {
    probe: Box<dyn CapabilityProbe>,
    cached: OnceLock<ProbeReport>,
}

impl Default for BackendFactory {
    fn default() -> Self {
        Self::new(SqliteSelfTest)
    }
}

impl BackendFactory {
    /// Creates a factory using `probe`.
    #[must_use]
    pub fn new(probe: impl CapabilityProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            cached: OnceLock::new(),
        }
    }

    /// Returns the probe result, running the probe on first use.
    ///
    /// Later calls return the cached result even for a different config.
    pub fn probe_report(&self, config: &StorageConfig) -> &ProbeReport {
        self.cached.get_or_init(|| {
            let report = self.probe.probe(config);
            tracing::debug!(
                probe = self.probe.name(),
                available = report.available,
                detail = %report.detail,
                "capability probe finished"
            );
            report
        })
    }

    /// Opens the backend `config` asks for, falling back to the legacy
    /// backend if the transactional one is unavailable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OpenError`] if the legacy backend cannot be opened
    /// (directly or as fallback), or a migration error other than an
    /// ambiguous state. An unparseable legacy file is reported in the
    /// status, not returned. Returns [`Error::DimensionMismatch`] if the
    /// store holds vectors of another dimension than configured.
    pub fn open(&self, config: &StorageConfig) -> Result<StoreHandle> {
        match config.backend {
            BackendKind::LegacyFlatFile => Ok(StoreHandle {
                backend: Box::new(FlatFileBackend::open(config)?),
                status: BackendStatus {
                    requested: BackendKind::LegacyFlatFile,
                    active: BackendKind::LegacyFlatFile,
                    fallback_reason: None,
                    probe: None,
                    migration: None,
                },
            }),
            BackendKind::Transactional => self.open_transactional(config),
        }
    }

    fn open_transactional(&self, config: &StorageConfig) -> Result<StoreHandle> {
        let report = self.probe_report(config).clone();
        if !report.available {
            let reason = format!(
                "capability probe '{}' failed: {}",
                self.probe.name(),
                report.detail
            );
            return Self::fall_back(config, reason, Some(report));
        }

        let store = match SqlitePersistenceBackend::open(config) {
            Ok(store) => store,
            // A wrong dimension is a configuration fault, not an unavailable backend.
            Err(e @ Error::DimensionMismatch { .. }) => return Err(e),
            Err(e) => {
                return Self::fall_back(config, format!("open failed: {e}"), Some(report));
            },
        };

        let migration = match MigrationCoordinator::new(config).run(&store) {
            Ok(outcome) => outcome,
            Err(Error::AmbiguousMigrationState { legacy, store: path }) => {
                tracing::warn!(
                    legacy = %legacy,
                    store = %path,
                    "legacy file and populated store both exist; resolve the migration explicitly"
                );
                MigrationOutcome::Ambiguous {
                    legacy,
                    store: path,
                }
            },
            Err(e) => {
                let _ = store.close();
                return Err(e);
            },
        };

        Ok(StoreHandle {
            backend: Box::new(store),
            status: BackendStatus {
                requested: BackendKind::Transactional,
                active: BackendKind::Transactional,
                fallback_reason: None,
                probe: Some(report),
                migration: Some(migration),
            },
        })
    }

    fn fall_back(
        config: &StorageConfig,
        reason: String,
        probe: Option<ProbeReport>,
    ) -> Result<StoreHandle> {
        tracing::warn!(
            reason = %reason,
            "transactional backend unavailable, falling back to legacy flat file"
        );
        metrics::counter!("storage_backend_fallback_total").increment(1);
        Ok(StoreHandle {
            backend: Box::new(FlatFileBackend::open(config)?),
            status: BackendStatus {
                requested: BackendKind::Transactional,
                active: BackendKind::LegacyFlatFile,
                fallback_reason: Some(reason),
                probe,
                migration: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingProbe {
        calls: Arc<AtomicUsize>,
        available: bool,
    }

    impl CapabilityProbe for CountingProbe {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn probe(&self, _config: &StorageConfig) -> ProbeReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.available {
                ProbeReport::available("wal")
            } else {
                ProbeReport::unavailable("forced failure")
            }
        }
    }

    fn config(dir: &TempDir) -> StorageConfig {
        StorageConfig::new()
            .with_backend(BackendKind::Transactional)
            .with_path(dir.path())
            .with_dimension(2)
    }

    #[test]
    fn test_sqlite_self_test_reports_wal() {
        let dir = TempDir::new().unwrap();
        let report = SqliteSelfTest.probe(&config(&dir));
        assert!(report.available, "{}", report.detail);
        assert_eq!(report.journal_mode.as_deref(), Some("wal"));
    }

    #[test]
    fn test_self_test_leaves_no_probe_table() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        assert!(SqliteSelfTest.probe(&config).available);

        let conn = Connection::open(config.store_path()).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = '_intellistore_probe'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn test_transactional_open_is_not_degraded() {
        let dir = TempDir::new().unwrap();
        let store = BackendFactory::default().open(&config(&dir)).unwrap();
        assert_eq!(store.kind(), BackendKind::Transactional);
        assert!(!store.status().is_degraded());
        assert_eq!(
            store.status().migration,
            Some(MigrationOutcome::NothingToMigrate)
        );
    }

    #[test]
    fn test_failing_probe_falls_back_and_is_cached() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = BackendFactory::new(CountingProbe {
            calls: Arc::clone(&calls),
            available: false,
        });

        let first = factory.open(&config(&dir)).unwrap();
        let second = factory.open(&config(&dir)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for store in [&first, &second] {
            assert_eq!(store.kind(), BackendKind::LegacyFlatFile);
            let status = store.status();
            assert!(status.is_degraded());
            assert!(
                status
                    .fallback_reason
                    .as_deref()
                    .is_some_and(|r| r.contains("forced failure"))
            );
        }
    }

    #[test]
    fn test_legacy_backend_skips_probe() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = BackendFactory::new(CountingProbe {
            calls: Arc::clone(&calls),
            available: true,
        });
        let config = config(&dir).with_backend(BackendKind::LegacyFlatFile);

        let store = factory.open(&config).unwrap();
        assert_eq!(store.kind(), BackendKind::LegacyFlatFile);
        assert!(!store.status().is_degraded());
        assert!(store.status().probe.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ambiguous_state_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        {
            let store = SqlitePersistenceBackend::open(&config).unwrap();
            store.set_kv("k", "v").unwrap();
            store.close().unwrap();
        }
        std::fs::write(
            config.legacy_file_path(),
            r#"{"kv": [{"key": "old", "value": "x", "updated_at": 1}]}"#,
        )
        .unwrap();

        let store = BackendFactory::default().open(&config).unwrap();
        assert!(matches!(
            store.status().migration,
            Some(MigrationOutcome::Ambiguous { .. })
        ));
        assert!(store.get_kv("old").unwrap().is_none());
        assert!(config.legacy_file_path().exists());
    }

    #[test]
    fn test_unparseable_legacy_file_does_not_block_open() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        std::fs::write(config.legacy_file_path(), "{ not json").unwrap();

        let store = BackendFactory::default().open(&config).unwrap();
        assert_eq!(store.kind(), BackendKind::Transactional);
        assert!(matches!(
            store.status().migration,
            Some(MigrationOutcome::LegacyUnreadable { .. })
        ));
        store.set_kv("k", "v").unwrap();
        assert_eq!(
            std::fs::read_to_string(config.legacy_file_path()).unwrap(),
            "{ not json"
        );
    }
}
