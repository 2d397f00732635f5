//! One-time migration from the legacy flat file into the transactional
//! store.
//!
//! On every transactional open the coordinator compares the legacy file, the
//! store's migration marker and the store's contents:
//!
//! | legacy file | marker | store has rows | outcome |
//! |-------------|--------|----------------|---------|
//! | absent      | any    | any            | [`MigrationOutcome::NothingToMigrate`] |
//! | present     | set    | any            | [`MigrationOutcome::BackupCompleted`] |
//! | present     | unset  | no             | [`MigrationOutcome::Migrated`] |
//! | present     | unset  | yes            | [`Error::AmbiguousMigrationState`] |
//!
//! A legacy file that does not parse (a rewrite cut short by a crash) is
//! reported as [`MigrationOutcome::LegacyUnreadable`] and left in place.
//!
//! The import and the marker commit in one transaction, so a crash leaves
//! either no marker and no rows, or both. A crash between commit and the
//! backup rename is finished by the next open.

use crate::config::{EdgePolicy, StorageConfig};
use crate::models::{FullSnapshot, TableCounts};
use crate::storage::persistence::parse_document;
use crate::storage::{
    ImportMode, ImportOutcome, MigrationMarker, PersistenceBackend, SqlitePersistenceBackend,
};
use crate::{Error, Result};
use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// What a migration run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No legacy file exists.
    NothingToMigrate,
    /// The legacy rows were imported and the file was backed up.
    Migrated(MigrationReport),
    /// A previous run committed the import; the stale legacy file was
    /// renamed to `backup`.
    BackupCompleted {
        /// Where the stale legacy file now lives.
        backup: PathBuf,
    },
    /// Legacy file and populated store both exist without a marker. Nothing
    /// was written; [`MigrationCoordinator::resolve`] settles it.
    Ambiguous {
        /// Legacy file path.
        legacy: String,
        /// Store path.
        store: String,
    },
    /// The legacy file exists but does not parse. Nothing was written and
    /// the file was left in place;
    /// [`Resolution::KeepTransactional`] backs it up.
    LegacyUnreadable {
        /// Legacy file path.
        legacy: String,
        /// Why the document was rejected.
        reason: String,
    },
}

/// Details of a committed migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Legacy file that was read.
    pub source: PathBuf,
    /// Backup the legacy file was renamed to.
    pub backup: PathBuf,
    /// Rows read from the legacy file and written to the store.
    pub imported: TableCounts,
    /// Malformed legacy entries that were skipped.
    pub skipped_records: usize,
    /// Hex SHA-256 of the legacy file, equal to the backup's.
    pub sha256: String,
    /// RFC 3339 UTC commit time.
    pub completed_at: String,
}

/// Operator choice for an ambiguous migration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the store as is; back up the legacy file without importing it.
    KeepTransactional,
    /// Fold the legacy rows into the store, then back up the legacy file.
    MergeLegacy,
}

/// Legacy file read and hashed, ready to import.
struct LegacyInput {
    snapshot: FullSnapshot,
    skipped: usize,
    sha256: String,
    /// Set when the document failed to parse; `snapshot` is then empty.
    unreadable: Option<String>,
}

/// Drives the legacy-to-transactional migration for one data directory.
#[derive(Debug, Clone)]
pub struct MigrationCoordinator {
    legacy_path: PathBuf,
    dimension: Option<usize>,
    edge_policy: EdgePolicy,
}

impl MigrationCoordinator {
    /// Creates a coordinator for the legacy file under `config.path`.
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            legacy_path: config.legacy_file_path(),
            dimension: config.dimension,
            edge_policy: config.edge_policy,
        }
    }

    /// Returns the legacy file path.
    #[must_use]
    pub fn legacy_path(&self) -> &Path {
        &self.legacy_path
    }

    /// Migrates the legacy file into `store` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AmbiguousMigrationState`] when both sources hold
    /// data without a marker (nothing is written), a decode or transaction
    /// error if the import fails (nothing is written), and
    /// [`Error::OperationFailed`] if the backup rename or its hash check
    /// fails after the import committed.
    #[instrument(skip(self, store), fields(operation = "migrate", legacy = %self.legacy_path.display()))]
    pub fn run(&self, store: &SqlitePersistenceBackend) -> Result<MigrationOutcome> {
        if !self.legacy_path.exists() {
            return Ok(MigrationOutcome::NothingToMigrate);
        }
        if let Some(marker) = store.migration_marker()? {
            return self.finish_backup(&marker);
        }

        let input = self.read_legacy()?;
        if let Some(reason) = input.unreadable {
            tracing::warn!(
                legacy = %self.legacy_path.display(),
                reason = %reason,
                "legacy file does not parse; leaving it in place"
            );
            return Ok(MigrationOutcome::LegacyUnreadable {
                legacy: self.legacy_path.display().to_string(),
                reason,
            });
        }
        if store.counts()?.has_any_rows() {
            if !input.snapshot.counts().has_any_rows() {
                // An empty legacy file holds nothing to lose.
                return self.keep_transactional(store, input);
            }
            return Err(self.ambiguous(store));
        }

        let marker = self.new_marker();
        match store.import_snapshot(&input.snapshot, ImportMode::Fresh, Some(&marker))? {
            ImportOutcome::Imported(_) => self.complete(&marker, input),
            ImportOutcome::AlreadyMigrated(existing) => {
                tracing::info!("legacy file was migrated by another process");
                self.finish_backup(&existing)
            },
        }
    }

    /// Settles an ambiguous state with an explicit operator choice.
    ///
    /// Runs the normal checks first, so resolving an already settled
    /// directory reports what is there instead of importing twice.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run), minus the ambiguity error.
    #[instrument(skip(self, store), fields(operation = "resolve_migration", resolution = ?resolution))]
    pub fn resolve(
        &self,
        store: &SqlitePersistenceBackend,
        resolution: Resolution,
    ) -> Result<MigrationOutcome> {
        if !self.legacy_path.exists() {
            return Ok(MigrationOutcome::NothingToMigrate);
        }
        if let Some(marker) = store.migration_marker()? {
            return self.finish_backup(&marker);
        }

        let input = self.read_legacy()?;
        match resolution {
            Resolution::KeepTransactional => self.keep_transactional(store, input),
            Resolution::MergeLegacy => {
                if let Some(reason) = input.unreadable {
                    return Err(Error::CorruptRecord {
                        kind: "legacy_document".to_string(),
                        reason,
                    });
                }
                let marker = self.new_marker();
                match store.import_snapshot(&input.snapshot, ImportMode::Merge, Some(&marker))? {
                    ImportOutcome::Imported(_) => self.complete(&marker, input),
                    ImportOutcome::AlreadyMigrated(existing) => self.finish_backup(&existing),
                }
            },
        }
    }

    fn read_legacy(&self) -> Result<LegacyInput> {
        let bytes = fs::read(&self.legacy_path).map_err(|e| Error::OperationFailed {
            operation: "read_legacy_file".to_string(),
            cause: format!("{}: {e}", self.legacy_path.display()),
        })?;
        let sha256 = sha256_hex(&bytes);
        let parsed = match parse_document(&bytes, self.dimension, self.edge_policy) {
            Ok(parsed) => parsed,
            Err(Error::CorruptRecord { reason, .. }) => {
                return Ok(LegacyInput {
                    snapshot: FullSnapshot::default(),
                    skipped: 0,
                    sha256,
                    unreadable: Some(reason),
                });
            },
            Err(e) => return Err(e),
        };
        if parsed.skipped > 0 {
            tracing::warn!(
                skipped = parsed.skipped,
                "skipped malformed legacy entries during migration"
            );
        }
        Ok(LegacyInput {
            snapshot: parsed.to_snapshot(),
            skipped: parsed.skipped,
            sha256,
            unreadable: None,
        })
    }

    fn keep_transactional(
        &self,
        store: &SqlitePersistenceBackend,
        input: LegacyInput,
    ) -> Result<MigrationOutcome> {
        let marker = self.new_marker();
        store.record_migration_marker(&marker)?;
        let imported_nothing = LegacyInput {
            snapshot: FullSnapshot::default(),
            ..input
        };
        self.complete(&marker, imported_nothing)
    }

    /// Renames the legacy file to the marker's backup and checks the hash.
    fn complete(&self, marker: &MigrationMarker, input: LegacyInput) -> Result<MigrationOutcome> {
        let backup = self.rename_to_backup(&marker.backup)?;
        let backup_hash = sha256_hex(&fs::read(&backup).map_err(|e| Error::OperationFailed {
            operation: "verify_backup".to_string(),
            cause: format!("{}: {e}", backup.display()),
        })?);
        if backup_hash != input.sha256 {
            return Err(Error::OperationFailed {
                operation: "verify_backup".to_string(),
                cause: format!(
                    "backup {} hash {backup_hash} differs from legacy hash {}",
                    backup.display(),
                    input.sha256
                ),
            });
        }

        let report = MigrationReport {
            source: self.legacy_path.clone(),
            backup,
            imported: input.snapshot.counts(),
            skipped_records: input.skipped,
            sha256: input.sha256,
            completed_at: marker.completed_at.clone(),
        };
        tracing::info!(
            backup = %report.backup.display(),
            rows = report.imported.total_rows(),
            skipped = report.skipped_records,
            "migrated legacy flat file"
        );
        metrics::counter!("storage_migrations_total").increment(1);
        Ok(MigrationOutcome::Migrated(report))
    }

    /// Finishes a backup interrupted after the import committed.
    fn finish_backup(&self, marker: &MigrationMarker) -> Result<MigrationOutcome> {
        let backup = self.rename_to_backup(&marker.backup)?;
        tracing::info!(backup = %backup.display(), "backed up stale legacy file");
        Ok(MigrationOutcome::BackupCompleted { backup })
    }

    /// Renames the legacy file, picking a fresh name if `preferred` is
    /// taken. A legacy file that vanished meanwhile was renamed by another
    /// process.
    fn rename_to_backup(&self, preferred: &Path) -> Result<PathBuf> {
        let target = if preferred.as_os_str().is_empty() || preferred.exists() {
            unique_backup_path(&self.legacy_path)
        } else {
            preferred.to_path_buf()
        };
        match fs::rename(&self.legacy_path, &target) {
            Ok(()) => Ok(target),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(target),
            Err(e) => Err(Error::OperationFailed {
                operation: "backup_legacy_file".to_string(),
                cause: format!(
                    "{} -> {}: {e}",
                    self.legacy_path.display(),
                    target.display()
                ),
            }),
        }
    }

    fn new_marker(&self) -> MigrationMarker {
        MigrationMarker {
            completed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            source: self.legacy_path.clone(),
            backup: unique_backup_path(&self.legacy_path),
        }
    }

    fn ambiguous(&self, store: &SqlitePersistenceBackend) -> Error {
        Error::AmbiguousMigrationState {
            legacy: self.legacy_path.display().to_string(),
            store: store
                .db_path()
                .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string()),
        }
    }
}

/// `<legacy>.bak-<UTC timestamp>`, suffixed with `-N` until unused.
fn unique_backup_path(legacy: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let base = format!("{}.bak-{stamp}", legacy.display());
    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{base}-{n}"));
        n += 1;
    }
    candidate
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
