//! Persistence backend implementations.
//!
//! - [`SqlitePersistenceBackend`]: the transactional store
//! - [`FlatFileBackend`]: the legacy whole-document JSON file, kept as the
//!   migration source and as the fallback when the transactional store is
//!   unavailable

mod flat_document;
mod flat_file;
mod sqlite;

pub use flat_document::{LEGACY_FORMAT_VERSION, ParsedDocument, parse_document, render_document};
pub use flat_file::FlatFileBackend;
pub use sqlite::{
    ImportMode, ImportOutcome, MigrationMarker, SqlitePersistenceBackend,
};

use crate::{Error, Result};

fn require_non_empty(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidInput(format!("{what} must not be empty")));
    }
    Ok(())
}

fn require_finite(what: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(Error::InvalidInput(format!(
            "{what} must be finite, got {value}"
        )));
    }
    Ok(())
}

/// Rejects self-edges and zero increments.
fn validate_edge(file_a: &str, file_b: &str, delta: u64) -> Result<()> {
    require_non_empty("file_a", file_a)?;
    require_non_empty("file_b", file_b)?;
    if file_a == file_b {
        return Err(Error::InvalidInput(format!(
            "edge endpoints must differ, got '{file_a}' twice"
        )));
    }
    if delta == 0 {
        return Err(Error::InvalidInput(
            "edge delta must be positive".to_string(),
        ));
    }
    Ok(())
}

fn closed_error(operation: &str) -> Error {
    Error::OperationFailed {
        operation: operation.to_string(),
        cause: "store is closed".to_string(),
    }
}
