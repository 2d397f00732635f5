//! Configuration management.
//!
//! Configuration is always passed explicitly: callers build a
//! [`StorageConfig`] (defaults, a TOML file, environment overrides) and hand
//! it to [`BackendFactory`](crate::services::BackendFactory). Nothing here is
//! read through ambient global state.

use crate::{Error, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// File name of the legacy flat-file state inside the data directory.
pub const LEGACY_FILE_NAME: &str = "intelligence.json";

/// File name of the transactional store inside the data directory.
pub const STORE_FILE_NAME: &str = "intelligence.db";

/// Default `SQLite` busy timeout in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Environment variable selecting the backend kind.
pub const ENV_BACKEND: &str = "INTELLISTORE_BACKEND";
/// Environment variable overriding the data directory.
pub const ENV_PATH: &str = "INTELLISTORE_PATH";
/// Environment variable setting the vector dimension.
pub const ENV_DIMENSION: &str = "INTELLISTORE_DIMENSION";
/// Environment variable setting the edge policy.
pub const ENV_EDGE_POLICY: &str = "INTELLISTORE_EDGE_POLICY";

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Whole-document JSON file, rewritten on every change.
    LegacyFlatFile,
    /// `SQLite` WAL store with per-operation transactions.
    #[default]
    Transactional,
}

impl BackendKind {
    /// Returns the configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LegacyFlatFile => "legacy-flat-file",
            Self::Transactional => "transactional",
        }
    }

    /// Parses a configuration name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "legacy-flat-file" | "legacy" | "flat-file" | "json" => Ok(Self::LegacyFlatFile),
            "transactional" | "sqlite" => Ok(Self::Transactional),
            other => Err(Error::Configuration(format!(
                "unknown backend kind '{other}' (expected 'legacy-flat-file' or 'transactional')"
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How co-occurrence edges are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgePolicy {
    /// `(a, b)` and `(b, a)` are the same edge.
    #[default]
    Symmetric,
    /// `(a, b)` and `(b, a)` are distinct edges.
    Directed,
}

impl EdgePolicy {
    /// Parses a configuration name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "symmetric" | "undirected" => Ok(Self::Symmetric),
            "directed" => Ok(Self::Directed),
            other => Err(Error::Configuration(format!(
                "unknown edge policy '{other}' (expected 'symmetric' or 'directed')"
            ))),
        }
    }

    /// Orders the endpoints as they are stored under this policy.
    #[must_use]
    pub fn normalize<'a>(self, a: &'a str, b: &'a str) -> (&'a str, &'a str) {
        match self {
            Self::Symmetric if b < a => (b, a),
            _ => (a, b),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Requested backend kind.
    pub backend: BackendKind,
    /// Data directory holding the legacy file, the store and backups.
    pub path: PathBuf,
    /// Embedding dimension. Must be set before the first memory write.
    pub dimension: Option<usize>,
    /// Edge keying policy.
    pub edge_policy: EdgePolicy,
    /// `SQLite` busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: default_data_dir(),
            dimension: None,
            edge_policy: EdgePolicy::default(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Storage section.
    pub storage: Option<ConfigFileStorage>,
}

/// `[storage]` section in the config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileStorage {
    /// Backend kind.
    pub backend: Option<String>,
    /// Data directory.
    pub path: Option<String>,
    /// Vector dimension.
    pub dimension: Option<usize>,
    /// Edge policy.
    pub edge_policy: Option<String>,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: Option<u64>,
}

impl StorageConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: e.to_string(),
        })?;

        Self::from_toml_str(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the text is not valid configuration.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents)
            .map_err(|e| Error::Configuration(format!("invalid config file: {e}")))?;

        Self::from_config_file(file)
    }

    /// Loads configuration from the default location, then applies
    /// environment overrides.
    ///
    /// Looks for `intellistore/config.toml` in the platform config directory
    /// and falls back to defaults if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing config file or an override is invalid.
    pub fn load_default() -> Result<Self> {
        let config_file = directories::BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("intellistore").join("config.toml"))
            .filter(|p| p.exists());

        let mut config = match config_file {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut config = Self::default();
        let Some(storage) = file.storage else {
            return Ok(config);
        };

        if let Some(backend) = storage.backend {
            config.backend = BackendKind::parse(&backend)?;
        }
        if let Some(path) = storage.path {
            config.path = PathBuf::from(path);
        }
        if let Some(dimension) = storage.dimension {
            config.dimension = Some(validate_dimension(dimension)?);
        }
        if let Some(policy) = storage.edge_policy {
            config.edge_policy = EdgePolicy::parse(&policy)?;
        }
        if let Some(timeout) = storage.busy_timeout_ms {
            config.busy_timeout_ms = timeout;
        }

        Ok(config)
    }

    /// Applies overrides from a variable lookup (normally the process
    /// environment).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if an override value is invalid.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup(ENV_BACKEND) {
            self.backend = BackendKind::parse(&backend)?;
        }
        if let Some(path) = lookup(ENV_PATH).filter(|p| !p.trim().is_empty()) {
            self.path = PathBuf::from(path);
        }
        if let Some(dimension) = lookup(ENV_DIMENSION) {
            let parsed = dimension.trim().parse::<usize>().map_err(|e| {
                Error::Configuration(format!("{ENV_DIMENSION}='{dimension}' is not a number: {e}"))
            })?;
            self.dimension = Some(validate_dimension(parsed)?);
        }
        if let Some(policy) = lookup(ENV_EDGE_POLICY) {
            self.edge_policy = EdgePolicy::parse(&policy)?;
        }
        Ok(())
    }

    /// Sets the backend kind.
    #[must_use]
    pub const fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the vector dimension.
    #[must_use]
    pub const fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    /// Sets the edge policy.
    #[must_use]
    pub const fn with_edge_policy(mut self, policy: EdgePolicy) -> Self {
        self.edge_policy = policy;
        self
    }

    /// Path of the legacy flat file.
    #[must_use]
    pub fn legacy_file_path(&self) -> PathBuf {
        self.path.join(LEGACY_FILE_NAME)
    }

    /// Path of the transactional store.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.path.join(STORE_FILE_NAME)
    }

    /// Returns the configured dimension.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when no dimension is set. Writes that
    /// carry memory records call this instead of assuming a default.
    pub fn require_dimension(&self) -> Result<usize> {
        self.dimension.ok_or_else(|| {
            Error::Configuration(format!(
                "vector dimension is not set (set storage.dimension or {ENV_DIMENSION})"
            ))
        })
    }
}

fn validate_dimension(dimension: usize) -> Result<usize> {
    if dimension == 0 {
        return Err(Error::Configuration(
            "vector dimension must be greater than zero".to_string(),
        ));
    }
    Ok(dimension)
}

/// Returns the platform data directory for intellistore, or `.intellistore`
/// when no home directory can be determined.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "intellistore").map_or_else(
        || PathBuf::from(".intellistore"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    #[test_case("transactional", BackendKind::Transactional ; "canonical transactional")]
    #[test_case("SQLite", BackendKind::Transactional ; "sqlite alias")]
    #[test_case("legacy-flat-file", BackendKind::LegacyFlatFile ; "canonical legacy")]
    #[test_case(" json ", BackendKind::LegacyFlatFile ; "json alias with whitespace")]
    fn test_backend_kind_parse(input: &str, expected: BackendKind) {
        assert_eq!(BackendKind::parse(input).unwrap(), expected);
    }

    #[test]
    fn test_backend_kind_parse_unknown() {
        assert!(matches!(
            BackendKind::parse("redis"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_symmetric_policy_orders_endpoints() {
        assert_eq!(EdgePolicy::Symmetric.normalize("b.rs", "a.rs"), ("a.rs", "b.rs"));
        assert_eq!(EdgePolicy::Directed.normalize("b.rs", "a.rs"), ("b.rs", "a.rs"));
    }

    #[test]
    fn test_from_toml() {
        let config = StorageConfig::from_toml_str(
            r#"
            [storage]
            backend = "legacy-flat-file"
            path = "/tmp/intel"
            dimension = 384
            edge_policy = "directed"
            busy_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::LegacyFlatFile);
        assert_eq!(config.path, PathBuf::from("/tmp/intel"));
        assert_eq!(config.dimension, Some(384));
        assert_eq!(config.edge_policy, EdgePolicy::Directed);
        assert_eq!(config.busy_timeout_ms, 250);
        assert_eq!(config.store_path(), PathBuf::from("/tmp/intel/intelligence.db"));
    }

    #[test]
    fn test_from_toml_rejects_zero_dimension() {
        let result = StorageConfig::from_toml_str("[storage]\ndimension = 0\n");
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = StorageConfig::from_toml_str("").unwrap();
        assert_eq!(config.backend, BackendKind::Transactional);
        assert_eq!(config.dimension, None);
        assert_eq!(config.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
    }

    #[test]
    fn test_apply_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_BACKEND, "legacy"),
            (ENV_PATH, "/data/intel"),
            (ENV_DIMENSION, "768"),
            (ENV_EDGE_POLICY, "directed"),
        ]
        .into_iter()
        .collect();

        let mut config = StorageConfig::new();
        config
            .apply_overrides(|name| env.get(name).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.backend, BackendKind::LegacyFlatFile);
        assert_eq!(config.path, PathBuf::from("/data/intel"));
        assert_eq!(config.dimension, Some(768));
        assert_eq!(config.edge_policy, EdgePolicy::Directed);
    }

    #[test]
    fn test_apply_overrides_invalid_dimension() {
        let mut config = StorageConfig::new();
        let result = config.apply_overrides(|name| {
            (name == ENV_DIMENSION).then(|| "three hundred".to_string())
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_require_dimension_unset_is_error() {
        let config = StorageConfig::new();
        assert!(matches!(
            config.require_dimension(),
            Err(Error::Configuration(_))
        ));
        assert_eq!(config.with_dimension(384).require_dimension().unwrap(), 384);
    }
}
