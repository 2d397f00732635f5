//! Structured logging configuration.

use crate::{Error, Result};
use std::path::PathBuf;

/// Environment variable holding the `EnvFilter` directive.
pub const ENV_LOG: &str = "INTELLISTORE_LOG";
/// Environment variable selecting `json` or `pretty` output.
pub const ENV_LOG_FORMAT: &str = "INTELLISTORE_LOG_FORMAT";
/// Environment variable naming a log file; stderr is used when unset.
pub const ENV_LOG_FILE: &str = "INTELLISTORE_LOG_FILE";

/// Default filter directive. Hook processes stay quiet unless something
/// degrades.
pub const DEFAULT_FILTER: &str = "warn";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parses a format name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(Error::Configuration(format!(
                "unknown log format '{other}' (expected 'pretty' or 'json')"
            ))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `intellistore=debug`.
    pub filter: String,
    /// Output format.
    pub format: LogFormat,
    /// Optional log file (appended to).
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Builds a configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unknown log format.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unknown log format.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(filter) = lookup(ENV_LOG).filter(|v| !v.trim().is_empty()) {
            config.filter = filter;
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT) {
            config.format = LogFormat::parse(&format)?;
        }
        config.file = lookup(ENV_LOG_FILE)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    #[test_case("json", LogFormat::Json; "json")]
    #[test_case("PRETTY", LogFormat::Pretty; "uppercase pretty")]
    #[test_case(" text ", LogFormat::Pretty; "text alias")]
    fn test_log_format_parse(input: &str, expected: LogFormat) {
        assert_eq!(LogFormat::parse(input).unwrap(), expected);
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = LoggingConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, LoggingConfig::default());
    }

    #[test]
    fn test_from_lookup_reads_all_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_LOG, "intellistore=debug"),
            (ENV_LOG_FORMAT, "json"),
            (ENV_LOG_FILE, "/tmp/intellistore.log"),
        ]);
        let config =
            LoggingConfig::from_lookup(|key| vars.get(key).map(ToString::to_string)).unwrap();

        assert_eq!(config.filter, "intellistore=debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/intellistore.log")));
    }

    #[test]
    fn test_from_lookup_rejects_unknown_format() {
        let result = LoggingConfig::from_lookup(|key| {
            (key == ENV_LOG_FORMAT).then(|| "xml".to_string())
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
