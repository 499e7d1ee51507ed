//! Configuration for the exchange engine.
//!
//! Loaded from YAML with environment variable interpolation (see
//! [`ferry_core::config`]). Every field has a default, so an empty document
//! yields a usable configuration.

mod cli;

pub use cli::{CliArgs, Command};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings shared by the sink manager, its processors and the source factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    /// Directory for sink files and copied tables. Defaults to the system temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Column holding the row identifiers.
    #[serde(default)]
    pub row_key_column: usize,
    /// Worker count of the row-key validator.
    #[serde(default = "default_row_key_threads")]
    pub row_key_threads: usize,
    /// Maximum number of distinct values kept for an enumerated domain.
    #[serde(default = "default_max_domain_values")]
    pub max_domain_values: usize,
    /// When false only metadata is computed.
    #[serde(default = "default_compute_domains")]
    pub compute_domains: bool,
    /// Row keys held in memory before a sorted chunk is spilled to disk.
    #[serde(default = "default_duplicate_chunk_size")]
    pub duplicate_chunk_size: usize,
    /// Upper bound for waiting on a batch offset that was not yet reported.
    #[serde(default = "default_offset_wait_timeout_ms")]
    pub offset_wait_timeout_ms: u64,
    /// Interval between two cancellation checks while awaiting conversions.
    #[serde(default = "default_cancel_poll_interval_ms")]
    pub cancel_poll_interval_ms: u64,
}

fn default_row_key_threads() -> usize {
    2
}

fn default_max_domain_values() -> usize {
    60
}

fn default_compute_domains() -> bool {
    true
}

fn default_duplicate_chunk_size() -> usize {
    100_000
}

fn default_offset_wait_timeout_ms() -> u64 {
    60_000
}

fn default_cancel_poll_interval_ms() -> u64 {
    1000
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            row_key_column: 0,
            row_key_threads: default_row_key_threads(),
            max_domain_values: default_max_domain_values(),
            compute_domains: default_compute_domains(),
            duplicate_chunk_size: default_duplicate_chunk_size(),
            offset_wait_timeout_ms: default_offset_wait_timeout_ms(),
            cancel_poll_interval_ms: default_cancel_poll_interval_ms(),
        }
    }
}

impl ExchangeConfig {
    /// Parse and validate a YAML document.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = ferry_core::config::parse_yaml(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = ferry_core::load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every setting is usable.
    ///
    /// All problems are reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let positive = [
            ("row_key_threads", self.row_key_threads as u64),
            ("max_domain_values", self.max_domain_values as u64),
            ("duplicate_chunk_size", self.duplicate_chunk_size as u64),
            ("offset_wait_timeout_ms", self.offset_wait_timeout_ms),
            ("cancel_poll_interval_ms", self.cancel_poll_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                errors.push(format!("'{field}' must be greater than zero"));
            }
        }

        if let Some(dir) = &self.temp_dir
            && !dir.is_dir()
        {
            errors.push(format!(
                "'temp_dir' {} is not an existing directory",
                dir.display()
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(ConfigError::InvalidValue {
                field: "exchange",
                message: errors.remove(0),
            }),
            _ => Err(ConfigError::MultipleErrors { errors }),
        }
    }

    /// Directory where sink files and table copies are created.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn offset_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.offset_wait_timeout_ms)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ExchangeConfig::parse("{}").unwrap();
        assert_eq!(config.row_key_column, 0);
        assert_eq!(config.row_key_threads, 2);
        assert_eq!(config.max_domain_values, 60);
        assert!(config.compute_domains);
        assert_eq!(config.duplicate_chunk_size, 100_000);
        assert_eq!(config.offset_wait_timeout(), Duration::from_secs(60));
        assert_eq!(config.cancel_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.temp_dir(), std::env::temp_dir());
    }

    #[test]
    fn test_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let yaml = format!(
            "temp_dir: {}\nrow_key_column: 2\nmax_domain_values: 5\ncompute_domains: false\n",
            dir.path().display()
        );
        let config = ExchangeConfig::parse(&yaml).unwrap();
        assert_eq!(config.row_key_column, 2);
        assert_eq!(config.max_domain_values, 5);
        assert!(!config.compute_domains);
        assert_eq!(config.temp_dir(), dir.path());
    }

    #[test]
    fn test_zero_values_rejected_together() {
        let err = ExchangeConfig::parse("row_key_threads: 0\nmax_domain_values: 0\n").unwrap_err();
        match err {
            ConfigError::MultipleErrors { errors } => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("row_key_threads"));
                assert!(errors[1].contains("max_domain_values"));
            }
            other => panic!("expected MultipleErrors, got {other}"),
        }
    }

    #[test]
    fn test_single_invalid_value() {
        let err = ExchangeConfig::parse("offset_wait_timeout_ms: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("offset_wait_timeout_ms"));
    }

    #[test]
    fn test_missing_temp_dir_rejected() {
        let err = ExchangeConfig::parse("temp_dir: /definitely/not/a/dir\n").unwrap_err();
        assert!(err.to_string().contains("temp_dir"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ExchangeConfig::parse("row_keys: 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::YamlParse { .. }));
    }
}
