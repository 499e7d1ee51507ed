//! Command-line arguments of the `ferry` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::ExchangeConfig;
use crate::error::ConfigError;

#[derive(Parser, Debug)]
#[command(version, about = "Columnar exchange and validation engine")]
pub struct CliArgs {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for sink files and table copies
    #[arg(long, global = true)]
    pub temp_dir: Option<PathBuf>,

    /// Index of the column holding row keys
    #[arg(long, global = true)]
    pub row_key_column: Option<usize>,

    /// Maximum number of distinct values of an enumerated domain
    #[arg(long, global = true)]
    pub max_domain_values: Option<usize>,

    /// Only compute metadata, no domains
    #[arg(long, global = true)]
    pub no_domains: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate row keys and compute domains of a finalized Arrow IPC file
    Inspect {
        /// The file to inspect
        file: PathBuf,
    },
    /// Write generated batches through a sink and convert it into a table
    Demo {
        /// Number of batches to write
        #[arg(long, default_value_t = 4)]
        batches: usize,
        /// Rows per batch
        #[arg(long, default_value_t = 1000)]
        rows: usize,
    },
}

impl CliArgs {
    /// Load the configuration file, if any, and apply flag overrides.
    pub fn load_config(&self) -> Result<ExchangeConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => ExchangeConfig::from_file(path)?,
            None => ExchangeConfig::default(),
        };

        if let Some(dir) = &self.temp_dir {
            config.temp_dir = Some(dir.clone());
        }
        if let Some(column) = self.row_key_column {
            config.row_key_column = column;
        }
        if let Some(max) = self.max_domain_values {
            config.max_domain_values = max;
        }
        if self.no_domains {
            config.compute_domains = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ferry.yaml");
        std::fs::write(&path, "row_key_column: 3\nmax_domain_values: 10\n").unwrap();

        let args = CliArgs::parse_from([
            "ferry",
            "--config",
            path.to_str().unwrap(),
            "inspect",
            "data.arrow",
            "--max-domain-values",
            "7",
            "--no-domains",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.row_key_column, 3);
        assert_eq!(config.max_domain_values, 7);
        assert!(!config.compute_domains);
        assert!(matches!(args.command, Command::Inspect { ref file } if file == &PathBuf::from("data.arrow")));
    }

    #[test]
    fn test_demo_defaults() {
        let args = CliArgs::parse_from(["ferry", "demo"]);
        assert!(matches!(args.command, Command::Demo { batches: 4, rows: 1000 }));
        assert!(args.load_config().is_ok());
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = CliArgs::parse_from(["ferry", "--max-domain-values", "0", "demo"]);
        assert!(args.load_config().is_err());
    }
}
