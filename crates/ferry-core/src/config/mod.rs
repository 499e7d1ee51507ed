//! Configuration loading shared by ferry binaries and embedders.
//!
//! Config files are YAML. Environment variables are interpolated before
//! parsing so secrets and per-host paths never need to live in the file.

mod vars;

pub use vars::{InterpolationResult, interpolate};

use std::path::Path;

use serde::de::DeserializeOwned;
use snafu::ResultExt;

use crate::error::{ConfigError, ReadFileSnafu, YamlParseSnafu};

/// Parse a YAML document after interpolating environment variables.
pub fn parse_yaml<T: DeserializeOwned>(contents: &str) -> Result<T, ConfigError> {
    let result = interpolate(contents);
    if !result.is_ok() {
        return Err(ConfigError::EnvInterpolation {
            message: result.errors.join("\n"),
        });
    }

    serde_yaml::from_str(&result.text).context(YamlParseSnafu)
}

/// Read and parse a YAML config file.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    parse_yaml(&contents)
}

/// Check if a path has a YAML extension.
pub fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false)
}
