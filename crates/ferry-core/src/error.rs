//! Common error types shared across ferry crates.
//!
//! Configuration errors and the outcomes of an interrupted task are defined
//! here; the engine crate wraps them into its own error type.

use snafu::prelude::*;

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// A setting is outside its valid range.
    #[snafu(display("Invalid value for '{field}': {message}"))]
    InvalidValue {
        field: &'static str,
        message: String,
    },

    /// Multiple configuration errors occurred.
    #[snafu(display("Multiple config errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Task Errors ============

/// Why an awaited task produced no result.
///
/// Returned by the [`CancelableTaskRunner`](crate::cancel::CancelableTaskRunner)
/// alongside the task's own error type, which must be convertible from this.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum TaskInterrupted {
    /// The caller's cancellation predicate fired while waiting.
    #[snafu(display("Execution canceled"))]
    Canceled,

    /// The task panicked on its worker thread.
    #[snafu(display("Task panicked: {message}"))]
    Panicked { message: String },
}

impl TaskInterrupted {
    /// Convert a join failure into an interruption.
    ///
    /// An aborted task is reported as canceled; aborts only happen through
    /// the runner reacting to cancellation.
    pub fn from_join_error(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            return TaskInterrupted::Canceled;
        }
        let message = match err.try_into_panic() {
            Ok(payload) => panic_message(payload.as_ref()),
            Err(e) => e.to_string(),
        };
        TaskInterrupted::Panicked { message }
    }
}

/// Extract a human-readable message from a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
