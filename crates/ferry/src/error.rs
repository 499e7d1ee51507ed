//! Error types for the ferry exchange engine.
//!
//! [`ExchangeError`] is `Clone` so that a processor can latch its first error
//! once and hand the same cause to every later caller. Foreign sources are
//! therefore held in `Arc`.

use std::path::PathBuf;
use std::sync::Arc;

use arrow::datatypes::DataType;
use arrow::error::ArrowError;
use snafu::prelude::*;

pub use ferry_core::error::{ConfigError, TaskInterrupted};

/// The distinguished conditions a host can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// File or decoding failure.
    Io,
    /// Row-key validation failed.
    DuplicateKey,
    /// The caller's cancellation predicate fired.
    Canceled,
    /// The caller broke the sink or manager contract.
    ContractViolation,
}

/// Errors produced by sinks, sources, processors and the sink manager.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum ExchangeError {
    /// File system operation failed.
    #[snafu(display("I/O error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Arc::new)))]
        source: Arc<std::io::Error>,
    },

    /// Arrow failed to encode or decode IPC data.
    #[snafu(display("Arrow IPC error: {source}"))]
    Arrow {
        #[snafu(source(from(ArrowError, Arc::new)))]
        source: Arc<ArrowError>,
    },

    /// The file does not contain a valid IPC message where one was expected.
    #[snafu(display("Malformed IPC file {} at offset {offset}: {message}", path.display()))]
    MalformedFile {
        path: PathBuf,
        offset: u64,
        message: String,
    },

    /// Two rows share the same row key.
    #[snafu(display("Row key checking: duplicate row key '{key}'"))]
    DuplicateKey { key: String },

    /// A row key is missing.
    #[snafu(display("Row key checking: missing row key in row {row}"))]
    NullRowKey { row: usize },

    /// The row-key column has a type that cannot serve as an identifier.
    #[snafu(display("Row key checking: unsupported row key type {data_type}"))]
    UnsupportedRowKeyType { data_type: DataType },

    /// Execution was canceled while waiting.
    #[snafu(display("Execution canceled"))]
    Canceled,

    /// A batch offset was not reported within the configured wait.
    #[snafu(display("Batch {index} was not reported within {waited_ms} ms"))]
    OffsetTimeout { index: usize, waited_ms: u64 },

    /// The writer went away before reporting the requested batch.
    #[snafu(display("Writer abandoned the sink before reporting batch {index}"))]
    WriterAbandoned { index: usize },

    /// The requested batch will never be reported.
    #[snafu(display("Batch {index} requested but only {num_batches} batches were written"))]
    BatchNotReported { index: usize, num_batches: usize },

    /// The caller broke the usage contract.
    #[snafu(display("Contract violation: {message}"))]
    ContractViolation { message: String },

    /// A batch worker panicked.
    #[snafu(display("Batch worker panicked: {message}"))]
    WorkerPanicked { message: String },

    /// The reader has no more batches.
    #[snafu(display("No more batches to read"))]
    EndOfBatches,

    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config {
        #[snafu(source(from(ConfigError, Arc::new)))]
        source: Arc<ConfigError>,
    },
}

impl ExchangeError {
    /// Classify this error into one of the host-visible conditions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::DuplicateKey { .. }
            | ExchangeError::NullRowKey { .. }
            | ExchangeError::UnsupportedRowKeyType { .. } => ErrorKind::DuplicateKey,
            ExchangeError::Canceled => ErrorKind::Canceled,
            ExchangeError::ContractViolation { .. } | ExchangeError::Config { .. } => {
                ErrorKind::ContractViolation
            }
            ExchangeError::Io { .. }
            | ExchangeError::Arrow { .. }
            | ExchangeError::MalformedFile { .. }
            | ExchangeError::OffsetTimeout { .. }
            | ExchangeError::WriterAbandoned { .. }
            | ExchangeError::BatchNotReported { .. }
            | ExchangeError::WorkerPanicked { .. }
            | ExchangeError::EndOfBatches => ErrorKind::Io,
        }
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.kind() == ErrorKind::DuplicateKey
    }

    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::Canceled
    }

    pub(crate) fn contract(message: impl Into<String>) -> Self {
        ExchangeError::ContractViolation {
            message: message.into(),
        }
    }
}

impl From<ArrowError> for ExchangeError {
    fn from(source: ArrowError) -> Self {
        ExchangeError::Arrow {
            source: Arc::new(source),
        }
    }
}

impl From<ConfigError> for ExchangeError {
    fn from(source: ConfigError) -> Self {
        ExchangeError::Config {
            source: Arc::new(source),
        }
    }
}

impl From<TaskInterrupted> for ExchangeError {
    fn from(source: TaskInterrupted) -> Self {
        match source {
            TaskInterrupted::Canceled => ExchangeError::Canceled,
            TaskInterrupted::Panicked { message } => ExchangeError::WorkerPanicked { message },
        }
    }
}

pub type Result<T, E = ExchangeError> = std::result::Result<T, E>;
