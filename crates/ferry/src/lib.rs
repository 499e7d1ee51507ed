//! Ferry: asynchronous columnar exchange and validation engine.
//!
//! This crate handles:
//! - Sinks that a companion process writes Arrow IPC batches into, with
//!   batch offsets reported as they become known
//! - Sources that read finalized files or live sinks while they are written
//! - Row-key validation and domain computation running alongside the writer
//! - Converting sinks into tables and host tables into sources

pub mod config;
pub mod converter;
pub mod domain;
pub mod error;
pub mod inspect;
mod ipc;
pub mod manager;
pub mod processor;
pub mod rowkey;
pub mod sink;
pub mod source;
pub mod table;

// Re-export commonly used items
pub use config::{CliArgs, Command, ExchangeConfig};
pub use converter::TableConverter;
pub use domain::{
    ColumnDomain, DomainSummarizer, DomainValue, MetadataRecord, TableDomainAndMetadata, ValidityCheck,
};
pub use error::{ErrorKind, ExchangeError, Result};
pub use inspect::{InspectReport, inspect_file};
pub use manager::SinkManager;
pub use processor::{BatchContext, BatchHandler, BatchProcessor, ProcessorState, ReaderSupplier};
pub use rowkey::RowKeyValidator;
pub use sink::{BatchListener, Sink, SinkWriter};
pub use source::{FixedOffsets, OffsetProvider, ReadBatch, SequentialBatchReader, Source, SourceFactory};
pub use table::{ColumnarTable, HostTable, InMemoryTable};

// Re-export from ferry-core
pub use ferry_core::{
    CancelableTaskRunner, ExecutionMonitor, cancel_on_shutdown, init_tracing, shutdown_signal,
};
