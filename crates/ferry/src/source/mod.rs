//! Read side of the exchange.
//!
//! A [`Source`] is a read-only handle to an IPC file. It is either finalized,
//! in which case batch locations come from the file's footer, or live, in
//! which case an [`OffsetProvider`] (usually the [`Sink`] being written)
//! supplies them as they become known.

mod factory;
mod reader;

pub use factory::SourceFactory;
pub use reader::{ReadBatch, SequentialBatchReader};

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::FileReader;
use snafu::ResultExt;

use crate::error::{ExchangeError, IoSnafu, Result};
use crate::sink::Sink;
pub(crate) use factory::reserve_path;
pub(crate) use reader::LeaseCounter;
use reader::{FooterReader, LiveReader};

/// Supplies the locations of batches in a file without a footer.
pub trait OffsetProvider: Send + Sync {
    fn schema(&self) -> Option<SchemaRef>;

    fn num_batches(&self) -> usize;

    fn is_footer_written(&self) -> bool;

    /// Offset of record batch `index`. May wait until the batch is reported.
    fn record_batch_offset(&self, index: usize) -> Result<u64>;

    /// Offsets of the dictionary batches that precede record batch `index`.
    fn dictionary_batch_offsets(&self, index: usize) -> Result<Vec<u64>>;
}

/// Offsets of a file whose writer has stopped without writing a footer.
#[derive(Debug, Clone)]
pub struct FixedOffsets {
    schema: SchemaRef,
    record_offsets: Vec<u64>,
    dictionary_offsets: Vec<Vec<u64>>,
}

impl FixedOffsets {
    pub fn new(
        schema: SchemaRef,
        record_offsets: Vec<u64>,
        dictionary_offsets: Vec<Vec<u64>>,
    ) -> Result<Self> {
        if record_offsets.len() != dictionary_offsets.len() {
            return Err(ExchangeError::contract(format!(
                "{} record batch offsets but {} dictionary offset lists",
                record_offsets.len(),
                dictionary_offsets.len()
            )));
        }
        Ok(Self {
            schema,
            record_offsets,
            dictionary_offsets,
        })
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.record_offsets.len() {
            return Err(ExchangeError::BatchNotReported {
                index,
                num_batches: self.record_offsets.len(),
            });
        }
        Ok(())
    }
}

impl OffsetProvider for FixedOffsets {
    fn schema(&self) -> Option<SchemaRef> {
        Some(Arc::clone(&self.schema))
    }

    fn num_batches(&self) -> usize {
        self.record_offsets.len()
    }

    fn is_footer_written(&self) -> bool {
        false
    }

    fn record_batch_offset(&self, index: usize) -> Result<u64> {
        self.check_index(index)?;
        Ok(self.record_offsets[index])
    }

    fn dictionary_batch_offsets(&self, index: usize) -> Result<Vec<u64>> {
        self.check_index(index)?;
        Ok(self.dictionary_offsets[index].clone())
    }
}

/// Read-only handle to a finalized or live IPC file.
#[derive(Clone)]
pub struct Source {
    path: PathBuf,
    offsets: Option<Arc<dyn OffsetProvider>>,
    column_names: Option<Arc<[String]>>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("path", &self.path)
            .field("live", &self.offsets.is_some())
            .field("footer_written", &self.is_footer_written())
            .finish()
    }
}

impl Source {
    /// A file with a footer.
    pub fn finalized(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offsets: None,
            column_names: None,
        }
    }

    /// The file a sink is writing, read concurrently with the writer.
    pub fn from_sink(sink: Arc<Sink>) -> Self {
        Self {
            path: sink.path().to_path_buf(),
            offsets: Some(sink),
            column_names: None,
        }
    }

    /// A footer-less file whose batch offsets are known.
    pub fn with_offsets(path: impl Into<PathBuf>, offsets: FixedOffsets) -> Self {
        Self {
            path: path.into(),
            offsets: Some(Arc::new(offsets)),
            column_names: None,
        }
    }

    /// Attach the host's column names.
    pub fn with_column_names(mut self, names: Vec<String>) -> Self {
        self.column_names = Some(names.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn column_names(&self) -> Option<&[String]> {
        self.column_names.as_deref()
    }

    pub fn is_footer_written(&self) -> bool {
        self.offsets
            .as_ref()
            .is_none_or(|offsets| offsets.is_footer_written())
    }

    /// Number of batches, read from the footer for finalized files.
    pub fn num_batches(&self) -> Result<usize> {
        match &self.offsets {
            Some(offsets) => Ok(offsets.num_batches()),
            None => Ok(self.open_footer()?.num_batches()),
        }
    }

    pub fn schema(&self) -> Result<SchemaRef> {
        match self.offsets.as_ref().and_then(|offsets| offsets.schema()) {
            Some(schema) => Ok(schema),
            None if self.offsets.is_some() => Err(ExchangeError::contract(format!(
                "schema of {} is not known yet",
                self.path.display()
            ))),
            None => Ok(self.open_footer()?.schema()),
        }
    }

    /// Offset of record batch `index` in a footer-less file.
    ///
    /// Finalized files must be read through their footer instead.
    pub fn record_batch_offset(&self, index: usize) -> Result<u64> {
        self.live_offsets()?.record_batch_offset(index)
    }

    pub fn dictionary_batch_offsets(&self, index: usize) -> Result<Vec<u64>> {
        self.live_offsets()?.dictionary_batch_offsets(index)
    }

    /// Open a sequential reader, optionally restricted to some columns.
    pub fn open_reader(&self, projection: Option<Vec<usize>>) -> Result<Box<dyn SequentialBatchReader>> {
        match &self.offsets {
            Some(offsets) if !offsets.is_footer_written() => Ok(Box::new(LiveReader::open(
                &self.path,
                Arc::clone(offsets),
                projection,
            )?)),
            _ => Ok(Box::new(FooterReader::open(&self.path, projection)?)),
        }
    }

    fn live_offsets(&self) -> Result<&Arc<dyn OffsetProvider>> {
        match &self.offsets {
            Some(offsets) if !offsets.is_footer_written() => Ok(offsets),
            _ => Err(ExchangeError::contract(format!(
                "offsets of {} must be read from its footer",
                self.path.display()
            ))),
        }
    }

    fn open_footer(&self) -> Result<FileReader<BufReader<File>>> {
        let file = File::open(&self.path).context(IoSnafu { path: &self.path })?;
        Ok(FileReader::try_new(BufReader::new(file), None)?)
    }
}
