//! Tables handed between the host and the engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;

use crate::domain::TableDomainAndMetadata;
use crate::error::{ExchangeError, Result};
use crate::sink::Sink;
use crate::source::{FixedOffsets, Source};

/// A table stored in an Arrow IPC file.
///
/// Produced by converting a sink, or wrapping an existing finalized file.
#[derive(Debug, Clone)]
pub struct ColumnarTable {
    path: PathBuf,
    schema: SchemaRef,
    row_count: u64,
    footer_written: bool,
    record_offsets: Vec<u64>,
    dictionary_offsets: Vec<Vec<u64>>,
    column_names: Option<Vec<String>>,
    summary: TableDomainAndMetadata,
}

impl ColumnarTable {
    /// Wrap a finalized IPC file, counting its rows from the footer.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let source = Source::finalized(&path);
        let schema = source.schema()?;

        // one column is enough to count rows
        let projection = (!schema.fields().is_empty()).then(|| vec![0]);
        let mut reader = source.open_reader(projection)?;
        let mut row_count = 0;
        for _ in 0..source.num_batches()? {
            row_count += reader.forward()?.num_rows() as u64;
        }
        reader.close()?;

        Ok(Self {
            path,
            schema,
            row_count,
            footer_written: true,
            record_offsets: Vec::new(),
            dictionary_offsets: Vec::new(),
            column_names: None,
            summary: TableDomainAndMetadata::default(),
        })
    }

    /// Snapshot a sink whose batches have all been analyzed.
    pub(crate) fn from_sink(sink: &Sink, row_count: u64, summary: TableDomainAndMetadata) -> Result<Self> {
        let schema = sink.schema().ok_or_else(|| {
            ExchangeError::contract(format!("sink {} has no schema", sink.id()))
        })?;
        let footer_written = sink.is_footer_written();
        let (record_offsets, dictionary_offsets) = if footer_written {
            (Vec::new(), Vec::new())
        } else {
            sink.reported_offsets()
        };

        Ok(Self {
            path: sink.path().to_path_buf(),
            schema,
            row_count,
            footer_written,
            record_offsets,
            dictionary_offsets,
            column_names: None,
            summary,
        })
    }

    pub fn with_column_names(mut self, names: Vec<String>) -> Self {
        self.column_names = Some(names);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn is_footer_written(&self) -> bool {
        self.footer_written
    }

    pub fn column_names(&self) -> Option<&[String]> {
        self.column_names.as_deref()
    }

    /// Domains and metadata computed while the table was written.
    pub fn domain_and_metadata(&self) -> &TableDomainAndMetadata {
        &self.summary
    }

    /// A source reading this table's file.
    pub fn source(&self) -> Result<Source> {
        let source = if self.footer_written {
            Source::finalized(&self.path)
        } else {
            let offsets = FixedOffsets::new(
                Arc::clone(&self.schema),
                self.record_offsets.clone(),
                self.dictionary_offsets.clone(),
            )?;
            Source::with_offsets(&self.path, offsets)
        };
        Ok(match &self.column_names {
            Some(names) => source.with_column_names(names.clone()),
            None => source,
        })
    }

    /// Read every batch of the table.
    pub fn read_all(&self) -> Result<Vec<RecordBatch>> {
        let source = self.source()?;
        let mut reader = source.open_reader(None)?;
        let mut batches = Vec::new();
        for _ in 0..source.num_batches()? {
            batches.push(reader.forward()?.record_batch().clone());
        }
        reader.close()?;
        Ok(batches)
    }
}

/// A table held in memory by the host.
#[derive(Debug, Clone)]
pub struct InMemoryTable {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    column_names: Option<Vec<String>>,
}

impl InMemoryTable {
    /// Fails if a batch does not match `schema`.
    pub fn try_new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        if let Some(index) = batches
            .iter()
            .position(|batch| batch.schema().fields() != schema.fields())
        {
            return Err(ExchangeError::contract(format!(
                "batch {index} does not match the table schema"
            )));
        }
        Ok(Self {
            schema,
            batches,
            column_names: None,
        })
    }

    pub fn with_column_names(mut self, names: Vec<String>) -> Self {
        self.column_names = Some(names);
        self
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> u64 {
        self.batches.iter().map(|b| b.num_rows() as u64).sum()
    }

    pub fn column_names(&self) -> Option<&[String]> {
        self.column_names.as_deref()
    }
}

/// Any table the host may ask to read from.
#[derive(Debug, Clone)]
pub enum HostTable {
    Columnar(ColumnarTable),
    InMemory(InMemoryTable),
}

impl From<ColumnarTable> for HostTable {
    fn from(table: ColumnarTable) -> Self {
        HostTable::Columnar(table)
    }
}

impl From<InMemoryTable> for HostTable {
    fn from(table: InMemoryTable) -> Self {
        HostTable::InMemory(table)
    }
}
