//! Sequential batch readers over finalized and live IPC files.
//!
//! A finalized file is read through its footer. A live file has no footer
//! yet, so its batches are located through the offsets an
//! [`OffsetProvider`] reports, waiting until each one becomes available.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arrow::array::{ArrayRef, RecordBatch};
use arrow::datatypes::SchemaRef;
use arrow::ipc::MetadataVersion;
use arrow::ipc::reader::{FileDecoder, FileReader};
use snafu::ResultExt;
use tracing::debug;

use super::OffsetProvider;
use crate::error::{ExchangeError, IoSnafu, Result};
use crate::ipc::{MessageKind, read_frame, read_message};

/// Reads the batches of a file one after the other.
pub trait SequentialBatchReader: Send {
    /// Schema of the batches this reader returns, after projection.
    fn schema(&self) -> SchemaRef;

    /// Read the next batch.
    ///
    /// Returns [`ExchangeError::EndOfBatches`] once a finalized file is exhausted.
    fn forward(&mut self) -> Result<ReadBatch>;

    /// Number of batches handed out and not yet released.
    fn outstanding(&self) -> usize;

    /// Release the underlying file.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Counts batches that are handed out but not yet dropped.
#[derive(Debug, Clone, Default)]
pub(crate) struct LeaseCounter(Arc<AtomicUsize>);

impl LeaseCounter {
    pub fn acquire(&self, index: usize, batch: RecordBatch) -> ReadBatch {
        self.0.fetch_add(1, Ordering::AcqRel);
        ReadBatch {
            index,
            batch,
            _lease: BatchLease(Arc::clone(&self.0)),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct BatchLease(Arc<AtomicUsize>);

impl Drop for BatchLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A batch handed out by a [`SequentialBatchReader`].
///
/// Column data is reference counted; cloning a column retains it. The batch
/// itself is released exactly once, when it is dropped.
#[derive(Debug)]
pub struct ReadBatch {
    index: usize,
    batch: RecordBatch,
    _lease: BatchLease,
}

impl ReadBatch {
    /// Position of this batch in the file.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn column(&self, index: usize) -> &ArrayRef {
        self.batch.column(index)
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }
}

/// Reader for a file whose footer has been written.
pub(crate) struct FooterReader {
    path: PathBuf,
    reader: FileReader<BufReader<File>>,
    next: usize,
    leases: LeaseCounter,
}

impl FooterReader {
    pub fn open(path: &Path, projection: Option<Vec<usize>>) -> Result<Self> {
        let file = File::open(path).context(IoSnafu { path })?;
        let reader = FileReader::try_new(BufReader::new(file), projection)?;
        debug!(path = %path.display(), batches = reader.num_batches(), "Opened finalized file");
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            next: 0,
            leases: LeaseCounter::default(),
        })
    }
}

impl SequentialBatchReader for FooterReader {
    fn schema(&self) -> SchemaRef {
        self.reader.schema()
    }

    fn forward(&mut self) -> Result<ReadBatch> {
        let batch = match self.reader.next() {
            Some(batch) => batch?,
            None => return Err(ExchangeError::EndOfBatches),
        };
        let index = self.next;
        self.next += 1;
        Ok(self.leases.acquire(index, batch))
    }

    fn outstanding(&self) -> usize {
        self.leases.outstanding()
    }

    fn close(&mut self) -> Result<()> {
        debug!(path = %self.path.display(), read = self.next, "Closed finalized file");
        Ok(())
    }
}

/// Reader for a file that may still be written to.
pub(crate) struct LiveReader {
    path: PathBuf,
    file: File,
    offsets: Arc<dyn OffsetProvider>,
    decoder: FileDecoder,
    schema: SchemaRef,
    projection: Option<Vec<usize>>,
    next: usize,
    leases: LeaseCounter,
}

impl LiveReader {
    pub fn open(
        path: &Path,
        offsets: Arc<dyn OffsetProvider>,
        projection: Option<Vec<usize>>,
    ) -> Result<Self> {
        let full_schema = offsets.schema().ok_or_else(|| {
            ExchangeError::contract(format!(
                "cannot read {} before its schema is known",
                path.display()
            ))
        })?;
        let schema = match &projection {
            Some(indices) => Arc::new(full_schema.project(indices)?),
            None => Arc::clone(&full_schema),
        };
        let file = File::open(path).context(IoSnafu { path })?;
        debug!(path = %path.display(), reported = offsets.num_batches(), "Opened live file");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            decoder: FileDecoder::new(full_schema, MetadataVersion::V5),
            offsets,
            schema,
            projection,
            next: 0,
            leases: LeaseCounter::default(),
        })
    }

    fn read_block(&mut self, offset: u64, expected: MessageKind) -> Result<(arrow::ipc::Block, arrow::buffer::Buffer)> {
        let frame = read_frame(&mut self.file, offset, &self.path)?;
        if frame.header != expected {
            return Err(ExchangeError::MalformedFile {
                path: self.path.clone(),
                offset,
                message: format!("expected {expected:?} message, found {:?}", frame.header),
            });
        }
        let buffer = read_message(&mut self.file, &frame, &self.path)?;
        Ok((frame.block(), buffer))
    }
}

impl SequentialBatchReader for LiveReader {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn forward(&mut self) -> Result<ReadBatch> {
        let index = self.next;
        let offset = self.offsets.record_batch_offset(index)?;

        for dictionary_offset in self.offsets.dictionary_batch_offsets(index)? {
            let (block, buffer) = self.read_block(dictionary_offset, MessageKind::DictionaryBatch)?;
            self.decoder.read_dictionary(&block, &buffer)?;
        }

        let (block, buffer) = self.read_block(offset, MessageKind::RecordBatch)?;
        let batch = self
            .decoder
            .read_record_batch(&block, &buffer)?
            .ok_or_else(|| ExchangeError::MalformedFile {
                path: self.path.clone(),
                offset,
                message: "record batch message without a batch".to_string(),
            })?;
        let batch = match &self.projection {
            Some(indices) => batch.project(indices)?,
            None => batch,
        };

        self.next += 1;
        Ok(self.leases.acquire(index, batch))
    }

    fn outstanding(&self) -> usize {
        self.leases.outstanding()
    }

    fn close(&mut self) -> Result<()> {
        debug!(path = %self.path.display(), read = self.next, "Closed live file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    use crate::sink::{Sink, SinkWriter};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("value", DataType::Int64, false),
        ]))
    }

    fn batch(keys: &[&str], values: &[i64]) -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(StringArray::from(keys.to_vec())),
                Arc::new(Int64Array::from(values.to_vec())),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_live_reader_follows_reported_batches() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(Sink::new(dir.path().join("live.arrow"), Duration::from_secs(5)));
        let mut writer = SinkWriter::try_new(Arc::clone(&sink), schema()).unwrap();
        writer.write(&batch(&["a", "b"], &[1, 2])).unwrap();

        let mut reader = LiveReader::open(sink.path(), sink.clone(), Some(vec![1])).unwrap();
        assert_eq!(reader.schema().fields().len(), 1);

        let first = reader.forward().unwrap();
        assert_eq!(first.index(), 0);
        assert_eq!(first.num_columns(), 1);
        assert_eq!(reader.outstanding(), 1);
        drop(first);
        assert_eq!(reader.outstanding(), 0);

        writer.write(&batch(&["c"], &[3])).unwrap();
        let second = reader.forward().unwrap();
        assert_eq!(second.index(), 1);
        assert_eq!(second.num_rows(), 1);
        writer.close_partial().unwrap();
    }

    #[test]
    fn test_footer_reader_reaches_end() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(Sink::new(dir.path().join("done.arrow"), Duration::from_secs(5)));
        let mut writer = SinkWriter::try_new(Arc::clone(&sink), schema()).unwrap();
        writer.write(&batch(&["a"], &[1])).unwrap();
        writer.finish().unwrap();

        let mut reader = FooterReader::open(sink.path(), None).unwrap();
        let only = reader.forward().unwrap();
        assert_eq!(only.num_rows(), 1);
        assert!(matches!(reader.forward(), Err(ExchangeError::EndOfBatches)));
    }

    #[test]
    fn test_live_reader_requires_schema() {
        let sink = Arc::new(Sink::new("/tmp/ferry-no-schema.arrow", Duration::from_secs(1)));
        let err = LiveReader::open(sink.path(), sink.clone(), None).err().unwrap();
        assert!(matches!(err, ExchangeError::ContractViolation { .. }));
    }
}
