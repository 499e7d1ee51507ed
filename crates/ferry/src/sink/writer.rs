//! Companion-side writer that streams record batches into a sink file.
//!
//! Batches are written in the Arrow IPC file format. After each batch the
//! bytes are flushed to disk and only then reported to the [`Sink`], so a
//! reader that sees an offset can always read the message behind it.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use arrow::ipc::writer::FileWriter;
use snafu::ResultExt;
use tracing::debug;

use super::Sink;
use crate::error::{ExchangeError, IoSnafu, Result};
use crate::ipc::{MessageKind, scan_messages};

/// Counts bytes passing through and optionally keeps a copy of them.
struct TrackingWriter {
    inner: BufWriter<File>,
    position: u64,
    capture: Option<Vec<u8>>,
}

impl TrackingWriter {
    fn new(file: File) -> Self {
        Self {
            inner: BufWriter::new(file),
            position: 0,
            capture: None,
        }
    }

    fn start_capture(&mut self) {
        self.capture = Some(Vec::new());
    }

    fn take_capture(&mut self) -> Vec<u8> {
        self.capture.take().unwrap_or_default()
    }
}

impl Write for TrackingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.position += written as u64;
        if let Some(capture) = &mut self.capture {
            capture.extend_from_slice(&buf[..written]);
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Writes record batches into the file of a [`Sink`] and reports them.
pub struct SinkWriter {
    sink: Arc<Sink>,
    writer: FileWriter<TrackingWriter>,
    schema: SchemaRef,
    schema_reported: bool,
    rows: u64,
    batches: usize,
}

impl SinkWriter {
    /// Create the sink file and write the IPC header.
    pub fn try_new(sink: Arc<Sink>, schema: SchemaRef) -> Result<Self> {
        let file = File::create(sink.path()).context(IoSnafu { path: sink.path() })?;
        let writer = FileWriter::try_new(TrackingWriter::new(file), &schema)?;

        Ok(Self {
            sink,
            writer,
            schema,
            schema_reported: false,
            rows: 0,
            batches: 0,
        })
    }

    pub fn sink(&self) -> &Arc<Sink> {
        &self.sink
    }

    /// Rows written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Write one batch and report it to the sink.
    ///
    /// Empty batches are skipped. An error from a batch listener (for example
    /// a duplicate row key found while writing) is returned after the batch
    /// has been written and reported.
    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        if batch.schema().fields() != self.schema.fields() {
            return Err(ExchangeError::contract(
                "batch schema does not match the schema of the writer",
            ));
        }

        let start = self.writer.get_ref().position;
        self.writer.get_mut().start_capture();
        let written = self.writer.write(batch);
        let bytes = self.writer.get_mut().take_capture();
        written?;
        self.flush()?;

        let frames = scan_messages(&bytes, start, self.sink.path())?;
        let dictionary_offsets: Vec<u64> = frames
            .iter()
            .filter(|f| f.header == MessageKind::DictionaryBatch)
            .map(|f| f.offset)
            .collect();
        let record_offset = frames
            .iter()
            .find(|f| f.header == MessageKind::RecordBatch)
            .map(|f| f.offset)
            .ok_or_else(|| ExchangeError::MalformedFile {
                path: self.sink.path().to_path_buf(),
                offset: start,
                message: "no record batch message was written".to_string(),
            })?;

        self.report_schema()?;
        self.rows += batch.num_rows() as u64;
        self.batches += 1;
        debug!(
            sink = self.sink.id(),
            batch = self.batches - 1,
            offset = record_offset,
            dictionaries = dictionary_offsets.len(),
            rows = batch.num_rows(),
            "Batch written"
        );
        self.sink
            .report_batch_written_with_dictionaries(record_offset, dictionary_offsets)
    }

    /// Write the footer and finalize the sink.
    ///
    /// Returns the number of rows written.
    pub fn finish(mut self) -> Result<u64> {
        self.report_schema()?;
        self.writer.finish()?;
        self.flush()?;
        self.sink.set_final_size(self.rows);
        self.sink.mark_footer_written();
        debug!(sink = self.sink.id(), rows = self.rows, batches = self.batches, "Sink finalized");
        Ok(self.rows)
    }

    /// Stop writing without a footer.
    ///
    /// Readers keep using the reported offsets.
    pub fn close_partial(mut self) -> Result<u64> {
        self.report_schema()?;
        self.flush()?;
        self.sink.set_final_size(self.rows);
        debug!(sink = self.sink.id(), rows = self.rows, batches = self.batches, "Sink left open");
        Ok(self.rows)
    }

    fn report_schema(&mut self) -> Result<()> {
        if !self.schema_reported {
            self.sink.set_schema(Arc::clone(&self.schema))?;
            self.schema_reported = true;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let path = self.sink.path().to_path_buf();
        self.writer.get_mut().flush().context(IoSnafu { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use arrow::array::{DictionaryArray, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Int32Type, Schema};
    use arrow::ipc::reader::FileReader;

    fn int_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn int_batch(schema: &SchemaRef, values: Vec<i64>) -> RecordBatch {
        RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    #[test]
    fn test_offsets_reported_and_footer_readable() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(Sink::new(dir.path().join("w.arrow"), Duration::from_secs(1)));
        let schema = int_schema();

        let mut writer = SinkWriter::try_new(Arc::clone(&sink), schema.clone()).unwrap();
        writer.write(&int_batch(&schema, vec![1, 2])).unwrap();
        writer.write(&int_batch(&schema, vec![])).unwrap();
        writer.write(&int_batch(&schema, vec![3])).unwrap();

        assert_eq!(sink.num_batches(), 2);
        assert!(!sink.is_footer_written());
        let first = sink.record_batch_offset(0).unwrap();
        let second = sink.record_batch_offset(1).unwrap();
        assert!(first > 8 && second > first);

        assert_eq!(writer.finish().unwrap(), 3);
        assert!(sink.is_footer_written());
        assert_eq!(sink.final_size(), Some(3));

        let reader = FileReader::try_new(File::open(sink.path()).unwrap(), None).unwrap();
        let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 3);
    }

    #[test]
    fn test_dictionary_offsets_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(Sink::new(dir.path().join("d.arrow"), Duration::from_secs(1)));
        let schema = Arc::new(Schema::new(vec![Field::new(
            "category",
            DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
            false,
        )]));

        let mut writer = SinkWriter::try_new(Arc::clone(&sink), schema.clone()).unwrap();
        let array: DictionaryArray<Int32Type> = vec!["a", "b", "a"].into_iter().collect();
        writer
            .write(&RecordBatch::try_new(schema.clone(), vec![Arc::new(array)]).unwrap())
            .unwrap();

        let dictionaries = sink.dictionary_batch_offsets(0).unwrap();
        assert_eq!(dictionaries.len(), 1);
        assert!(dictionaries[0] < sink.record_batch_offset(0).unwrap());
        writer.close_partial().unwrap();
        assert!(!sink.is_footer_written());
    }

    #[test]
    fn test_mismatched_batch_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(Sink::new(dir.path().join("m.arrow"), Duration::from_secs(1)));
        let mut writer = SinkWriter::try_new(Arc::clone(&sink), int_schema()).unwrap();

        let other = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, false)]));
        let batch =
            RecordBatch::try_new(other, vec![Arc::new(StringArray::from(vec!["x"]))]).unwrap();
        assert!(writer.write(&batch).is_err());
        assert_eq!(sink.num_batches(), 0);
    }
}
