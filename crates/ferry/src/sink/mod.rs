//! Write side of the exchange: a columnar file under construction.
//!
//! A [`Sink`] records what the companion writer has reported so far: the
//! schema, the byte offset of every completed record batch, the dictionary
//! batches emitted with it, and whether the footer has been written. The
//! sequence of reported offsets is the only synchronization signal between the
//! writer and concurrent readers: an offset is returned to a reader only after
//! it has been reported.

mod writer;

pub use writer::SinkWriter;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arrow::datatypes::{Schema, SchemaRef};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{ExchangeError, Result};
use crate::source::OffsetProvider;

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Notified synchronously every time a batch is reported to a sink.
///
/// An error is handed back to the writer from
/// [`Sink::report_batch_written`], which lets the companion stop early.
pub trait BatchListener: Send + Sync {
    fn batch_written(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct SinkState {
    schema: Option<SchemaRef>,
    record_offsets: Vec<u64>,
    dictionary_offsets: Vec<Vec<u64>>,
    footer_written: bool,
    final_size: Option<u64>,
    abandoned: bool,
}

/// A columnar file under construction plus the offsets reported for it.
pub struct Sink {
    id: u64,
    path: PathBuf,
    state: Mutex<SinkState>,
    reported: Condvar,
    listeners: Mutex<Vec<Arc<dyn BatchListener>>>,
    offset_wait_timeout: Duration,
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("num_batches", &self.num_batches())
            .field("footer_written", &self.is_footer_written())
            .finish()
    }
}

impl Sink {
    /// Create a sink for the file at `path`.
    ///
    /// Readers asking for a batch that has not been reported yet wait at most
    /// `offset_wait_timeout`.
    pub fn new(path: impl Into<PathBuf>, offset_wait_timeout: Duration) -> Self {
        Self {
            id: NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed),
            path: path.into(),
            state: Mutex::new(SinkState::default()),
            reported: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            offset_wait_timeout,
        }
    }

    /// Process-wide unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set the schema of the data written to this sink.
    ///
    /// Setting the same schema again is a no-op; a different one is rejected.
    pub fn set_schema(&self, schema: SchemaRef) -> Result<()> {
        let mut state = self.state.lock();
        match &state.schema {
            Some(existing) if existing.as_ref() != schema.as_ref() => Err(ExchangeError::contract(
                format!("schema of sink {} cannot be changed once set", self.id),
            )),
            Some(_) => Ok(()),
            None => {
                state.schema = Some(schema);
                Ok(())
            }
        }
    }

    pub fn schema(&self) -> Option<SchemaRef> {
        self.state.lock().schema.clone()
    }

    /// Compare the written schema with what the host expects.
    ///
    /// Field names are not compared; the host may rename columns.
    pub fn check_schema(&self, expected: &Schema) -> Result<()> {
        let Some(actual) = self.schema() else {
            return Err(ExchangeError::contract(format!(
                "sink {} has no schema to check",
                self.id
            )));
        };
        if actual.fields().len() != expected.fields().len() {
            return Err(ExchangeError::contract(format!(
                "expected {} columns but sink {} has {}",
                expected.fields().len(),
                self.id,
                actual.fields().len()
            )));
        }
        for (index, (actual, expected)) in actual.fields().iter().zip(expected.fields()).enumerate() {
            if actual.data_type() != expected.data_type() {
                return Err(ExchangeError::contract(format!(
                    "column {index} has type {} but {} was expected",
                    actual.data_type(),
                    expected.data_type()
                )));
            }
        }
        Ok(())
    }

    /// Report a record batch that starts at `offset`.
    pub fn report_batch_written(&self, offset: u64) -> Result<()> {
        self.report_batch_written_with_dictionaries(offset, Vec::new())
    }

    /// Report a record batch together with the dictionary batches it depends on.
    ///
    /// Offsets must be strictly increasing and the schema must already be set.
    /// Listeners run on the caller's thread after the offset is visible to
    /// readers. Every listener is notified; the first error is returned.
    pub fn report_batch_written_with_dictionaries(
        &self,
        offset: u64,
        dictionary_offsets: Vec<u64>,
    ) -> Result<()> {
        let index = {
            let mut state = self.state.lock();
            if state.schema.is_none() {
                return Err(ExchangeError::contract(format!(
                    "schema of sink {} must be set before the first batch",
                    self.id
                )));
            }
            if state.footer_written {
                return Err(ExchangeError::contract(format!(
                    "sink {} already has a footer",
                    self.id
                )));
            }
            if let Some(&last) = state.record_offsets.last()
                && offset <= last
            {
                return Err(ExchangeError::contract(format!(
                    "batch offset {offset} is not after previous offset {last}"
                )));
            }
            state.record_offsets.push(offset);
            state.dictionary_offsets.push(dictionary_offsets);
            state.record_offsets.len() - 1
        };
        self.reported.notify_all();
        debug!(sink = self.id, batch = index, offset, "Batch reported");

        let listeners = self.listeners.lock().clone();
        let mut first_error = None;
        for listener in listeners {
            if let Err(e) = listener.batch_written() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Record that the trailing footer has been written.
    pub fn mark_footer_written(&self) {
        self.state.lock().footer_written = true;
        self.reported.notify_all();
    }

    /// Record the total number of rows written.
    pub fn set_final_size(&self, rows: u64) {
        self.state.lock().final_size = Some(rows);
    }

    pub fn final_size(&self) -> Option<u64> {
        self.state.lock().final_size
    }

    /// Declare that no further batches will be reported.
    ///
    /// Readers waiting for an unreported batch fail instead of timing out.
    pub fn abandon(&self) {
        self.state.lock().abandoned = true;
        self.reported.notify_all();
    }

    pub fn register_batch_listener(&self, listener: Arc<dyn BatchListener>) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn clear_batch_listeners(&self) {
        self.listeners.lock().clear();
    }

    pub fn num_batches(&self) -> usize {
        self.state.lock().record_offsets.len()
    }

    pub fn is_footer_written(&self) -> bool {
        self.state.lock().footer_written
    }

    /// Offset of record batch `index`, waiting until it has been reported.
    ///
    /// Once the footer is written the file must be read through it instead.
    pub fn record_batch_offset(&self, index: usize) -> Result<u64> {
        self.ensure_no_footer()?;
        self.wait_for_record_offset(index)
    }

    /// Offsets of the dictionary batches written with record batch `index`.
    pub fn dictionary_batch_offsets(&self, index: usize) -> Result<Vec<u64>> {
        self.ensure_no_footer()?;
        self.wait_for_dictionary_offsets(index)
    }

    fn ensure_no_footer(&self) -> Result<()> {
        if self.is_footer_written() {
            return Err(ExchangeError::contract(format!(
                "sink {} has a footer; read offsets from it",
                self.id
            )));
        }
        Ok(())
    }

    fn wait_for_record_offset(&self, index: usize) -> Result<u64> {
        self.wait_for(index, |state| state.record_offsets[index])
    }

    fn wait_for_dictionary_offsets(&self, index: usize) -> Result<Vec<u64>> {
        self.wait_for(index, |state| state.dictionary_offsets[index].clone())
    }

    /// Snapshot of every offset reported so far.
    pub(crate) fn reported_offsets(&self) -> (Vec<u64>, Vec<Vec<u64>>) {
        let state = self.state.lock();
        (state.record_offsets.clone(), state.dictionary_offsets.clone())
    }

    fn wait_for<T>(&self, index: usize, read: impl Fn(&SinkState) -> T) -> Result<T> {
        let deadline = Instant::now() + self.offset_wait_timeout;
        let mut state = self.state.lock();
        loop {
            if index < state.record_offsets.len() {
                return Ok(read(&state));
            }
            if state.footer_written {
                return Err(ExchangeError::BatchNotReported {
                    index,
                    num_batches: state.record_offsets.len(),
                });
            }
            if state.abandoned {
                return Err(ExchangeError::WriterAbandoned { index });
            }
            if self.reported.wait_until(&mut state, deadline).timed_out()
                && index >= state.record_offsets.len()
            {
                return Err(ExchangeError::OffsetTimeout {
                    index,
                    waited_ms: self.offset_wait_timeout.as_millis() as u64,
                });
            }
        }
    }
}

impl OffsetProvider for Sink {
    fn schema(&self) -> Option<SchemaRef> {
        Sink::schema(self)
    }

    fn num_batches(&self) -> usize {
        Sink::num_batches(self)
    }

    fn is_footer_written(&self) -> bool {
        Sink::is_footer_written(self)
    }

    // readers opened before the footer keep resolving reported batches
    fn record_batch_offset(&self, index: usize) -> Result<u64> {
        self.wait_for_record_offset(index)
    }

    fn dictionary_batch_offsets(&self, index: usize) -> Result<Vec<u64>> {
        self.wait_for_dictionary_offsets(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use arrow::datatypes::{DataType, Field};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("value", DataType::Int64, true),
        ]))
    }

    fn sink(timeout: Duration) -> Sink {
        let sink = Sink::new("/tmp/ferry-sink-test.arrow", timeout);
        sink.set_schema(schema()).unwrap();
        sink
    }

    #[test]
    fn test_schema_set_once() {
        let sink = Sink::new("/tmp/a.arrow", Duration::from_secs(1));
        assert!(sink.schema().is_none());
        sink.set_schema(schema()).unwrap();
        sink.set_schema(schema()).unwrap();

        let other = Arc::new(Schema::new(vec![Field::new("x", DataType::Float64, true)]));
        let err = sink.set_schema(other).unwrap_err();
        assert!(matches!(err, ExchangeError::ContractViolation { .. }));
    }

    #[test]
    fn test_report_requires_schema() {
        let sink = Sink::new("/tmp/b.arrow", Duration::from_secs(1));
        let err = sink.report_batch_written(100).unwrap_err();
        assert!(matches!(err, ExchangeError::ContractViolation { .. }));
        assert_eq!(sink.num_batches(), 0);
    }

    #[test]
    fn test_offsets_must_increase() {
        let sink = sink(Duration::from_secs(1));
        sink.report_batch_written(100).unwrap();
        sink.report_batch_written_with_dictionaries(300, vec![200]).unwrap();
        assert!(sink.report_batch_written(300).is_err());
        assert!(sink.report_batch_written(50).is_err());

        assert_eq!(sink.num_batches(), 2);
        assert_eq!(sink.record_batch_offset(0).unwrap(), 100);
        assert_eq!(sink.record_batch_offset(1).unwrap(), 300);
        assert!(sink.dictionary_batch_offsets(0).unwrap().is_empty());
        assert_eq!(sink.dictionary_batch_offsets(1).unwrap(), vec![200]);
    }

    #[test]
    fn test_offset_waits_for_delayed_writer() {
        let sink = Arc::new(sink(Duration::from_secs(10)));
        let writer = Arc::clone(&sink);

        let reader = thread::spawn({
            let sink = Arc::clone(&sink);
            move || sink.record_batch_offset(2)
        });

        for (i, offset) in [64u64, 128, 256].into_iter().enumerate() {
            thread::sleep(Duration::from_millis(20));
            // the reader must still be waiting for batch 2
            if i < 2 {
                assert!(!reader.is_finished());
            }
            writer.report_batch_written(offset).unwrap();
        }

        assert_eq!(reader.join().unwrap().unwrap(), 256);
    }

    #[test]
    fn test_offset_wait_times_out() {
        let sink = sink(Duration::from_millis(30));
        let start = Instant::now();
        let err = sink.record_batch_offset(0).unwrap_err();
        assert!(matches!(err, ExchangeError::OffsetTimeout { index: 0, .. }));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_abandon_wakes_waiters() {
        let sink = Arc::new(sink(Duration::from_secs(30)));
        let reader = thread::spawn({
            let sink = Arc::clone(&sink);
            move || sink.record_batch_offset(0)
        });

        thread::sleep(Duration::from_millis(20));
        sink.abandon();

        let err = reader.join().unwrap().unwrap_err();
        assert!(matches!(err, ExchangeError::WriterAbandoned { index: 0 }));
    }

    #[test]
    fn test_footer_ends_waiting() {
        let sink = Arc::new(sink(Duration::from_secs(30)));
        sink.report_batch_written(8).unwrap();
        let reader = thread::spawn({
            let sink = Arc::clone(&sink);
            move || sink.record_batch_offset(1)
        });

        thread::sleep(Duration::from_millis(20));
        sink.mark_footer_written();

        assert!(sink.is_footer_written());
        let err = reader.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::BatchNotReported {
                index: 1,
                num_batches: 1
            }
        ));
        assert!(sink.report_batch_written(16).is_err());
    }

    #[test]
    fn test_offsets_rejected_after_footer() {
        let sink = sink(Duration::from_secs(30));
        sink.report_batch_written_with_dictionaries(16, vec![8]).unwrap();
        assert_eq!(sink.record_batch_offset(0).unwrap(), 16);
        sink.mark_footer_written();

        assert!(matches!(
            sink.record_batch_offset(0),
            Err(ExchangeError::ContractViolation { .. })
        ));
        assert!(matches!(
            sink.dictionary_batch_offsets(0),
            Err(ExchangeError::ContractViolation { .. })
        ));
        // readers that started before the footer still resolve reported batches
        let provider: &dyn OffsetProvider = &sink;
        assert_eq!(provider.record_batch_offset(0).unwrap(), 16);
        assert_eq!(provider.dictionary_batch_offsets(0).unwrap(), vec![8]);
    }

    struct CountingListener {
        calls: AtomicUsize,
        fail_after: usize,
    }

    impl BatchListener for CountingListener {
        fn batch_written(&self) -> Result<()> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if calls > self.fail_after {
                return Err(ExchangeError::DuplicateKey {
                    key: "k".to_string(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_listener_errors_reach_writer() {
        let sink = sink(Duration::from_secs(1));
        let listener = Arc::new(CountingListener {
            calls: AtomicUsize::new(0),
            fail_after: 1,
        });
        sink.register_batch_listener(listener.clone());

        sink.report_batch_written(10).unwrap();
        let err = sink.report_batch_written(20).unwrap_err();
        assert!(err.is_duplicate_key());
        // the offset is recorded even though a listener failed
        assert_eq!(sink.num_batches(), 2);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_check_schema() {
        let sink = sink(Duration::from_secs(1));
        let renamed = Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("v", DataType::Int64, true),
        ]);
        sink.check_schema(&renamed).unwrap();

        let wrong_type = Schema::new(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("value", DataType::Utf8, true),
        ]);
        assert!(sink.check_schema(&wrong_type).is_err());

        let wrong_count = Schema::new(vec![Field::new("key", DataType::Utf8, false)]);
        assert!(sink.check_schema(&wrong_count).is_err());
    }

    #[test]
    fn test_final_size() {
        let sink = sink(Duration::from_secs(1));
        assert_eq!(sink.final_size(), None);
        sink.set_final_size(42);
        assert_eq!(sink.final_size(), Some(42));
    }
}
