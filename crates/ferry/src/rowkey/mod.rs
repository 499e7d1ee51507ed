//! Row-key validation.
//!
//! A [`RowKeyValidator`] reads only the row-key column of a source and feeds
//! every key into a [`DuplicateChecker`]. Batches may be checked in any
//! order and in parallel; the final merge in [`RowKeyValidator::all_unique`]
//! catches duplicates that ended up in different chunks.

mod duplicates;

pub use duplicates::DuplicateChecker;

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, SchemaRef};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result, TaskInterrupted};
use crate::processor::{BatchContext, BatchHandler, BatchProcessor};
use crate::sink::BatchListener;
use crate::source::{ReadBatch, Source};

/// Rows between two checks of the stop flag.
const STOP_CHECK_INTERVAL: usize = 1024;

struct RowKeyHandler {
    checker: Arc<Mutex<DuplicateChecker>>,
}

impl BatchHandler for RowKeyHandler {
    fn name(&self) -> &'static str {
        "row_keys"
    }

    fn on_reader_opened(&self, schema: &SchemaRef) -> Result<()> {
        match schema.fields().first() {
            Some(field) if is_supported_key_type(field.data_type()) => Ok(()),
            Some(field) => Err(ExchangeError::UnsupportedRowKeyType {
                data_type: field.data_type().clone(),
            }),
            None => Err(ExchangeError::contract("row key column is missing")),
        }
    }

    fn process_batch(&self, batch: &ReadBatch, ctx: &BatchContext<'_>) -> Result<()> {
        let Some(keys) = row_keys(batch.column(0), ctx)? else {
            return Ok(());
        };

        let mut checker = self.checker.lock();
        for (row, key) in keys.into_iter().enumerate() {
            if row % STOP_CHECK_INTERVAL == 0 && !ctx.should_continue() {
                return Ok(());
            }
            checker.add_key(key)?;
        }
        Ok(())
    }
}

fn is_supported_key_type(data_type: &DataType) -> bool {
    match data_type {
        DataType::Utf8
        | DataType::LargeUtf8
        | DataType::Utf8View
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => true,
        DataType::Dictionary(_, values) => {
            matches!(values.as_ref(), DataType::Utf8 | DataType::LargeUtf8)
        }
        _ => false,
    }
}

/// Render the keys of `column` as strings.
///
/// Returns `None` if the processor was stopped midway.
fn row_keys(column: &ArrayRef, ctx: &BatchContext<'_>) -> Result<Option<Vec<String>>> {
    if !is_supported_key_type(column.data_type()) {
        return Err(ExchangeError::UnsupportedRowKeyType {
            data_type: column.data_type().clone(),
        });
    }

    let strings = cast(column, &DataType::Utf8)?;
    let strings = strings.as_string::<i32>();
    let mut keys = Vec::with_capacity(strings.len());
    for row in 0..strings.len() {
        if row % STOP_CHECK_INTERVAL == 0 && !ctx.should_continue() {
            return Ok(None);
        }
        if strings.is_null(row) {
            return Err(ExchangeError::NullRowKey { row });
        }
        keys.push(strings.value(row).to_string());
    }
    Ok(Some(keys))
}

/// Checks that no two rows of a source share a row key.
pub struct RowKeyValidator {
    processor: BatchProcessor<RowKeyHandler>,
    final_check: OnceCell<Result<()>>,
}

impl RowKeyValidator {
    /// Validate the row-key column configured in `config`.
    ///
    /// Nothing is read until the first batch is submitted.
    pub fn new(source: Source, config: &ExchangeConfig) -> Result<Self> {
        let column = config.row_key_column;
        let handler = RowKeyHandler {
            checker: Arc::new(Mutex::new(DuplicateChecker::new(
                config.duplicate_chunk_size,
                config.temp_dir(),
            ))),
        };
        let processor = BatchProcessor::new(
            handler,
            Box::new(move || source.open_reader(Some(vec![column]))),
            config.row_key_threads,
        )?;

        Ok(Self {
            processor,
            final_check: OnceCell::new(),
        })
    }

    /// Schedule the next batch for checking.
    pub fn check_next_batch(&self) -> Result<()> {
        self.processor.submit_next_batch()
    }

    /// True while no duplicate or other error has been found. Never blocks.
    pub fn is_valid(&self) -> bool {
        self.processor.is_valid()
    }

    pub fn invalid_cause(&self) -> Option<ExchangeError> {
        self.processor.invalid_cause()
    }

    /// Wait for every submitted batch and run the final duplicate scan.
    ///
    /// Returns `Ok(false)` when a key is duplicated or missing; the cause is
    /// then available from [`RowKeyValidator::invalid_cause`]. Other failures
    /// are returned as errors.
    pub async fn all_unique(&self) -> Result<bool> {
        if let Err(e) = self.processor.await_completion().await {
            return unique_or_error(e);
        }

        let checker = Arc::clone(&self.processor.handler().checker);
        let outcome = self
            .final_check
            .get_or_init(|| async move {
                match tokio::task::spawn_blocking(move || checker.lock().check_for_duplicates())
                    .await
                {
                    Ok(result) => result,
                    Err(e) => Err(TaskInterrupted::from_join_error(e).into()),
                }
            })
            .await;

        match outcome {
            Ok(()) => Ok(true),
            Err(e) => {
                self.processor.fail(e.clone());
                debug!(error = %e, "Final row key scan failed");
                unique_or_error(e.clone())
            }
        }
    }

    /// Stop checking and release the reader. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.processor.close().await
    }
}

fn unique_or_error(error: ExchangeError) -> Result<bool> {
    if error.is_duplicate_key() {
        Ok(false)
    } else {
        Err(error)
    }
}

impl BatchListener for RowKeyValidator {
    fn batch_written(&self) -> Result<()> {
        self.check_next_batch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use arrow::array::{Float64Array, Int64Array, RecordBatch, StringArray};
    use arrow::datatypes::{Field, Schema};

    use crate::sink::{Sink, SinkWriter};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("row_id", DataType::Utf8, true),
            Field::new("value", DataType::Float64, false),
        ]))
    }

    fn batch(keys: &[Option<&str>]) -> RecordBatch {
        let values: Vec<f64> = (0..keys.len()).map(|i| i as f64).collect();
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(StringArray::from(keys.to_vec())),
                Arc::new(Float64Array::from(values)),
            ],
        )
        .unwrap()
    }

    fn config(dir: &tempfile::TempDir, chunk_size: usize) -> ExchangeConfig {
        ExchangeConfig {
            temp_dir: Some(dir.path().to_path_buf()),
            duplicate_chunk_size: chunk_size,
            offset_wait_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    async fn validate(batches: Vec<RecordBatch>, chunk_size: usize) -> (RowKeyValidator, bool) {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config(&dir, chunk_size);
        let sink = Arc::new(Sink::new(dir.path().join("keys.arrow"), config.offset_wait_timeout()));
        let validator = Arc::new(RowKeyValidator::new(Source::from_sink(Arc::clone(&sink)), &config).unwrap());
        sink.register_batch_listener(validator.clone());

        let mut writer = SinkWriter::try_new(Arc::clone(&sink), schema()).unwrap();
        for batch in &batches {
            // a duplicate may already surface while writing
            let _ = writer.write(batch);
        }
        writer.close_partial().unwrap();

        let unique = validator.all_unique().await.unwrap();
        let _ = validator.close().await;
        sink.clear_batch_listeners();
        let validator = Arc::into_inner(validator).unwrap();
        (validator, unique)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unique_keys() {
        let batches = vec![
            batch(&[Some("Row0"), Some("Row1")]),
            batch(&[Some("Row2")]),
            batch(&[Some("Row3"), Some("Row4")]),
        ];
        let (validator, unique) = validate(batches, 100).await;
        assert!(unique);
        assert!(validator.is_valid());
        assert!(validator.invalid_cause().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_across_batches() {
        let batches = vec![
            batch(&[Some("Row0"), Some("Row1")]),
            batch(&[Some("Row2")]),
            batch(&[Some("Row1")]),
        ];
        let (validator, unique) = validate(batches, 100).await;
        assert!(!unique);
        assert!(!validator.is_valid());
        let cause = validator.invalid_cause().unwrap();
        assert!(matches!(cause, ExchangeError::DuplicateKey { ref key } if key == "Row1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_found_by_final_scan() {
        let batches = vec![
            batch(&[Some("a"), Some("b")]),
            batch(&[Some("c"), Some("d")]),
            batch(&[Some("a")]),
        ];
        let (validator, unique) = validate(batches, 2).await;
        assert!(!unique);
        assert!(validator.invalid_cause().unwrap().is_duplicate_key());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_key_is_invalid() {
        let batches = vec![batch(&[Some("Row0"), None])];
        let (validator, unique) = validate(batches, 100).await;
        assert!(!unique);
        assert!(matches!(
            validator.invalid_cause(),
            Some(ExchangeError::NullRowKey { row: 1 })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_integer_keys_and_repeated_await() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config(&dir, 100);
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let sink = Arc::new(Sink::new(dir.path().join("ints.arrow"), config.offset_wait_timeout()));
        let mut writer = SinkWriter::try_new(Arc::clone(&sink), schema.clone()).unwrap();
        writer
            .write(&RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3]))]).unwrap())
            .unwrap();
        writer.finish().unwrap();

        let validator = RowKeyValidator::new(Source::finalized(sink.path()), &config).unwrap();
        validator.check_next_batch().unwrap();
        assert!(validator.all_unique().await.unwrap());
        assert!(validator.all_unique().await.unwrap());
        validator.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unsupported_key_type() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ExchangeConfig {
            row_key_column: 1,
            ..config(&dir, 100)
        };
        let sink = Arc::new(Sink::new(dir.path().join("floats.arrow"), config.offset_wait_timeout()));
        let mut writer = SinkWriter::try_new(Arc::clone(&sink), schema()).unwrap();
        writer.write(&batch(&[Some("Row0")])).unwrap();
        writer.finish().unwrap();

        let validator = RowKeyValidator::new(Source::finalized(sink.path()), &config).unwrap();
        validator.check_next_batch().unwrap();
        assert!(!validator.all_unique().await.unwrap());
        assert!(matches!(
            validator.invalid_cause(),
            Some(ExchangeError::UnsupportedRowKeyType { data_type: DataType::Float64 })
        ));
    }
}
