//! Column domains and metadata.
//!
//! A [`DomainSummarizer`] folds every batch of a source into one accumulator
//! per column. Accumulators are not synchronized, so the summarizer runs a
//! single worker.

mod accumulator;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use arrow::datatypes::SchemaRef;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::ExchangeConfig;
use crate::error::Result;
use crate::processor::{BatchContext, BatchHandler, BatchProcessor};
use crate::sink::BatchListener;
use crate::source::{ReadBatch, Source};
use accumulator::ColumnAccumulator;

/// A single value of a domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DomainValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

/// What is known about the values of a column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum ColumnDomain {
    /// Smallest and largest non-missing value.
    Bounded { lower: DomainValue, upper: DomainValue },
    /// Every distinct non-missing value, in order of first appearance.
    Enumerated(Vec<DomainValue>),
    /// Not computed, unsupported type or too many distinct values.
    Unknown,
}

/// Lightweight per-column facts, computed independently of the domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataRecord {
    ValueCounts { non_null: u64, null: u64 },
    MaxStringLength { bytes: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ColumnSummary {
    domain: ColumnDomain,
    metadata: Vec<MetadataRecord>,
}

/// Domains and metadata of every column of a table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableDomainAndMetadata {
    columns: Vec<ColumnSummary>,
}

impl TableDomainAndMetadata {
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Domain of column `index`; unknown for columns that were never read.
    pub fn domain(&self, index: usize) -> ColumnDomain {
        self.columns
            .get(index)
            .map_or(ColumnDomain::Unknown, |column| column.domain.clone())
    }

    pub fn metadata(&self, index: usize) -> &[MetadataRecord] {
        self.columns
            .get(index)
            .map(|column| column.metadata.as_slice())
            .unwrap_or(&[])
    }
}

/// Tells a summarizer whether its result is still wanted.
pub type ValidityCheck = Arc<dyn Fn() -> bool + Send + Sync>;

struct DomainHandler {
    max_values: usize,
    compute_domains: bool,
    columns: Mutex<Option<Vec<ColumnAccumulator>>>,
    rows: AtomicU64,
    validity: OnceLock<ValidityCheck>,
}

impl BatchHandler for DomainHandler {
    fn name(&self) -> &'static str {
        "domains"
    }

    fn on_reader_opened(&self, schema: &SchemaRef) -> Result<()> {
        let columns = schema
            .fields()
            .iter()
            .map(|field| {
                ColumnAccumulator::new(field.data_type(), self.max_values, self.compute_domains)
            })
            .collect();
        *self.columns.lock() = Some(columns);
        Ok(())
    }

    fn process_batch(&self, batch: &ReadBatch, ctx: &BatchContext<'_>) -> Result<()> {
        let mut guard = self.columns.lock();
        let Some(columns) = guard.as_mut() else {
            return Ok(());
        };

        for (i, accumulator) in columns.iter_mut().enumerate() {
            if !ctx.should_continue() || !self.wanted() {
                return Ok(());
            }
            let column = Arc::clone(batch.column(i));
            accumulator.update(&column)?;
        }
        self.rows.fetch_add(batch.num_rows() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl DomainHandler {
    fn wanted(&self) -> bool {
        self.validity.get().is_none_or(|check| check())
    }

    fn snapshot(&self) -> TableDomainAndMetadata {
        let columns = self.columns.lock();
        TableDomainAndMetadata {
            columns: columns
                .iter()
                .flatten()
                .map(|accumulator| ColumnSummary {
                    domain: accumulator.domain(),
                    metadata: accumulator.metadata(),
                })
                .collect(),
        }
    }
}

/// Computes domains and metadata of all columns of a source.
pub struct DomainSummarizer {
    processor: BatchProcessor<DomainHandler>,
}

impl DomainSummarizer {
    /// Nothing is read until the first batch is submitted.
    pub fn new(source: Source, config: &ExchangeConfig) -> Result<Self> {
        let handler = DomainHandler {
            max_values: config.max_domain_values,
            compute_domains: config.compute_domains,
            columns: Mutex::new(None),
            rows: AtomicU64::new(0),
            validity: OnceLock::new(),
        };
        let processor = BatchProcessor::new(handler, Box::new(move || source.open_reader(None)), 1)?;
        Ok(Self { processor })
    }

    /// Stop folding in batches once `check` returns false.
    ///
    /// The sink manager passes the row-key validator's validity here, so the
    /// domains of a sink that can never be converted are not computed.
    pub fn with_validity_check(self, check: ValidityCheck) -> Self {
        if self.processor.handler().validity.set(check).is_err() {
            debug!("Validity check already set");
        }
        self
    }

    /// Skipped while the validity check fails.
    pub fn submit_next_batch(&self) -> Result<()> {
        if self.is_aborted() {
            return Ok(());
        }
        self.processor.submit_next_batch()
    }

    /// True once the validity check returned false.
    pub fn is_aborted(&self) -> bool {
        !self.processor.handler().wanted()
    }

    pub fn is_valid(&self) -> bool {
        self.processor.is_valid()
    }

    /// Domain of column `index`, once every submitted batch has been folded in.
    pub async fn domain(&self, index: usize) -> Result<ColumnDomain> {
        Ok(self.table_domain_and_metadata().await?.domain(index))
    }

    /// Metadata records of column `index`, once every submitted batch has been
    /// folded in.
    pub async fn metadata(&self, index: usize) -> Result<Vec<MetadataRecord>> {
        Ok(self.table_domain_and_metadata().await?.metadata(index).to_vec())
    }

    /// Wait for every submitted batch and return the summary of all columns.
    pub async fn table_domain_and_metadata(&self) -> Result<TableDomainAndMetadata> {
        self.processor.await_completion().await?;
        let summary = self.processor.handler().snapshot();
        debug!(columns = summary.num_columns(), rows = self.row_count(), "Domains computed");
        Ok(summary)
    }

    /// Rows folded in so far.
    pub fn row_count(&self) -> u64 {
        self.processor.handler().rows.load(Ordering::Relaxed)
    }

    /// Stop and release the reader. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.processor.close().await
    }
}

impl BatchListener for DomainSummarizer {
    fn batch_written(&self) -> Result<()> {
        self.submit_next_batch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use arrow::array::{Int64Array, RecordBatch, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    use crate::sink::{Sink, SinkWriter};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("city", DataType::Utf8, true),
        ]))
    }

    fn batch(ids: Vec<i64>, cities: Vec<Option<&str>>) -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(cities)),
            ],
        )
        .unwrap()
    }

    async fn summarize(config: ExchangeConfig, batches: Vec<RecordBatch>) -> (DomainSummarizer, TableDomainAndMetadata) {
        let sink = Arc::new(Sink::new(
            config.temp_dir().join("domains.arrow"),
            config.offset_wait_timeout(),
        ));
        let summarizer = Arc::new(DomainSummarizer::new(Source::from_sink(Arc::clone(&sink)), &config).unwrap());
        sink.register_batch_listener(summarizer.clone());

        let mut writer = SinkWriter::try_new(Arc::clone(&sink), schema()).unwrap();
        for batch in &batches {
            writer.write(batch).unwrap();
        }
        writer.finish().unwrap();

        let summary = summarizer.table_domain_and_metadata().await.unwrap();
        summarizer.close().await.unwrap();
        sink.clear_batch_listeners();
        (Arc::into_inner(summarizer).unwrap(), summary)
    }

    fn config(dir: &tempfile::TempDir) -> ExchangeConfig {
        ExchangeConfig {
            temp_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bounds_and_values_across_batches() {
        let dir = tempfile::TempDir::new().unwrap();
        let (summarizer, summary) = summarize(
            config(&dir),
            vec![
                batch(vec![1, 2], vec![Some("Berlin"), None]),
                batch(vec![3], vec![Some("Zurich")]),
            ],
        )
        .await;

        assert_eq!(summarizer.row_count(), 3);
        assert_eq!(summary.num_columns(), 2);
        assert_eq!(
            summary.domain(0),
            ColumnDomain::Bounded {
                lower: DomainValue::Int(1),
                upper: DomainValue::Int(3)
            }
        );
        assert_eq!(
            summary.domain(1),
            ColumnDomain::Enumerated(vec![
                DomainValue::Text("Berlin".into()),
                DomainValue::Text("Zurich".into()),
            ])
        );
        assert_eq!(
            summary.metadata(1),
            &[
                MetadataRecord::ValueCounts {
                    non_null: 2,
                    null: 1
                },
                MetadataRecord::MaxStringLength { bytes: 6 },
            ]
        );
        assert_eq!(summary.domain(7), ColumnDomain::Unknown);
        assert!(summary.metadata(7).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cap_turns_values_unknown() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ExchangeConfig {
            max_domain_values: 2,
            ..config(&dir)
        };
        let (_, summary) = summarize(
            config,
            vec![
                batch(vec![1, 2], vec![Some("a"), Some("b")]),
                batch(vec![3], vec![Some("c")]),
            ],
        )
        .await;
        assert_eq!(summary.domain(1), ColumnDomain::Unknown);
        assert!(matches!(summary.domain(0), ColumnDomain::Bounded { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_metadata_without_domains() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ExchangeConfig {
            compute_domains: false,
            ..config(&dir)
        };
        let (summarizer, summary) =
            summarize(config, vec![batch(vec![5], vec![Some("x")])]).await;
        assert_eq!(summary.domain(0), ColumnDomain::Unknown);
        assert_eq!(
            summary.metadata(0),
            &[MetadataRecord::ValueCounts {
                non_null: 1,
                null: 0
            }]
        );
        assert_eq!(summarizer.domain(1).await.unwrap(), ColumnDomain::Unknown);
        assert_eq!(summarizer.metadata(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_summary_without_batches_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let summarizer =
            DomainSummarizer::new(Source::finalized(dir.path().join("never.arrow")), &config(&dir))
                .unwrap();
        let summary = summarizer.table_domain_and_metadata().await.unwrap();
        assert_eq!(summary.num_columns(), 0);
        summarizer.close().await.unwrap();
    }

    #[test]
    fn test_summary_serializes_as_json() {
        let summary = TableDomainAndMetadata {
            columns: vec![ColumnSummary {
                domain: ColumnDomain::Bounded {
                    lower: DomainValue::Int(1),
                    upper: DomainValue::Int(3),
                },
                metadata: vec![MetadataRecord::ValueCounts {
                    non_null: 3,
                    null: 0,
                }],
            }],
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["columns"][0]["domain"]["kind"], "bounded");
        assert_eq!(json["columns"][0]["domain"]["values"]["upper"], 3);
        assert_eq!(json["columns"][0]["metadata"][0]["kind"], "value_counts");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stops_when_no_longer_valid() {
        use std::sync::atomic::AtomicBool;

        let dir = tempfile::TempDir::new().unwrap();
        let config = config(&dir);
        let sink = Arc::new(Sink::new(dir.path().join("aborted.arrow"), config.offset_wait_timeout()));
        let valid = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&valid);
        let summarizer = Arc::new(
            DomainSummarizer::new(Source::from_sink(Arc::clone(&sink)), &config)
                .unwrap()
                .with_validity_check(Arc::new(move || flag.load(Ordering::Acquire))),
        );
        sink.register_batch_listener(summarizer.clone());

        let mut writer = SinkWriter::try_new(Arc::clone(&sink), schema()).unwrap();
        writer.write(&batch(vec![1, 2], vec![Some("Oslo"), None])).unwrap();
        summarizer.table_domain_and_metadata().await.unwrap();
        assert!(!summarizer.is_aborted());

        valid.store(false, Ordering::Release);
        writer.write(&batch(vec![50], vec![Some("Rome")])).unwrap();
        writer.finish().unwrap();

        let summary = summarizer.table_domain_and_metadata().await.unwrap();
        assert!(summarizer.is_aborted());
        assert_eq!(summarizer.row_count(), 2);
        assert_eq!(
            summary.domain(0),
            ColumnDomain::Bounded {
                lower: DomainValue::Int(1),
                upper: DomainValue::Int(2)
            }
        );

        summarizer.close().await.unwrap();
        sink.clear_batch_listeners();
    }
}
