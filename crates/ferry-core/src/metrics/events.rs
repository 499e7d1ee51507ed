//! Internal events for ferry metrics emission.
//!
//! Each event struct represents a measurable occurrence in the exchange
//! engine. Processor events carry a `processor` label (`row_keys`,
//! `domains`) so both analyses attached to a sink can be told apart.

use metrics::counter;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when a processor finished handling one batch.
pub struct BatchProcessed {
    pub processor: &'static str,
    pub rows: u64,
}

impl InternalEvent for BatchProcessed {
    fn emit(self) {
        trace!(processor = self.processor, rows = self.rows, "Batch processed");
        counter!("ferry_batches_processed_total", "processor" => self.processor).increment(1);
        counter!("ferry_rows_processed_total", "processor" => self.processor)
            .increment(self.rows);
    }
}

/// Event emitted when a processor latched its first error.
pub struct ProcessorFailed {
    pub processor: &'static str,
}

impl InternalEvent for ProcessorFailed {
    fn emit(self) {
        trace!(processor = self.processor, "Processor failed");
        counter!("ferry_processor_failures_total", "processor" => self.processor).increment(1);
    }
}

/// Event emitted when a new sink is handed out.
pub struct SinkCreated;

impl InternalEvent for SinkCreated {
    fn emit(self) {
        trace!("Sink created");
        counter!("ferry_sinks_created_total").increment(1);
    }
}

/// Outcome of a sink-to-table conversion.
#[derive(Debug, Clone, Copy)]
pub enum ConversionStatus {
    Success,
    DuplicateKey,
    Failed,
}

impl ConversionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ConversionStatus::Success => "success",
            ConversionStatus::DuplicateKey => "duplicate_key",
            ConversionStatus::Failed => "failed",
        }
    }
}

/// Event emitted when a sink conversion finishes, successfully or not.
pub struct SinkConverted {
    pub status: ConversionStatus,
}

impl InternalEvent for SinkConverted {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Sink converted");
        counter!("ferry_sink_conversions_total", "status" => self.status.as_str()).increment(1);
    }
}

/// Event emitted when unused sink files are removed at cleanup.
pub struct SinkFilesDeleted {
    pub count: u64,
}

impl InternalEvent for SinkFilesDeleted {
    fn emit(self) {
        trace!(count = self.count, "Unused sink files deleted");
        counter!("ferry_sink_files_deleted_total").increment(self.count);
    }
}

/// Event emitted when the duplicate checker spills a sorted chunk to disk.
pub struct DuplicateChunkSpilled {
    pub keys: u64,
}

impl InternalEvent for DuplicateChunkSpilled {
    fn emit(self) {
        trace!(keys = self.keys, "Duplicate checker chunk spilled");
        counter!("ferry_duplicate_chunks_spilled_total").increment(1);
        counter!("ferry_duplicate_keys_spilled_total").increment(self.keys);
    }
}

/// Event emitted when a host table had to be copied into a fresh file.
pub struct TableCopied {
    pub rows: u64,
}

impl InternalEvent for TableCopied {
    fn emit(self) {
        trace!(rows = self.rows, "Table copied for source");
        counter!("ferry_tables_copied_total").increment(1);
        counter!("ferry_rows_copied_total").increment(self.rows);
    }
}
