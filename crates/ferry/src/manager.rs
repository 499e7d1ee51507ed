//! Lifecycle of sinks: creation, analysis, conversion and cleanup.
//!
//! Every sink handed out by a [`SinkManager`] has a [`RowKeyValidator`] and
//! a [`DomainSummarizer`] attached as batch listeners, so both analyses
//! consume batches while the companion is still writing. Converting the sink
//! waits for both. Sinks that are never converted have their files deleted
//! when the manager closes.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use ferry_core::emit;
use ferry_core::metrics::events::{ConversionStatus, SinkConverted, SinkCreated, SinkFilesDeleted};

use crate::config::ExchangeConfig;
use crate::domain::DomainSummarizer;
use crate::error::{ExchangeError, Result};
use crate::rowkey::RowKeyValidator;
use crate::sink::Sink;
use crate::source::{Source, reserve_path};
use crate::table::ColumnarTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Pending,
    InProgress,
    Converted,
    Failed,
}

struct ManagedSink {
    sink: Arc<Sink>,
    validator: Arc<RowKeyValidator>,
    summarizer: Arc<DomainSummarizer>,
    conversion: Conversion,
}

#[derive(Default)]
struct ManagerState {
    sinks: IndexMap<u64, ManagedSink>,
    closed: bool,
}

/// Creates sinks and converts them into tables.
pub struct SinkManager {
    config: ExchangeConfig,
    state: Mutex<ManagerState>,
}

impl SinkManager {
    pub fn new(config: ExchangeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Number of sinks that are tracked and not yet cleaned up.
    pub fn num_sinks(&self) -> usize {
        self.state.lock().sinks.len()
    }

    /// Allocate a sink file and attach a validator and a summarizer to it.
    ///
    /// Must be called within a tokio runtime.
    pub fn create_sink(&self) -> Result<Arc<Sink>> {
        if self.state.lock().closed {
            return Err(ExchangeError::contract("sink manager is closed"));
        }

        let path = reserve_path(&self.config.temp_dir(), "ferry-sink-")?;
        let sink = Arc::new(Sink::new(path, self.config.offset_wait_timeout()));
        let validator = Arc::new(RowKeyValidator::new(
            Source::from_sink(Arc::clone(&sink)),
            &self.config,
        )?);
        let keys = Arc::clone(&validator);
        let summarizer = Arc::new(
            DomainSummarizer::new(Source::from_sink(Arc::clone(&sink)), &self.config)?
                .with_validity_check(Arc::new(move || keys.is_valid())),
        );
        sink.register_batch_listener(validator.clone());
        sink.register_batch_listener(summarizer.clone());

        let mut state = self.state.lock();
        if state.closed {
            sink.clear_batch_listeners();
            let _ = std::fs::remove_file(sink.path());
            return Err(ExchangeError::contract("sink manager is closed"));
        }
        state.sinks.insert(
            sink.id(),
            ManagedSink {
                sink: Arc::clone(&sink),
                validator,
                summarizer,
                conversion: Conversion::Pending,
            },
        );
        drop(state);

        emit!(SinkCreated);
        info!(sink = sink.id(), path = %sink.path().display(), "Sink created");
        Ok(sink)
    }

    /// Turn a sink into a table once its row keys and domains are known.
    ///
    /// Fails immediately if the sink was not created by this manager, has
    /// no schema, or was converted before. Fails with a duplicate-key error
    /// if two rows share a row key.
    pub async fn convert_to_table(&self, sink: &Arc<Sink>) -> Result<ColumnarTable> {
        let (validator, summarizer) = self.begin_conversion(sink)?;

        let result = convert(sink, &validator, &summarizer).await;
        let (conversion, status) = match &result {
            Ok(_) => (Conversion::Converted, ConversionStatus::Success),
            Err(e) if e.is_duplicate_key() => (Conversion::Failed, ConversionStatus::DuplicateKey),
            Err(_) => (Conversion::Failed, ConversionStatus::Failed),
        };
        if let Some(managed) = self.state.lock().sinks.get_mut(&sink.id()) {
            managed.conversion = conversion;
        }
        emit!(SinkConverted { status });

        match &result {
            Ok(table) => info!(sink = sink.id(), rows = table.row_count(), "Sink converted"),
            Err(e) => warn!(sink = sink.id(), error = %e, "Sink conversion failed"),
        }
        result
    }

    fn begin_conversion(&self, sink: &Arc<Sink>) -> Result<(Arc<RowKeyValidator>, Arc<DomainSummarizer>)> {
        let mut state = self.state.lock();
        let managed = match state.sinks.get_mut(&sink.id()) {
            Some(managed) if Arc::ptr_eq(&managed.sink, sink) => managed,
            _ => {
                return Err(ExchangeError::contract(format!(
                    "sink {} was not created by this manager",
                    sink.id()
                )));
            }
        };
        if managed.conversion != Conversion::Pending {
            return Err(ExchangeError::contract(format!(
                "sink {} was already converted",
                sink.id()
            )));
        }
        if sink.schema().is_none() {
            return Err(ExchangeError::contract(format!(
                "sink {} has no schema",
                sink.id()
            )));
        }

        managed.conversion = Conversion::InProgress;
        Ok((Arc::clone(&managed.validator), Arc::clone(&managed.summarizer)))
    }

    /// Stop every analysis and delete the files of sinks never converted.
    ///
    /// Best effort and idempotent: failures are logged, not returned.
    pub async fn close(&self) {
        let sinks = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.sinks)
        };

        let mut deleted = 0u64;
        for (id, managed) in sinks {
            managed.sink.abandon();
            managed.sink.clear_batch_listeners();
            if let Err(e) = managed.validator.close().await {
                debug!(sink = id, error = %e, "Row key validator closed with error");
            }
            if let Err(e) = managed.summarizer.close().await {
                debug!(sink = id, error = %e, "Domain summarizer closed with error");
            }

            if managed.conversion != Conversion::Converted {
                match std::fs::remove_file(managed.sink.path()) {
                    Ok(()) => deleted += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        debug!(sink = id, path = %managed.sink.path().display(), error = %e, "Failed to delete sink file");
                    }
                }
            }
        }

        if deleted > 0 {
            emit!(SinkFilesDeleted { count: deleted });
        }
        info!(deleted, "Sink manager closed");
    }
}

async fn convert(
    sink: &Arc<Sink>,
    validator: &RowKeyValidator,
    summarizer: &DomainSummarizer,
) -> Result<ColumnarTable> {
    if !validator.all_unique().await? {
        return Err(validator.invalid_cause().unwrap_or_else(|| {
            ExchangeError::contract("row key validation failed without a cause")
        }));
    }

    let summary = summarizer.table_domain_and_metadata().await?;
    let row_count = sink.final_size().unwrap_or_else(|| summarizer.row_count());
    ColumnarTable::from_sink(sink, row_count, summary)
}
