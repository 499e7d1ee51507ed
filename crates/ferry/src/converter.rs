//! Host-facing entry point tying sinks, sources and cancellation together.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use ferry_core::cancel::{CancelableTaskRunner, ExecutionMonitor};

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result, TaskInterrupted};
use crate::manager::SinkManager;
use crate::sink::Sink;
use crate::source::{Source, SourceFactory};
use crate::table::{ColumnarTable, HostTable};

/// Converts host tables into sources and sinks into tables.
///
/// Batch operations report progress to an [`ExecutionMonitor`] and stop
/// when it is canceled.
pub struct TableConverter {
    manager: Arc<SinkManager>,
    factory: Arc<SourceFactory>,
    runner: CancelableTaskRunner,
}

impl TableConverter {
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            factory: Arc::new(SourceFactory::new(&config)),
            runner: CancelableTaskRunner::with_poll_interval(config.cancel_poll_interval()),
            manager: Arc::new(SinkManager::new(config)),
        })
    }

    pub fn manager(&self) -> &SinkManager {
        &self.manager
    }

    pub fn create_source(&self, table: &HostTable) -> Result<Source> {
        self.factory.create_source(table)
    }

    /// Create sources for all `tables` in parallel, in input order.
    pub async fn create_sources(
        &self,
        tables: Vec<HostTable>,
        monitor: &ExecutionMonitor,
    ) -> Result<Vec<Source>> {
        let total = tables.len();
        let done = Arc::new(AtomicUsize::new(0));
        let tasks = tables.into_iter().map(|table| {
            let factory = Arc::clone(&self.factory);
            let done = Arc::clone(&done);
            let monitor = monitor.clone();
            async move {
                let source = tokio::task::spawn_blocking(move || factory.create_source(&table))
                    .await
                    .map_err(TaskInterrupted::from_join_error)??;
                let finished = done.fetch_add(1, Ordering::AcqRel) + 1;
                monitor.set_progress(finished as f64 / total as f64);
                Ok::<_, ExchangeError>(source)
            }
        });

        let sources = self.runner.run_all(tasks, monitor).await?;
        debug!(count = sources.len(), "Sources created");
        Ok(sources)
    }

    pub fn create_sink(&self) -> Result<Arc<Sink>> {
        self.manager.create_sink()
    }

    /// Convert one sink, giving up when `monitor` is canceled.
    pub async fn convert_to_table(
        &self,
        sink: &Arc<Sink>,
        monitor: &ExecutionMonitor,
    ) -> Result<ColumnarTable> {
        let manager = Arc::clone(&self.manager);
        let sink = Arc::clone(sink);
        self.runner
            .run_one(async move { manager.convert_to_table(&sink).await }, monitor)
            .await
    }

    /// Convert sinks one after the other, reporting progress per sink.
    pub async fn convert_to_tables(
        &self,
        sinks: &[Arc<Sink>],
        monitor: &ExecutionMonitor,
    ) -> Result<Vec<ColumnarTable>> {
        let mut tables = Vec::with_capacity(sinks.len());
        for (i, sink) in sinks.iter().enumerate() {
            monitor.set_progress_with_message(
                i as f64 / sinks.len() as f64,
                format!("Converting table {} of {}", i + 1, sinks.len()),
            );
            tables.push(self.convert_to_table(sink, monitor).await?);
        }
        monitor.set_progress(1.0);
        Ok(tables)
    }

    /// Close the sink manager and delete table copies. Idempotent.
    pub async fn close(&self) {
        self.manager.close().await;
        self.factory.close();
    }
}
