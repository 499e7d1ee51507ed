//! Generic engine that processes batches while they are being written.
//!
//! A [`BatchProcessor`] owns a single sequential reader, opened lazily on the
//! first unit of work. Every call to [`BatchProcessor::submit_next_batch`]
//! schedules one unit on a bounded pool of blocking workers. A worker pulls
//! the next batch while holding the reader lock, so each worker receives a
//! distinct batch in file order, then runs the [`BatchHandler`] outside the
//! lock. The first error of any worker is latched and returned to every later
//! caller.

mod in_flight;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use arrow::datatypes::SchemaRef;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use ferry_core::emit;
use ferry_core::metrics::events::{BatchProcessed, ProcessorFailed};

use crate::error::{ExchangeError, Result, TaskInterrupted};
use crate::source::{ReadBatch, SequentialBatchReader};
use in_flight::InFlight;

/// Opens the reader of a processor. Called at most once.
pub type ReaderSupplier = Box<dyn FnOnce() -> Result<Box<dyn SequentialBatchReader>> + Send>;

/// Per-batch work plugged into a [`BatchProcessor`].
pub trait BatchHandler: Send + Sync + 'static {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Runs once, right after the reader has been opened.
    fn on_reader_opened(&self, _schema: &SchemaRef) -> Result<()> {
        Ok(())
    }

    /// Process one batch. Runs on a worker thread, possibly in parallel with
    /// other batches.
    ///
    /// Long loops should poll [`BatchContext::should_continue`].
    fn process_batch(&self, batch: &ReadBatch, ctx: &BatchContext<'_>) -> Result<()>;
}

/// View on the processor's stop conditions, handed to [`BatchHandler`]s.
pub struct BatchContext<'a> {
    running: &'a AtomicBool,
    error: &'a OnceLock<ExchangeError>,
}

impl BatchContext<'_> {
    /// False once the processor is closing or an error has been latched.
    pub fn should_continue(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.error.get().is_none()
    }
}

/// Lifecycle of a [`BatchProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// No batch has been submitted.
    NotStarted,
    /// Accepting batches.
    Running,
    /// Waiting for in-flight work; no new batches are accepted.
    Draining,
    /// Reader released.
    Closed,
}

struct ReaderSlot {
    supplier: Option<ReaderSupplier>,
    reader: Option<Box<dyn SequentialBatchReader>>,
}

struct Shared<H> {
    handler: H,
    reader: Mutex<ReaderSlot>,
    workers: Arc<Semaphore>,
    in_flight: InFlight,
    running: AtomicBool,
    error: OnceLock<ExchangeError>,
    state: Mutex<ProcessorState>,
}

impl<H: BatchHandler> Shared<H> {
    fn context(&self) -> BatchContext<'_> {
        BatchContext {
            running: &self.running,
            error: &self.error,
        }
    }

    fn process_next(&self) -> Result<()> {
        if !self.context().should_continue() {
            return Ok(());
        }

        let batch = {
            let mut slot = self.reader.lock();
            if slot.reader.is_none() {
                let supplier = slot
                    .supplier
                    .take()
                    .ok_or_else(|| ExchangeError::contract("batch reader was already released"))?;
                let reader = supplier()?;
                self.handler.on_reader_opened(&reader.schema())?;
                debug!(processor = self.handler.name(), "Batch reader opened");
                slot.reader = Some(reader);
            }
            match slot.reader.as_mut() {
                Some(reader) => reader.forward()?,
                None => return Err(ExchangeError::contract("batch reader is not open")),
            }
        };

        let rows = batch.num_rows() as u64;
        self.handler.process_batch(&batch, &self.context())?;
        emit!(BatchProcessed {
            processor: self.handler.name(),
            rows,
        });
        Ok(())
    }

    fn fail(&self, error: ExchangeError) {
        let processor = self.handler.name();
        match self.error.set(error) {
            Ok(()) => {
                if let Some(error) = self.error.get() {
                    debug!(processor, error = %error, "Batch processing failed");
                }
                emit!(ProcessorFailed { processor });
            }
            Err(later) => {
                debug!(processor, error = %later, "Ignoring error after first failure");
            }
        }
    }

    fn latched(&self) -> Result<()> {
        match self.error.get() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Schedules batches of a single reader onto a bounded worker pool.
pub struct BatchProcessor<H: BatchHandler> {
    shared: Arc<Shared<H>>,
    runtime: Handle,
}

impl<H: BatchHandler> BatchProcessor<H> {
    /// Create a processor with `num_workers` concurrent workers.
    ///
    /// Must be called within a tokio runtime; batches may later be submitted
    /// from any thread.
    pub fn new(handler: H, supplier: ReaderSupplier, num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(ExchangeError::contract("a batch processor needs at least one worker"));
        }
        let runtime = Handle::try_current().map_err(|_| {
            ExchangeError::contract("batch processors must be created inside a tokio runtime")
        })?;

        Ok(Self {
            shared: Arc::new(Shared {
                handler,
                reader: Mutex::new(ReaderSlot {
                    supplier: Some(supplier),
                    reader: None,
                }),
                workers: Arc::new(Semaphore::new(num_workers)),
                in_flight: InFlight::new(),
                running: AtomicBool::new(true),
                error: OnceLock::new(),
                state: Mutex::new(ProcessorState::NotStarted),
            }),
            runtime,
        })
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    pub fn state(&self) -> ProcessorState {
        *self.shared.state.lock()
    }

    /// True while no error has been latched. Never blocks.
    pub fn is_valid(&self) -> bool {
        self.shared.error.get().is_none()
    }

    pub fn invalid_cause(&self) -> Option<ExchangeError> {
        self.shared.error.get().cloned()
    }

    /// Latch `error` unless an earlier one is already latched.
    pub(crate) fn fail(&self, error: ExchangeError) {
        self.shared.fail(error);
    }

    /// Schedule processing of the next batch.
    ///
    /// Returns the latched error instead if processing has already failed.
    pub fn submit_next_batch(&self) -> Result<()> {
        self.shared.latched()?;

        let guard = {
            let mut state = self.shared.state.lock();
            match *state {
                ProcessorState::NotStarted => *state = ProcessorState::Running,
                ProcessorState::Running => {}
                ProcessorState::Draining | ProcessorState::Closed => {
                    return Err(ExchangeError::contract(format!(
                        "{} processor no longer accepts batches",
                        self.shared.handler.name()
                    )));
                }
            }
            self.shared.in_flight.enter()
        };

        let shared = Arc::clone(&self.shared);
        self.runtime.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = Arc::clone(&shared.workers).acquire_owned().await else {
                return;
            };

            let worker = Arc::clone(&shared);
            let result = match tokio::task::spawn_blocking(move || worker.process_next()).await {
                Ok(result) => result,
                Err(e) => Err(TaskInterrupted::from_join_error(e).into()),
            };
            if let Err(e) = result {
                shared.fail(e);
            }
        });

        Ok(())
    }

    /// Wait until every submitted batch has been processed.
    ///
    /// Afterwards no further batches are accepted. Returns the latched error,
    /// if any. Safe to call repeatedly and from several tasks.
    pub async fn await_completion(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, ProcessorState::NotStarted | ProcessorState::Running) {
                *state = ProcessorState::Draining;
            }
        }
        self.shared.in_flight.wait_idle().await;
        self.shared.workers.close();
        self.shared.latched()
    }

    /// Stop processing, wait for in-flight work and release the reader.
    ///
    /// Idempotent. Returns the latched error, if any.
    pub async fn close(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);
        {
            let mut state = self.shared.state.lock();
            if *state == ProcessorState::Closed {
                return self.shared.latched();
            }
            *state = ProcessorState::Draining;
        }

        self.shared.in_flight.wait_idle().await;
        self.shared.workers.close();

        let released = {
            let mut slot = self.shared.reader.lock();
            slot.supplier = None;
            slot.reader.take()
        };
        let closed = match released {
            Some(mut reader) => {
                let outstanding = reader.outstanding();
                if outstanding > 0 {
                    warn!(
                        processor = self.shared.handler.name(),
                        outstanding, "Closing reader with unreleased batches"
                    );
                }
                reader.close()
            }
            None => Ok(()),
        };

        *self.shared.state.lock() = ProcessorState::Closed;
        debug!(processor = self.shared.handler.name(), "Batch processor closed");
        self.shared.latched()?;
        closed
    }
}
