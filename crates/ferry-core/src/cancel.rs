//! Cooperative cancellation for awaited work.
//!
//! Work submitted through [`CancelableTaskRunner`] runs on the tokio runtime
//! while the caller polls a [`Cancelable`] at a fixed interval. Cancellation is
//! never preemptive: a positive check aborts the awaited task handles and
//! returns [`TaskInterrupted::Canceled`] to the caller, but work that already
//! reached a blocking section finishes on its own.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TaskInterrupted;

/// Default interval between two cancellation checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Something that can be asked whether the current execution was canceled.
pub trait Cancelable: Send + Sync {
    /// Returns true once the execution has been canceled.
    fn is_canceled(&self) -> bool;

    /// Returns `Err(TaskInterrupted::Canceled)` if the execution has been canceled.
    fn check_canceled(&self) -> Result<(), TaskInterrupted> {
        if self.is_canceled() {
            Err(TaskInterrupted::Canceled)
        } else {
            Ok(())
        }
    }
}

impl Cancelable for CancellationToken {
    fn is_canceled(&self) -> bool {
        self.is_cancelled()
    }
}

impl<T: Cancelable + ?Sized> Cancelable for Arc<T> {
    fn is_canceled(&self) -> bool {
        (**self).is_canceled()
    }
}

impl<T: Cancelable + ?Sized> Cancelable for &T {
    fn is_canceled(&self) -> bool {
        (**self).is_canceled()
    }
}

/// A [`Cancelable`] that never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCanceled;

impl Cancelable for NeverCanceled {
    fn is_canceled(&self) -> bool {
        false
    }
}

/// Progress and cancellation handle for a long-running host operation.
///
/// Progress is a fraction in `[0, 1]` plus an optional message. Clones share
/// state, so a monitor can be handed to worker tasks while the caller keeps
/// the original to cancel or observe it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMonitor {
    token: CancellationToken,
    progress: Arc<AtomicU64>,
    message: Arc<Mutex<Option<String>>>,
}

impl ExecutionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a monitor that is canceled together with `token`.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    /// The token backing this monitor.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request cancellation of everything observing this monitor.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Set the progress fraction, clamped to `[0, 1]`.
    pub fn set_progress(&self, fraction: f64) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.progress.store(fraction.to_bits(), Ordering::Relaxed);
    }

    /// Set the progress fraction together with a message.
    pub fn set_progress_with_message(&self, fraction: f64, message: impl Into<String>) {
        self.set_progress(fraction);
        *self.message.lock() = Some(message.into());
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub fn message(&self) -> Option<String> {
        self.message.lock().clone()
    }
}

impl Cancelable for ExecutionMonitor {
    fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs tasks on the tokio runtime and awaits them while polling for cancellation.
///
/// The caller never waits longer than one poll interval without checking its
/// [`Cancelable`] again.
#[derive(Debug, Clone)]
pub struct CancelableTaskRunner {
    poll_interval: Duration,
}

impl Default for CancelableTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelableTaskRunner {
    /// Create a runner polling every [`DEFAULT_POLL_INTERVAL`].
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run a single task, aborting it if `cancelable` fires before it finishes.
    pub async fn run_one<F, T, E>(&self, task: F, cancelable: &dyn Cancelable) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<TaskInterrupted> + Send + 'static,
    {
        let mut handle = tokio::spawn(task);
        let result = self.await_cancelable(&mut handle, cancelable).await;
        if result.is_err() {
            handle.abort();
        }
        result
    }

    /// Run all tasks concurrently and collect their results in submission order.
    ///
    /// Every task is spawned up front. The first failure or cancellation aborts
    /// all remaining tasks and is returned as the single cause.
    pub async fn run_all<F, T, E, I>(&self, tasks: I, cancelable: &dyn Cancelable) -> Result<Vec<T>, E>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<TaskInterrupted> + Send + 'static,
    {
        let mut handles: Vec<JoinHandle<Result<T, E>>> = tasks.into_iter().map(tokio::spawn).collect();
        let mut results = Vec::with_capacity(handles.len());

        for index in 0..handles.len() {
            match self.await_cancelable(&mut handles[index], cancelable).await {
                Ok(value) => results.push(value),
                Err(e) => {
                    debug!(
                        failed_task = index,
                        remaining = handles.len() - index - 1,
                        "Aborting remaining tasks"
                    );
                    for handle in &handles[index..] {
                        handle.abort();
                    }
                    return Err(e);
                }
            }
        }

        Ok(results)
    }

    async fn await_cancelable<T, E>(
        &self,
        handle: &mut JoinHandle<Result<T, E>>,
        cancelable: &dyn Cancelable,
    ) -> Result<T, E>
    where
        E: From<TaskInterrupted>,
    {
        loop {
            tokio::select! {
                biased;

                joined = &mut *handle => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) => Err(TaskInterrupted::from_join_error(e).into()),
                    };
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    cancelable.check_canceled()?;
                }
            }
        }
    }
}
