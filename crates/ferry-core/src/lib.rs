//! ferry-core: Shared components for the ferry exchange engine.
//!
//! This crate contains the ambient infrastructure used by the engine crate and
//! by any host process embedding it:
//!
//! - `cancel` - Cooperative cancellation and the cancelable task runner
//! - `config` - YAML loading with environment variable interpolation
//! - `metrics` - Internal events and the `emit!` macro
//! - `signal` - Signal handling for graceful shutdown
//! - `tracing` - Subscriber initialization for CLI applications
//! - `error` - Common error types

pub mod cancel;
pub mod config;
pub mod error;
pub mod metrics;
pub mod signal;
pub mod tracing;

// Re-export commonly used items
pub use cancel::{
    Cancelable, CancelableTaskRunner, DEFAULT_POLL_INTERVAL, ExecutionMonitor, NeverCanceled,
};
pub use config::{InterpolationResult, interpolate, load_yaml};
pub use error::{ConfigError, TaskInterrupted};
pub use signal::{cancel_on_shutdown, shutdown_signal};
pub use tracing::init_tracing;
