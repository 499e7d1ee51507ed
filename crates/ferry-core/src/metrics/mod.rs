//! Metrics infrastructure.
//!
//! Events implement [`events::InternalEvent`] and are emitted with the
//! [`emit!`] macro. The library never installs a recorder; without one the
//! underlying `metrics` macros are no-ops.

pub mod events;

/// Macro for emitting metric events.
///
/// # Example
///
/// ```ignore
/// use ferry_core::metrics::events::SinkCreated;
///
/// emit!(SinkCreated);
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
