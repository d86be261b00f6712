//! Zero-cost hot-path logging.
//!
//! Loads, stores and conflicts happen millions of times per second, so their
//! events only reach `tracing` when the `access-trace` feature is enabled.
//! Without it the macros expand to nothing. Cold-path events (engine setup,
//! descriptor lifecycle, clock roll-over) call `tracing` directly.
//!
//! ```bash
//! RUST_LOG=wordstm=trace cargo test --features access-trace scenario_stale_read
//! ```

#![allow(unused_macros, unused_imports)]

/// Trace-level access event. No-op without `access-trace`.
#[cfg(feature = "access-trace")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "access-trace"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

/// Debug-level access event. No-op without `access-trace`.
#[cfg(feature = "access-trace")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "access-trace"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use trace_log;
