//! Shared test setup.
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//! }
//! ```
//!
//! Output is controlled by `RUST_LOG`, e.g. `RUST_LOG=wordstm=debug`. Per-access
//! events additionally need the `access-trace` feature.

#![allow(dead_code)]

use std::sync::Once;
use tracing_subscriber::EnvFilter;
use wordstm::{Config, Design, Stm};

static INIT: Once = Once::new();

/// Install a fmt subscriber once per test binary.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_ids(true)
            .try_init();
    });
}

pub const DESIGNS: [Design; 3] = [
    Design::WriteBackEtl,
    Design::WriteBackCtl,
    Design::WriteThrough,
];

/// A small engine for `design`.
pub fn engine(design: Design) -> Stm {
    init_tracing();
    Stm::new(Config::default().with_design(design).with_lock_table_bits(12)).unwrap()
}
