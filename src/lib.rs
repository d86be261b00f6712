//! wordstm: word-based software transactional memory.
//!
//! Transactions read and write machine words. Every word is covered by a
//! versioned lock in a global lock table; a global clock orders commits.
//! Reads are invisible and validated against a snapshot that is extended
//! lazily, writes are guarded by the lock table.
//!
//! # Designs
//!
//! - **Write-back, encounter-time locking** (default): stores take their
//!   lock immediately and buffer the value until commit.
//! - **Write-back, commit-time locking**: stores are buffered without
//!   locking; locks are taken during commit.
//! - **Write-through**: stores take their lock and write memory directly,
//!   logging the old value for rollback.
//!
//! Conflicts on owned locks go to a contention manager
//! ([`ContentionPolicy`]).
//!
//! # Example
//!
//! ```
//! use wordstm::{Config, Design, Stm, TWord};
//!
//! let stm = Stm::new(Config::default().with_design(Design::WriteThrough)).unwrap();
//! let from = TWord::new(100);
//! let to = TWord::new(0);
//!
//! stm.atomically(|tx| {
//!     let a = tx.read(&from)?;
//!     let b = tx.read(&to)?;
//!     tx.write(&from, a - 30)?;
//!     tx.write(&to, b + 30)
//! });
//! assert_eq!(stm.unit_load(&from).0 + stm.unit_load(&to).0, 100);
//! ```
//!
//! Aborts surface as `Err(StmError::Aborted(_))` from the access that
//! detected them, after the transaction has been rolled back. Propagating
//! them with `?` restarts the closure.

mod trace;

mod clock;
mod cm;
mod config;
mod engine;
mod error;
mod hooks;
mod lock;
mod registry;
mod rwset;
mod stats;
mod transaction;
mod typed;
mod wbctl;
mod wbetl;
mod wt;

pub use cm::ContentionPolicy;
pub use config::{
    Config, DEFAULT_LOCK_SHIFT_EXTRA, DEFAULT_LOCK_TABLE_BITS, DEFAULT_MAX_THREADS,
    DEFAULT_RW_SET_SIZE, DEFAULT_VR_THRESHOLD, Design, Parameter,
};
pub use engine::Stm;
pub use error::{AbortReason, StmError};
pub use hooks::{Callback, CallbackContext, Event, MAX_SPECIFIC, SlotKey};
pub use lock::{LockWord, MAX_OWNER_ID, VERSION_CAPACITY};
pub use transaction::{Attributes, Status, Transaction};
pub use typed::TWord;

use once_cell::race::OnceBox;
use std::cell::RefCell;

static GLOBAL: OnceBox<Stm> = OnceBox::new();

thread_local! {
    static CURRENT: RefCell<Option<Transaction<'static>>> = const { RefCell::new(None) };
}

/// Initialise the process-wide engine with `config`.
///
/// Fails with [`StmError::AlreadyInitialized`] if it already exists, either
/// from an earlier call or from first use through [`global`].
pub fn init(config: Config) -> Result<&'static Stm, StmError> {
    if GLOBAL.get().is_some() {
        return Err(StmError::AlreadyInitialized);
    }
    let stm = Box::new(Stm::new(config)?);
    GLOBAL
        .set(stm)
        .map_err(|_| StmError::AlreadyInitialized)?;
    Ok(global())
}

/// The process-wide engine, built with the default configuration on first use.
pub fn global() -> &'static Stm {
    GLOBAL.get_or_init(|| Box::new(Stm::default()))
}

/// Run `f` atomically on the calling thread's descriptor of the global engine.
///
/// The descriptor is registered on first use and released when the thread
/// exits or calls [`thread_exit`]. Inside `f`, use [`Transaction::nested`]
/// rather than calling this function again.
///
/// # Example
///
/// ```
/// use wordstm::TWord;
///
/// static HITS: TWord = TWord::new(0);
///
/// wordstm::atomically(|tx| {
///     let n = tx.read(&HITS)?;
///     tx.write(&HITS, n + 1)
/// });
/// assert_eq!(HITS.load_unsynchronized(), 1);
/// ```
pub fn atomically<F, T>(f: F) -> T
where
    F: FnMut(&mut Transaction<'static>) -> Result<T, StmError>,
{
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        let tx = current.get_or_insert_with(|| match global().register_thread() {
            Ok(tx) => tx,
            Err(e) => panic!("cannot register transaction descriptor: {e}"),
        });
        tx.atomically(f)
    })
}

/// Release the calling thread's descriptor of the global engine, if any.
///
/// Inside [`atomically`] the descriptor is in use and this does nothing.
pub fn thread_exit() {
    let _ = CURRENT.try_with(|current| {
        if let Ok(mut current) = current.try_borrow_mut() {
            current.take();
        }
    });
}
