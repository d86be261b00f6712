//! Word cells, typed and byte-range access, and unit (single-word) access.
//!
//! The engine works on machine words. Narrower or unaligned accesses are
//! split into masked accesses on the words that cover them, so a store of
//! one byte never disturbs its neighbours, whatever the design.

use crate::engine::Stm;
use crate::error::StmError;
use crate::lock::{LockWord, Owner};
use crate::transaction::Transaction;
use core::fmt;
use core::mem::size_of;
use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicUsize, Ordering};

const WORD: usize = size_of::<usize>();

/// A machine word shared through the engine.
///
/// Transactions touch it through [`Transaction::read`] and
/// [`Transaction::write`]; code outside transactions uses
/// [`Stm::unit_load`] and [`Stm::unit_store`].
#[repr(transparent)]
pub struct TWord(AtomicUsize);

impl TWord {
    pub const fn new(value: usize) -> Self {
        TWord(AtomicUsize::new(value))
    }

    /// Address of the word, for the raw access methods.
    pub fn as_ptr(&self) -> *mut usize {
        self.0.as_ptr()
    }

    pub fn into_inner(self) -> usize {
        self.0.into_inner()
    }

    /// Direct access; exclusive borrow rules out concurrent transactions.
    pub fn get_mut(&mut self) -> &mut usize {
        self.0.get_mut()
    }

    /// Read the word bypassing the engine.
    ///
    /// Under write-through this may observe a value an active transaction
    /// has not committed yet.
    pub fn load_unsynchronized(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for TWord {
    fn default() -> Self {
        TWord::new(0)
    }
}

impl fmt::Debug for TWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TWord").field(&self.load_unsynchronized()).finish()
    }
}

impl<'stm> Transaction<'stm> {
    pub fn read(&mut self, word: &'stm TWord) -> Result<usize, StmError> {
        // SAFETY: a `TWord` is aligned and outlives the descriptor.
        unsafe { self.load_word(word.as_ptr() as usize) }
    }

    pub fn write(&mut self, word: &'stm TWord, value: usize) -> Result<(), StmError> {
        self.write_masked(word, value, usize::MAX)
    }

    /// Write only the bits of `value` selected by `mask`.
    pub fn write_masked(
        &mut self,
        word: &'stm TWord,
        value: usize,
        mask: usize,
    ) -> Result<(), StmError> {
        // SAFETY: as for `read`.
        unsafe { self.store_word(word.as_ptr() as usize, value, mask) }
    }

    /// Transactional load of a raw word.
    ///
    /// # Safety
    ///
    /// `addr` must be aligned and stay valid until the transaction commits
    /// or aborts, and every concurrent access to the word must go through
    /// this engine.
    pub unsafe fn load(&mut self, addr: *const usize) -> Result<usize, StmError> {
        unsafe { self.load_word(addr as usize) }
    }

    /// Transactional store of a raw word.
    ///
    /// # Safety
    ///
    /// Same as [`Transaction::load`].
    pub unsafe fn store(&mut self, addr: *mut usize, value: usize) -> Result<(), StmError> {
        unsafe { self.store_word(addr as usize, value, usize::MAX) }
    }

    /// Transactional store of the bits of `value` selected by `mask`.
    ///
    /// # Safety
    ///
    /// Same as [`Transaction::load`].
    pub unsafe fn store_masked(
        &mut self,
        addr: *mut usize,
        value: usize,
        mask: usize,
    ) -> Result<(), StmError> {
        unsafe { self.store_word(addr as usize, value, mask) }
    }

    /// Load `buf.len()` bytes starting at `addr`.
    ///
    /// # Safety
    ///
    /// Every aligned word overlapping the range must satisfy the contract of
    /// [`Transaction::load`].
    pub unsafe fn load_bytes(&mut self, addr: *const u8, buf: &mut [u8]) -> Result<(), StmError> {
        let start = addr as usize;
        let mut done = 0;
        while done < buf.len() {
            let at = start + done;
            let base = at & !(WORD - 1);
            let offset = at - base;
            let n = (WORD - offset).min(buf.len() - done);
            let bytes = unsafe { self.load_word(base)? }.to_ne_bytes();
            buf[done..done + n].copy_from_slice(&bytes[offset..offset + n]);
            done += n;
        }
        Ok(())
    }

    /// Store `bytes` starting at `addr`, leaving the rest of each word alone.
    ///
    /// # Safety
    ///
    /// Same as [`Transaction::load_bytes`].
    pub unsafe fn store_bytes(&mut self, addr: *mut u8, bytes: &[u8]) -> Result<(), StmError> {
        let start = addr as usize;
        let mut done = 0;
        while done < bytes.len() {
            let at = start + done;
            let base = at & !(WORD - 1);
            let offset = at - base;
            let n = (WORD - offset).min(bytes.len() - done);
            let mut value = [0u8; WORD];
            let mut mask = [0u8; WORD];
            value[offset..offset + n].copy_from_slice(&bytes[done..done + n]);
            mask[offset..offset + n].fill(0xff);
            unsafe {
                self.store_word(
                    base,
                    usize::from_ne_bytes(value),
                    usize::from_ne_bytes(mask),
                )?
            };
            done += n;
        }
        Ok(())
    }
}

macro_rules! typed_access {
    ($($ty:ty => $load:ident, $store:ident;)*) => {
        impl Transaction<'_> {
            $(
                #[doc = concat!("Transactional load of a `", stringify!($ty), "`.")]
                ///
                /// # Safety
                ///
                /// Same as [`Transaction::load_bytes`].
                pub unsafe fn $load(&mut self, addr: *const $ty) -> Result<$ty, StmError> {
                    let mut buf = [0u8; size_of::<$ty>()];
                    unsafe { self.load_bytes(addr.cast(), &mut buf)? };
                    Ok(<$ty>::from_ne_bytes(buf))
                }

                #[doc = concat!("Transactional store of a `", stringify!($ty), "`.")]
                ///
                /// # Safety
                ///
                /// Same as [`Transaction::load_bytes`].
                pub unsafe fn $store(&mut self, addr: *mut $ty, value: $ty) -> Result<(), StmError> {
                    unsafe { self.store_bytes(addr.cast(), &value.to_ne_bytes()) }
                }
            )*
        }
    };
}

typed_access! {
    u8 => load_u8, store_u8;
    u16 => load_u16, store_u16;
    u32 => load_u32, store_u32;
    u64 => load_u64, store_u64;
    u128 => load_u128, store_u128;
    usize => load_usize, store_usize;
    i8 => load_i8, store_i8;
    i16 => load_i16, store_i16;
    i32 => load_i32, store_i32;
    i64 => load_i64, store_i64;
    i128 => load_i128, store_i128;
    isize => load_isize, store_isize;
    f32 => load_f32, store_f32;
    f64 => load_f64, store_f64;
}

impl Stm {
    /// Read `word` outside any transaction.
    ///
    /// Waits while the word's lock is owned. Returns the value and the
    /// version it was committed at.
    pub fn unit_load(&self, word: &TWord) -> (usize, u64) {
        let lock = self.locks.locate(word.as_ptr() as usize);
        let backoff = Backoff::new();
        loop {
            let l = self.locks.load(lock);
            if l.is_owned() {
                backoff.snooze();
                continue;
            }
            let value = word.0.load(Ordering::Acquire);
            if self.locks.load(lock) == l {
                return (value, l.version());
            }
        }
    }

    /// Write `word` as a single-word transaction; returns its commit version.
    ///
    /// May be called while the calling thread has an active transaction, as
    /// long as that transaction does not hold the lock covering `word`:
    /// the store would wait for it forever.
    pub fn unit_store(&self, word: &TWord, value: usize) -> u64 {
        if self.config.rollover {
            self.quiesce
                .enter(&self.clock, &self.locks, self.config.version_max);
        }
        let lock = self.locks.locate(word.as_ptr() as usize);
        let owned = LockWord::owned(Owner {
            tid: self.registry.unit_tid(),
            entry: 0,
        });
        let backoff = Backoff::new();
        loop {
            let l = self.locks.load(lock);
            if !l.is_owned() && self.locks.try_acquire(lock, l, owned) {
                break;
            }
            backoff.snooze();
        }
        word.0.store(value, Ordering::Release);
        let ts = self.next_version();
        self.locks.release(lock, LockWord::unowned(ts, 0));
        if self.config.rollover {
            self.quiesce.leave();
        }
        ts
    }
}
