//! Versioned locks and the lock table.
//!
//! A lock is one `u64`. Bit 0 says whether it is owned.
//!
//! ```text
//! unowned: | version (60 bits)            | incarnation (3) | 0 |
//! owned:   | write-set entry index (47)   | owner id (16)   | 1 |
//! ```
//!
//! The owner reference is an index into the owner's write-set arena, never a
//! pointer, so a stale lock word can at worst name an entry that no longer
//! exists; it can never dangle.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering, fence};

const OWNED_BIT: u64 = 1;

const INCARNATION_SHIFT: u32 = 1;
const INCARNATION_BITS: u32 = 3;
/// Largest incarnation before the version itself has to move.
pub(crate) const INCARNATION_MAX: u64 = (1 << INCARNATION_BITS) - 1;

const VERSION_SHIFT: u32 = INCARNATION_SHIFT + INCARNATION_BITS;
/// Largest version a lock word can hold.
pub const VERSION_CAPACITY: u64 = u64::MAX >> VERSION_SHIFT;

const OWNER_SHIFT: u32 = 1;
const OWNER_BITS: u32 = 16;
/// Largest descriptor id that fits in an owned lock word.
pub const MAX_OWNER_ID: u32 = (1 << OWNER_BITS) - 1;

const ENTRY_SHIFT: u32 = OWNER_SHIFT + OWNER_BITS;

/// Reference held by an owned lock: which descriptor, and which of its write-set entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Owner {
    pub(crate) tid: u32,
    pub(crate) entry: u32,
}

/// Decoded view of a lock word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct LockWord(u64);

impl LockWord {
    /// Unowned, version 0, incarnation 0.
    pub const ZERO: LockWord = LockWord(0);

    /// Unowned lock carrying `version` and `incarnation`.
    #[inline]
    pub const fn unowned(version: u64, incarnation: u64) -> Self {
        debug_assert!(version <= VERSION_CAPACITY);
        debug_assert!(incarnation <= INCARNATION_MAX);
        LockWord((version << VERSION_SHIFT) | (incarnation << INCARNATION_SHIFT))
    }

    #[inline]
    pub(crate) const fn owned(owner: Owner) -> Self {
        LockWord(
            OWNED_BIT
                | ((owner.tid as u64) << OWNER_SHIFT)
                | ((owner.entry as u64) << ENTRY_SHIFT),
        )
    }

    /// Wrap a raw lock word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        LockWord(raw)
    }

    /// The raw `u64` stored in the table.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether a transaction currently holds this lock.
    #[inline]
    pub const fn is_owned(self) -> bool {
        self.0 & OWNED_BIT != 0
    }

    /// Commit version of an unowned lock.
    #[inline]
    pub const fn version(self) -> u64 {
        debug_assert!(!self.is_owned());
        self.0 >> VERSION_SHIFT
    }

    /// Undo counter of an unowned lock (write-through design only).
    #[inline]
    pub const fn incarnation(self) -> u64 {
        debug_assert!(!self.is_owned());
        (self.0 >> INCARNATION_SHIFT) & INCARNATION_MAX
    }

    #[inline]
    pub(crate) const fn owner(self) -> Option<Owner> {
        if self.is_owned() {
            Some(Owner {
                tid: ((self.0 >> OWNER_SHIFT) & MAX_OWNER_ID as u64) as u32,
                entry: (self.0 >> ENTRY_SHIFT) as u32,
            })
        } else {
            None
        }
    }
}

impl fmt::Debug for LockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner() {
            Some(owner) => f
                .debug_struct("Owned")
                .field("tid", &owner.tid)
                .field("entry", &owner.entry)
                .finish(),
            None => f
                .debug_struct("Unowned")
                .field("version", &self.version())
                .field("incarnation", &self.incarnation())
                .finish(),
        }
    }
}

/// Fixed-size array of versioned locks, indexed by a hash of the address.
///
/// Several addresses may share one lock; that only ever causes false conflicts.
pub(crate) struct LockTable {
    locks: Box<[AtomicU64]>,
    mask: usize,
    shift: u32,
}

impl LockTable {
    pub(crate) fn new(bits: u32, shift_extra: u32) -> Self {
        let size = 1usize << bits;
        let locks = (0..size).map(|_| AtomicU64::new(0)).collect();
        Self {
            locks,
            mask: size - 1,
            shift: core::mem::size_of::<usize>().trailing_zeros() + shift_extra,
        }
    }

    /// Number of locks in the table.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }

    /// Index of the lock protecting `addr`.
    #[inline]
    pub(crate) fn locate(&self, addr: usize) -> usize {
        (addr >> self.shift) & self.mask
    }

    #[inline]
    pub(crate) fn load(&self, idx: usize) -> LockWord {
        LockWord(self.locks[idx].load(Ordering::Acquire))
    }

    /// Single CAS from `expected` to `new`.
    #[inline]
    pub(crate) fn try_acquire(&self, idx: usize, expected: LockWord, new: LockWord) -> bool {
        self.locks[idx]
            .compare_exchange(expected.0, new.0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Open the lock with `word`. The release store orders every prior write
    /// to the protected memory before the new version becomes visible.
    #[inline]
    pub(crate) fn release(&self, idx: usize, word: LockWord) {
        debug_assert!(!word.is_owned());
        self.locks[idx].store(word.0, Ordering::Release);
    }

    /// Zero every lock. Only sound while no transaction is active.
    pub(crate) fn reset(&self) {
        for lock in self.locks.iter() {
            lock.store(0, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }
}
