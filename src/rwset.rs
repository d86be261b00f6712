//! Per-transaction read and write sets.
//!
//! Both are contiguous arrays. Write-set entries are addressed by index: an
//! owned lock word names `(owner id, entry index)`, and entries covering the
//! same lock form a chain through `next`, starting at the entry that
//! acquired the lock.

use crate::lock::LockWord;
use foldhash::fast::FixedState;
use std::collections::HashMap;

/// A load that did not go through the write set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadEntry {
    /// Lock table index.
    pub(crate) lock: usize,
    /// Lock word observed when the value was read.
    pub(crate) word: LockWord,
}

pub(crate) struct ReadSet {
    entries: Vec<ReadEntry>,
}

impl ReadSet {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub(crate) fn push(&mut self, lock: usize, word: LockWord) {
        self.entries.push(ReadEntry { lock, word });
    }

    #[inline]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &ReadEntry> {
        self.entries.iter()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Empty the set, keeping its allocation.
    #[inline]
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One buffered (write-back) or logged (write-through) word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteEntry {
    /// Word address.
    pub(crate) addr: usize,
    /// Pending value for write-back designs, undo value for write-through.
    pub(crate) value: usize,
    /// Bits of `value` that were written. Zero marks a visible read.
    pub(crate) mask: usize,
    /// Lock word replaced when the lock was acquired.
    pub(crate) prior: LockWord,
    /// Lock table index.
    pub(crate) lock: usize,
    /// Next entry covering the same lock.
    pub(crate) next: Option<u32>,
    /// This entry's acquisition took the lock; it is released exactly once, here.
    pub(crate) held: bool,
}

impl WriteEntry {
    pub(crate) fn new(addr: usize, value: usize, mask: usize, lock: usize) -> Self {
        Self {
            addr,
            value: value & mask,
            mask,
            prior: LockWord::ZERO,
            lock,
            next: None,
            held: false,
        }
    }

    /// Fold a later write to the same address into this entry.
    #[inline]
    pub(crate) fn merge(&mut self, value: usize, mask: usize) {
        self.value = (self.value & !mask) | (value & mask);
        self.mask |= mask;
    }

    /// Overlay the pending bits on `current`.
    #[inline]
    pub(crate) fn apply(&self, current: usize) -> usize {
        (current & !self.mask) | (self.value & self.mask)
    }
}

pub(crate) struct WriteSet {
    entries: Vec<WriteEntry>,
    /// Entries allowed before the set must grow.
    limit: usize,
    /// Address lookup for designs that do not hold locks while executing.
    index: HashMap<usize, u32, FixedState>,
}

impl WriteSet {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            limit: capacity,
            index: HashMap::with_hasher(FixedState::default()),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Current capacity in entries.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.limit
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    /// Double the capacity. Only called between attempts for encounter-time locking.
    pub(crate) fn grow(&mut self) {
        self.limit *= 2;
        self.entries.reserve(self.limit - self.entries.len());
    }

    /// Append, growing in place when full. Returns the new entry's index.
    #[inline]
    pub(crate) fn push(&mut self, entry: WriteEntry) -> u32 {
        if self.is_full() {
            self.grow();
        }
        let idx = self.entries.len() as u32;
        self.entries.push(entry);
        idx
    }

    #[inline]
    pub(crate) fn get(&self, idx: u32) -> &WriteEntry {
        &self.entries[idx as usize]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, idx: u32) -> &mut WriteEntry {
        &mut self.entries[idx as usize]
    }

    /// Whether `idx` names an entry of this set covering `lock`.
    #[inline]
    pub(crate) fn is_head_of(&self, idx: u32, lock: usize) -> bool {
        self.entries
            .get(idx as usize)
            .is_some_and(|e| e.held && e.lock == lock)
    }

    #[inline]
    pub(crate) fn entries(&self) -> &[WriteEntry] {
        &self.entries
    }

    /// Entry for `addr` in the chain starting at `head`.
    pub(crate) fn find_in_chain(&self, head: u32, addr: usize) -> Option<u32> {
        let mut cur = Some(head);
        while let Some(idx) = cur {
            let entry = self.get(idx);
            if entry.addr == addr {
                return Some(idx);
            }
            cur = entry.next;
        }
        None
    }

    /// Link `idx` at the end of the chain starting at `head`.
    pub(crate) fn link(&mut self, head: u32, idx: u32) {
        let mut tail = head;
        while let Some(next) = self.get(tail).next {
            tail = next;
        }
        self.get_mut(tail).next = Some(idx);
    }

    /// Entry for `addr`, via the address index.
    #[inline]
    pub(crate) fn lookup(&self, addr: usize) -> Option<u32> {
        self.index.get(&addr).copied()
    }

    /// Append and index by address.
    pub(crate) fn push_indexed(&mut self, entry: WriteEntry) -> u32 {
        let addr = entry.addr;
        let idx = self.push(entry);
        self.index.insert(addr, idx);
        idx
    }

    /// Empty the set, keeping its allocation.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
