//! Encounter-time locking.
//!
//! A store takes the word's lock as soon as it is issued and keeps it until
//! commit or rollback. The write-back design buffers the value in the write
//! set; the write-through design (see `wt`) writes memory directly and keeps
//! the old word for undo. Both share the lock handling here.
//!
//! The owned lock word names the write-set entry that acquired it; further
//! words covered by the same lock hang off that entry through `next`.

use crate::config::Design;
use crate::error::{AbortReason, StmError};
use crate::lock::{LockWord, Owner};
use crate::rwset::WriteEntry;
use crate::trace::trace_log;
use crate::transaction::{Transaction, word};
use std::sync::atomic::Ordering;

impl Transaction<'_> {
    /// # Safety
    ///
    /// `addr` must be word aligned and valid for the rest of the transaction.
    pub(crate) unsafe fn etl_load(&mut self, addr: usize) -> Result<usize, StmError> {
        let stm = self.stm;
        let lock = stm.locks.locate(addr);
        loop {
            let l = stm.locks.load(lock);
            match l.owner() {
                Some(owner) if owner.tid == self.tid => {
                    return Ok(unsafe { self.load_owned(addr, owner.entry) });
                }
                Some(_) => self.resolve_conflict(lock, l, AbortReason::ReadLocked)?,
                None => {
                    if let Some(value) = unsafe { self.read_unowned(addr, lock, l)? } {
                        return Ok(value);
                    }
                }
            }
        }
    }

    /// Load a word whose lock we hold; `head` is the entry that took it.
    unsafe fn load_owned(&self, addr: usize, head: u32) -> usize {
        let current = unsafe { word(addr) }.load(Ordering::Acquire);
        if self.stm.config.design == Design::WriteThrough {
            return current;
        }
        match self.w_set.find_in_chain(head, addr) {
            Some(idx) => self.w_set.get(idx).apply(current),
            None => current,
        }
    }

    /// Store `value` into the bits of `addr` selected by `mask`.
    ///
    /// A zero mask only acquires the lock (visible read).
    ///
    /// # Safety
    ///
    /// Same as [`Transaction::etl_load`].
    pub(crate) unsafe fn etl_store(
        &mut self,
        addr: usize,
        value: usize,
        mask: usize,
    ) -> Result<(), StmError> {
        let stm = self.stm;
        let lock = stm.locks.locate(addr);
        loop {
            let l = stm.locks.load(lock);
            if let Some(owner) = l.owner() {
                if owner.tid == self.tid {
                    return unsafe { self.store_owned(addr, value, mask, lock, owner.entry) };
                }
                self.resolve_conflict(lock, l, AbortReason::WriteLocked)?;
                continue;
            }
            // A newer version is only acceptable if our snapshot can move up to it.
            if l.version() > self.end && !self.extend() {
                return Err(self.rollback(AbortReason::WriteValidation));
            }
            // Owned lock words name entries by index, so the set cannot
            // grow while we hold locks.
            if self.w_set.is_full() {
                return Err(self.rollback(AbortReason::WriteSetGrowth));
            }
            let idx = self.w_set.len() as u32;
            let owned = LockWord::owned(Owner {
                tid: self.tid,
                entry: idx,
            });
            if !stm.locks.try_acquire(lock, l, owned) {
                continue;
            }
            let mut entry = unsafe { self.new_entry(addr, value, mask, lock) };
            entry.prior = l;
            entry.held = true;
            self.w_set.push(entry);
            trace_log!(tid = self.tid, lock, entry = idx, "lock acquired");
            return Ok(());
        }
    }

    /// Store into a word covered by a lock we already hold.
    unsafe fn store_owned(
        &mut self,
        addr: usize,
        value: usize,
        mask: usize,
        lock: usize,
        head: u32,
    ) -> Result<(), StmError> {
        if let Some(idx) = self.w_set.find_in_chain(head, addr) {
            if self.stm.config.design == Design::WriteThrough {
                unsafe { Self::write_in_place(addr, value, mask) };
                self.w_set.get_mut(idx).mask |= mask;
            } else {
                self.w_set.get_mut(idx).merge(value, mask);
            }
            return Ok(());
        }
        if self.w_set.is_full() {
            return Err(self.rollback(AbortReason::WriteSetGrowth));
        }
        let mut entry = unsafe { self.new_entry(addr, value, mask, lock) };
        entry.prior = self.w_set.get(head).prior;
        let idx = self.w_set.push(entry);
        self.w_set.link(head, idx);
        Ok(())
    }

    /// Write-set entry for a first store to `addr`; the lock is held.
    unsafe fn new_entry(&self, addr: usize, value: usize, mask: usize, lock: usize) -> WriteEntry {
        if self.stm.config.design == Design::WriteThrough {
            unsafe { Self::undo_entry(addr, value, mask, lock) }
        } else {
            WriteEntry::new(addr, value, mask, lock)
        }
    }
}
