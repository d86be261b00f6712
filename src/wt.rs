//! Write-through: stores go straight to memory under encounter-time locks,
//! and the write set keeps the overwritten words for rollback.
//!
//! Rolling back restores memory before releasing the locks. A reader may
//! have seen a value between our store and the restore, so a released lock
//! must not look unchanged: its incarnation is bumped instead of its
//! version, and only when the incarnation runs out does the clock move.

use crate::lock::{INCARNATION_MAX, LockWord};
use crate::rwset::WriteEntry;
use crate::transaction::{Transaction, word};
use std::sync::atomic::Ordering;

impl Transaction<'_> {
    /// # Safety
    ///
    /// `addr` must be word aligned and valid, and its lock held by the caller.
    pub(crate) unsafe fn write_in_place(addr: usize, value: usize, mask: usize) {
        if mask == 0 {
            return;
        }
        let cell = unsafe { word(addr) };
        let next = if mask == usize::MAX {
            value
        } else {
            (cell.load(Ordering::Relaxed) & !mask) | (value & mask)
        };
        cell.store(next, Ordering::Release);
    }

    /// Log the current word of `addr` for undo, then apply the store.
    ///
    /// # Safety
    ///
    /// Same as [`Transaction::write_in_place`].
    pub(crate) unsafe fn undo_entry(
        addr: usize,
        value: usize,
        mask: usize,
        lock: usize,
    ) -> WriteEntry {
        let old = unsafe { word(addr) }.load(Ordering::Relaxed);
        let mut entry = WriteEntry::new(addr, old, usize::MAX, lock);
        entry.mask = mask;
        unsafe { Self::write_in_place(addr, value, mask) };
        entry
    }

    /// Restore overwritten words and release every held lock.
    pub(crate) fn undo_in_place(&mut self) {
        let entries = self.w_set.entries();
        for entry in entries.iter().rev().filter(|e| e.mask != 0) {
            // SAFETY: the entry was created by a store whose address
            // contract lasts until the transaction ends.
            unsafe { word(entry.addr) }.store(entry.value, Ordering::Release);
        }
        let stm = self.stm;
        let mut bumped_clock = false;
        for (idx, entry) in entries.iter().enumerate().filter(|(_, e)| e.held) {
            let prior = entry.prior;
            let released = if !self.chain_written(idx as u32) {
                prior
            } else if prior.incarnation() < INCARNATION_MAX {
                LockWord::unowned(prior.version(), prior.incarnation() + 1)
            } else {
                bumped_clock = true;
                LockWord::unowned(stm.next_version(), 0)
            };
            stm.locks.release(entry.lock, released);
        }
        if bumped_clock {
            self.stats.on_clock_increment();
        }
    }

    /// Whether any entry in the chain starting at `head` wrote memory.
    fn chain_written(&self, head: u32) -> bool {
        let mut cur = Some(head);
        while let Some(idx) = cur {
            let entry = self.w_set.get(idx);
            if entry.mask != 0 {
                return true;
            }
            cur = entry.next;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{Config, Design};
    use crate::error::AbortReason;
    use crate::lock::INCARNATION_MAX;
    use crate::transaction::Attributes;
    use crate::typed::TWord;
    use crate::Stm;

    fn engine() -> Stm {
        Stm::new(
            Config::default()
                .with_design(Design::WriteThrough)
                .with_lock_table_bits(10),
        )
        .unwrap()
    }

    #[test]
    fn stores_are_visible_in_memory_before_commit() {
        let stm = engine();
        let w = TWord::new(0xab00);
        let mut tx = stm.register_thread().unwrap();
        tx.start(Attributes::default());
        tx.write_masked(&w, 0xcd, 0xff).unwrap();
        assert_eq!(w.load_unsynchronized(), 0xabcd);
        assert_eq!(tx.read(&w), Ok(0xabcd));
        assert!(tx.commit());
        assert_eq!(w.load_unsynchronized(), 0xabcd);
    }

    #[test]
    fn rollback_restores_and_bumps_incarnation() {
        let stm = engine();
        let w = TWord::new(3);
        let lock = stm.locks.locate(w.as_ptr() as usize);
        let mut tx = stm.register_thread().unwrap();
        let before = stm.locks.load(lock);

        tx.start(Attributes::default());
        tx.write(&w, 4).unwrap();
        tx.write(&w, 5).unwrap();
        tx.abort();

        assert_eq!(w.load_unsynchronized(), 3);
        let after = stm.locks.load(lock);
        assert!(!after.is_owned());
        assert_eq!(after.version(), before.version());
        assert_eq!(after.incarnation(), before.incarnation() + 1);
    }

    #[test]
    fn exhausted_incarnation_moves_the_clock() {
        let stm = engine();
        let w = TWord::new(0);
        let lock = stm.locks.locate(w.as_ptr() as usize);
        let mut tx = stm.register_thread().unwrap();
        for _ in 0..INCARNATION_MAX {
            tx.start(Attributes::default());
            tx.write(&w, 1).unwrap();
            tx.abort();
        }
        assert_eq!(stm.locks.load(lock).incarnation(), INCARNATION_MAX);
        let clock = stm.clock();

        tx.start(Attributes::default());
        tx.write(&w, 1).unwrap();
        tx.abort();
        let l = stm.locks.load(lock);
        assert_eq!(l.incarnation(), 0);
        assert_eq!(l.version(), clock + 1);
        assert_eq!(stm.clock(), clock + 1);
        assert_eq!(w.load_unsynchronized(), 0);
    }

    #[test]
    fn visible_read_release_keeps_lock_word() {
        let stm = engine();
        let w = TWord::new(8);
        let lock = stm.locks.locate(w.as_ptr() as usize);
        let before = stm.locks.load(lock);
        let mut tx = stm.register_thread().unwrap();
        tx.start(Attributes::default());
        // A zero-mask store only takes the lock.
        tx.write_masked(&w, 0, 0).unwrap();
        assert!(stm.locks.load(lock).is_owned());
        tx.abort();
        assert_eq!(stm.locks.load(lock), before);
    }

    #[test]
    fn read_racing_an_undone_store_retries() {
        let stm = engine();
        let w = TWord::new(3);
        let addr = w.as_ptr() as usize;
        let lock = stm.locks.locate(addr);
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();

        a.start(Attributes::default());
        // `a` has sampled the lock word and is about to read memory.
        let sampled = stm.locks.load(lock);
        b.start(Attributes::default());
        b.write(&w, 99).unwrap();
        let dirty = w.load_unsynchronized();
        assert_eq!(dirty, 99);
        b.abort();

        // Same version, but the lock word moved: the read must restart.
        assert_eq!(stm.locks.load(lock).version(), sampled.version());
        assert_ne!(stm.locks.load(lock), sampled);
        assert_eq!(unsafe { a.read_unowned(addr, lock, sampled) }, Ok(None));
        assert_eq!(a.read(&w), Ok(3));
        assert!(a.commit());
    }

    #[test]
    fn undone_store_invalidates_earlier_read() {
        let stm = engine();
        let words: Vec<TWord> = (0..64).map(|_| TWord::new(0)).collect();
        let (x, y, z) = (&words[0], &words[16], &words[32]);
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();

        a.start(Attributes::default());
        assert_eq!(a.read(x), Ok(0));
        assert!(a.validate());

        b.start(Attributes::default());
        b.write(x, 5).unwrap();
        b.abort();
        assert_eq!(x.load_unsynchronized(), 0);
        assert!(!a.validate());

        // An unrelated commit forces `a` to validate at commit time.
        b.atomically(|b| b.write(z, 1));
        a.write(y, 1).unwrap();
        assert!(!a.commit());
        assert_eq!(a.last_abort(), Some(AbortReason::CommitValidation));
        assert_eq!(y.load_unsynchronized(), 0);
    }
}
