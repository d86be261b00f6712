//! Commit-time locking.
//!
//! Stores are buffered without touching locks and found again through the
//! write set's address index. Locks are taken only inside commit, walking
//! the write set backwards; the first entry to take a lock becomes the head
//! of that lock's chain.

use crate::error::{AbortReason, StmError};
use crate::lock::{LockWord, Owner};
use crate::rwset::WriteEntry;
use crate::trace::trace_log;
use crate::transaction::Transaction;

impl Transaction<'_> {
    /// # Safety
    ///
    /// `addr` must be word aligned and valid for the rest of the transaction.
    pub(crate) unsafe fn ctl_load(&mut self, addr: usize) -> Result<usize, StmError> {
        let pending = self.w_set.lookup(addr);
        if let Some(idx) = pending {
            let entry = self.w_set.get(idx);
            if entry.mask == usize::MAX {
                return Ok(entry.value);
            }
        }
        let stm = self.stm;
        let lock = stm.locks.locate(addr);
        loop {
            let l = stm.locks.load(lock);
            if l.is_owned() {
                self.resolve_conflict(lock, l, AbortReason::ReadLocked)?;
                continue;
            }
            if let Some(value) = unsafe { self.read_unowned(addr, lock, l)? } {
                return Ok(match pending {
                    Some(idx) => self.w_set.get(idx).apply(value),
                    None => value,
                });
            }
        }
    }

    pub(crate) fn ctl_store(&mut self, addr: usize, value: usize, mask: usize) {
        match self.w_set.lookup(addr) {
            Some(idx) => self.w_set.get_mut(idx).merge(value, mask),
            None => {
                let lock = self.stm.locks.locate(addr);
                self.w_set.push_indexed(WriteEntry::new(addr, value, mask, lock));
            }
        }
    }

    /// Take every lock the write set covers.
    ///
    /// On a lost conflict the transaction is rolled back, which releases the
    /// locks taken so far.
    pub(crate) fn acquire_commit_locks(&mut self) -> Result<(), StmError> {
        let stm = self.stm;
        for idx in (0..self.w_set.len() as u32).rev() {
            let lock = self.w_set.get(idx).lock;
            loop {
                let l = stm.locks.load(lock);
                match l.owner() {
                    Some(owner) if owner.tid == self.tid => {
                        let prior = self.w_set.get(owner.entry).prior;
                        self.w_set.get_mut(idx).prior = prior;
                        self.w_set.link(owner.entry, idx);
                        break;
                    }
                    Some(_) => self.resolve_conflict(lock, l, AbortReason::WriteLocked)?,
                    None => {
                        let owned = LockWord::owned(Owner {
                            tid: self.tid,
                            entry: idx,
                        });
                        if stm.locks.try_acquire(lock, l, owned) {
                            let entry = self.w_set.get_mut(idx);
                            entry.prior = l;
                            entry.held = true;
                            trace_log!(tid = self.tid, lock, entry = idx, "commit lock acquired");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{Config, Design};
    use crate::error::{AbortReason, StmError};
    use crate::transaction::Attributes;
    use crate::typed::TWord;
    use crate::Stm;

    fn engine() -> Stm {
        Stm::new(
            Config::default()
                .with_design(Design::WriteBackCtl)
                .with_lock_table_bits(10)
                .with_initial_rw_set_size(2),
        )
        .unwrap()
    }

    #[test]
    fn stores_do_not_lock_until_commit() {
        let stm = engine();
        let w = TWord::new(1);
        let lock = stm.locks.locate(w.as_ptr() as usize);
        let mut tx = stm.register_thread().unwrap();
        tx.start(Attributes::default());
        tx.write(&w, 2).unwrap();
        tx.write_masked(&w, 0x30, 0xf0).unwrap();
        assert!(!stm.locks.load(lock).is_owned());
        assert_eq!(tx.read(&w), Ok(0x32));
        assert!(tx.commit());
        assert_eq!(w.load_unsynchronized(), 0x32);
        assert_eq!(stm.locks.load(lock).version(), stm.clock());
    }

    #[test]
    fn partial_pending_write_merges_with_memory() {
        let stm = engine();
        let w = TWord::new(0xaa00);
        let mut tx = stm.register_thread().unwrap();
        tx.start(Attributes::default());
        tx.write_masked(&w, 0x55, 0xff).unwrap();
        assert_eq!(tx.read(&w), Ok(0xaa55));
        assert!(tx.commit());
    }

    #[test]
    fn write_set_grows_in_place() {
        let stm = engine();
        let words: Vec<TWord> = (0..9).map(TWord::new).collect();
        let mut tx = stm.register_thread().unwrap();
        let mut attempts = 0;
        tx.atomically(|tx| {
            attempts += 1;
            for w in &words {
                let v = tx.read(w)?;
                tx.write(w, v * 10)?;
            }
            Ok(())
        });
        assert_eq!(attempts, 1);
        assert_eq!(tx.get_statistics("nb_aborts"), Some(0));
        for (i, w) in words.iter().enumerate() {
            assert_eq!(w.load_unsynchronized(), i * 10);
        }
    }

    #[test]
    fn stale_read_fails_commit_validation() {
        let stm = engine();
        let x = TWord::new(0);
        let y = TWord::new(0);
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();

        a.start(Attributes::default());
        assert_eq!(a.read(&x), Ok(0));
        b.atomically(|b| b.write(&x, 1));
        a.write(&y, 1).unwrap();
        assert!(!a.commit());
        assert_eq!(a.last_abort(), Some(AbortReason::CommitValidation));
        assert_eq!(y.load_unsynchronized(), 0);
        assert_eq!(
            a.read(&x),
            Err(StmError::Aborted(AbortReason::CommitValidation))
        );
    }
}
