//! Transaction descriptors.
//!
//! A [`Transaction`] is the per-thread descriptor: it is created once per
//! thread by [`Stm::register_thread`] and reused for every transaction the
//! thread runs. It moves through [`Status`] as transactions start, commit and
//! abort; the read and write sets keep their allocations between runs.
//!
//! Design-specific access paths live in `wbetl`, `wbctl` and `wt`; this
//! module owns the state machine, validation, the shared parts of commit and
//! rollback, and the retry loops.

use crate::cm::CmState;
use crate::config::Design;
use crate::engine::Stm;
use crate::error::{AbortReason, StmError};
use crate::hooks::{CallbackContext, Callbacks, Event, SlotKey, Specific};
use crate::lock::LockWord;
use crate::rwset::{ReadSet, WriteSet};
use crate::stats::Stats;
use crate::trace::{debug_log, trace_log};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Where a descriptor is in its transaction's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No transaction started yet.
    Idle,
    /// Inside a transaction.
    Active,
    /// Last transaction committed.
    Committed,
    /// Last transaction was rolled back.
    Aborted,
}

/// Per-transaction hints, given to [`Transaction::start`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attributes {
    /// Application-chosen id, passed to callbacks.
    pub id: u64,
    /// The transaction will not store. No read set is kept and commit
    /// leaves the clock alone; a store aborts and the retry runs read-write.
    pub read_only: bool,
    /// Acquire locks on loads as well (priority policy).
    pub visible_reads: bool,
    /// [`Transaction::try_atomically`] returns the abort instead of retrying.
    pub no_retry: bool,
    /// Never extend the snapshot.
    pub no_extend: bool,
}

impl Attributes {
    /// Set the id passed to callbacks.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Hint that the transaction will not store.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Force visible reads for this transaction.
    pub fn with_visible_reads(mut self, visible_reads: bool) -> Self {
        self.visible_reads = visible_reads;
        self
    }

    /// Return the first abort from `try_atomically` instead of retrying.
    pub fn with_no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    /// Never extend the snapshot.
    pub fn with_no_extend(mut self, no_extend: bool) -> Self {
        self.no_extend = no_extend;
        self
    }
}

/// Word behind a raw address.
///
/// # Safety
///
/// `addr` must be word aligned and stay valid while the returned reference is used.
#[inline]
pub(crate) unsafe fn word<'a>(addr: usize) -> &'a AtomicUsize {
    debug_assert_eq!(addr % align_of::<usize>(), 0, "unaligned word access");
    unsafe { &*(addr as *const AtomicUsize) }
}

/// A thread's transaction descriptor.
///
/// The lifetime ties the descriptor to its engine, and every [`TWord`](crate::TWord)
/// it touches must live at least as long. A descriptor stays on the thread
/// that registered it.
pub struct Transaction<'stm> {
    pub(crate) stm: &'stm Stm,
    pub(crate) tid: u32,
    status: Status,
    pub(crate) attr: Attributes,
    /// Effective read-only mode: the hint, unless a store forced read-write.
    pub(crate) read_only: bool,
    force_rw: bool,
    /// Clock value the snapshot was taken at.
    start: u64,
    /// Upper bound of the snapshot; moves forward on extension.
    pub(crate) end: u64,
    nesting: u32,
    pub(crate) r_set: ReadSet,
    pub(crate) w_set: WriteSet,
    pub(crate) cm: CmState,
    last_abort: Option<AbortReason>,
    specific: Specific,
    callbacks: Arc<Callbacks>,
    pub(crate) stats: Stats,
    _thread_bound: PhantomData<*mut ()>,
}

impl<'stm> Transaction<'stm> {
    pub(crate) fn new(stm: &'stm Stm, tid: u32) -> Self {
        let size = stm.config.initial_rw_set_size;
        Self {
            stm,
            tid,
            status: Status::Idle,
            attr: Attributes::default(),
            read_only: false,
            force_rw: false,
            start: 0,
            end: 0,
            nesting: 0,
            r_set: ReadSet::with_capacity(size),
            w_set: WriteSet::with_capacity(size),
            cm: CmState::new(tid, stm.config.backoff_min),
            last_abort: None,
            specific: Specific::default(),
            callbacks: stm.hooks.snapshot(),
            stats: Stats::default(),
            _thread_bound: PhantomData,
        }
    }

    /// Descriptor id, as stored in the lock words it owns.
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Where the descriptor is in its transaction's life.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Inside a transaction.
    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }

    /// The last transaction was rolled back.
    pub fn is_aborted(&self) -> bool {
        self.status == Status::Aborted
    }

    /// Reason of the most recent rollback.
    pub fn last_abort(&self) -> Option<AbortReason> {
        self.last_abort
    }

    /// Attributes of the current (or last) transaction.
    pub fn attributes(&self) -> Attributes {
        self.attr
    }

    /// Current nesting depth; 0 outside a transaction.
    pub fn nesting(&self) -> u32 {
        self.nesting
    }

    /// Snapshot bounds `(start, end)` of the current transaction.
    pub fn snapshot(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    /// Start a transaction, or enter a nested one if already active.
    ///
    /// Nested starts only bump the depth; `attr` is ignored for them.
    pub fn start(&mut self, attr: Attributes) {
        if self.status == Status::Active {
            self.nesting += 1;
            return;
        }
        let stm = self.stm;
        if stm.config.rollover {
            stm.quiesce
                .enter(&stm.clock, &stm.locks, stm.config.version_max);
        }
        stm.registry.owner(self.tid).clear_killed();
        self.r_set.clear();
        self.w_set.clear();
        self.attr = attr;
        self.read_only = attr.read_only && !self.force_rw;
        self.nesting = 1;
        self.status = Status::Active;
        self.start = stm.clock.read();
        self.end = self.start;
        trace_log!(tid = self.tid, start = self.start, read_only = self.read_only, "start");
        self.refresh_callbacks();
        self.fire(Event::Start, None);
    }

    /// Try to commit. `false` means the transaction was rolled back (or was
    /// not active) and must be restarted by the caller.
    pub fn commit(&mut self) -> bool {
        if self.status != Status::Active {
            return false;
        }
        if self.nesting > 1 {
            self.nesting -= 1;
            return true;
        }
        let stm = self.stm;
        if stm.registry.owner(self.tid).is_killed() {
            self.rollback(AbortReason::Killed);
            return false;
        }

        // Nothing written: the snapshot was consistent at `end`.
        if self.w_set.entries().iter().all(|e| e.mask == 0) {
            self.release_to_prior();
            self.finish_commit();
            return true;
        }

        if stm.config.design == Design::WriteBackCtl && self.acquire_commit_locks().is_err() {
            return false;
        }

        let ts = stm.next_version();
        self.stats.on_clock_increment();
        // Nobody committed since our snapshot when ts follows it directly.
        if ts != self.end + 1 && !self.validate() {
            debug_log!(tid = self.tid, ts, end = self.end, "commit validation failed");
            self.rollback(AbortReason::CommitValidation);
            return false;
        }

        if stm.config.design != Design::WriteThrough {
            self.write_back();
        }
        let released = LockWord::unowned(ts, 0);
        for entry in self.w_set.entries().iter().filter(|e| e.held) {
            stm.locks.release(entry.lock, released);
        }
        trace_log!(tid = self.tid, ts, writes = self.w_set.len(), "commit");
        self.finish_commit();
        true
    }

    /// Explicitly abort. Returns the error to propagate to the retry loop.
    pub fn abort(&mut self) -> StmError {
        match self.status {
            Status::Active => self.rollback(AbortReason::Explicit),
            Status::Aborted => self.pending_abort(),
            Status::Idle | Status::Committed => StmError::NotActive,
        }
    }

    /// Run `f` until it commits.
    ///
    /// Engine aborts returned from `f` (through `?` on any access) restart
    /// it. Any other error rolls the transaction back and panics; use
    /// [`Transaction::try_atomically`] to handle those.
    pub fn atomically<F, T>(&mut self, f: F) -> T
    where
        F: FnMut(&mut Self) -> Result<T, StmError>,
    {
        match self.try_atomically(Attributes::default(), f) {
            Ok(value) => value,
            Err(e) => panic!("transaction failed: {e}"),
        }
    }

    /// Run `f` with `attr` until it commits or fails with a non-abort error.
    ///
    /// With `attr.no_retry` the first abort is returned instead of retried.
    /// Called on an active descriptor, `f` runs as a nested transaction.
    pub fn try_atomically<F, T>(&mut self, attr: Attributes, mut f: F) -> Result<T, StmError>
    where
        F: FnMut(&mut Self) -> Result<T, StmError>,
    {
        if self.status == Status::Active {
            return self.nested(f);
        }
        loop {
            self.start(attr);
            match f(self) {
                Ok(value) => {
                    if self.commit() {
                        return Ok(value);
                    }
                }
                Err(StmError::Aborted(reason)) => {
                    if self.status == Status::Active {
                        self.rollback(reason);
                    }
                }
                Err(e) => {
                    if self.status == Status::Active {
                        self.rollback(AbortReason::Explicit);
                    }
                    return Err(e);
                }
            }
            if attr.no_retry {
                return Err(self.pending_abort());
            }
        }
    }

    /// Run `f` as a nested transaction of the active one.
    ///
    /// Nesting is flat: an abort inside `f` aborts the whole transaction and
    /// is returned so the outermost retry loop restarts it.
    pub fn nested<F, T>(&mut self, f: F) -> Result<T, StmError>
    where
        F: FnOnce(&mut Self) -> Result<T, StmError>,
    {
        self.check_active()?;
        self.start(self.attr);
        match f(self) {
            Ok(value) => {
                if self.commit() {
                    Ok(value)
                } else {
                    Err(self.pending_abort())
                }
            }
            Err(e) => {
                if self.status == Status::Active {
                    self.nesting -= 1;
                }
                Err(e)
            }
        }
    }

    /// Statistic by name.
    pub fn get_statistics(&self, name: &str) -> Option<u64> {
        let value = match name {
            "read_set_size" => self.r_set.capacity() as u64,
            "write_set_size" => self.w_set.capacity() as u64,
            "read_set_nb_entries" => self.r_set.len() as u64,
            "write_set_nb_entries" => self.w_set.len() as u64,
            "read_only" => u64::from(self.read_only),
            _ => return self.stats.get(name),
        };
        Some(value)
    }

    /// Specific data stored under `key`, if it has type `T`.
    pub fn get_specific<T: Any>(&self, key: SlotKey) -> Option<&T> {
        self.specific.get(key)
    }

    pub fn get_specific_mut<T: Any>(&mut self, key: SlotKey) -> Option<&mut T> {
        self.specific.get_mut(key)
    }

    /// Attach `value` to this descriptor under `key`.
    pub fn set_specific<T: Any + Send>(&mut self, key: SlotKey, value: T) {
        self.specific.set(key, value);
    }

    pub fn take_specific(&mut self, key: SlotKey) -> Option<Box<dyn Any + Send>> {
        self.specific.take(key)
    }

    /// Gate for every access: the transaction must be active and not killed.
    #[inline]
    pub(crate) fn check_active(&mut self) -> Result<(), StmError> {
        match self.status {
            Status::Active => {
                if self.stm.registry.owner(self.tid).is_killed() {
                    return Err(self.rollback(AbortReason::Killed));
                }
                Ok(())
            }
            Status::Aborted => Err(self.pending_abort()),
            Status::Idle | Status::Committed => Err(StmError::NotActive),
        }
    }

    fn pending_abort(&self) -> StmError {
        StmError::Aborted(self.last_abort.unwrap_or(AbortReason::Explicit))
    }

    /// Raw word load through the configured design.
    ///
    /// # Safety
    ///
    /// `addr` must be word aligned and valid for the rest of the transaction.
    pub(crate) unsafe fn load_word(&mut self, addr: usize) -> Result<usize, StmError> {
        self.check_active()?;
        trace_log!(tid = self.tid, addr, "load");
        match self.stm.config.design {
            Design::WriteBackCtl => unsafe { self.ctl_load(addr) },
            Design::WriteBackEtl | Design::WriteThrough => {
                if self.reads_visible() {
                    unsafe { self.etl_store(addr, 0, 0)? };
                }
                unsafe { self.etl_load(addr) }
            }
        }
    }

    /// Raw masked word store through the configured design.
    ///
    /// # Safety
    ///
    /// Same as [`Transaction::load_word`].
    pub(crate) unsafe fn store_word(
        &mut self,
        addr: usize,
        value: usize,
        mask: usize,
    ) -> Result<(), StmError> {
        self.check_active()?;
        trace_log!(tid = self.tid, addr, value, mask, "store");
        if self.read_only {
            return Err(self.rollback(AbortReason::ReadOnlyWrite));
        }
        match self.stm.config.design {
            Design::WriteBackCtl => {
                self.ctl_store(addr, value, mask);
                Ok(())
            }
            Design::WriteBackEtl | Design::WriteThrough => unsafe {
                self.etl_store(addr, value, mask)
            },
        }
    }

    /// Read `addr` under the unowned lock word `l`.
    ///
    /// `Ok(None)` means the lock moved underneath and the read must restart.
    /// A version past the snapshot is handled by extending it.
    ///
    /// # Safety
    ///
    /// Same as [`Transaction::load_word`].
    pub(crate) unsafe fn read_unowned(
        &mut self,
        addr: usize,
        lock: usize,
        l: LockWord,
    ) -> Result<Option<usize>, StmError> {
        let locks = &self.stm.locks;
        let value = unsafe { word(addr) }.load(Ordering::Acquire);
        if locks.load(lock) != l {
            return Ok(None);
        }
        if l.version() > self.end {
            if !self.extend() {
                return Err(self.rollback(AbortReason::ReadValidation));
            }
            if self.stm.locks.load(lock) != l {
                return Ok(None);
            }
        }
        if !self.read_only {
            self.r_set.push(lock, l);
        }
        Ok(Some(value))
    }

    /// Check that every lock in the read set still carries the word we saw.
    pub(crate) fn validate(&self) -> bool {
        let locks = &self.stm.locks;
        self.r_set.iter().all(|read| {
            let l = locks.load(read.lock);
            match l.owner() {
                Some(owner) if owner.tid == self.tid => {
                    self.w_set.is_head_of(owner.entry, read.lock)
                        && self.w_set.get(owner.entry).prior == read.word
                }
                Some(_) => false,
                None => l == read.word,
            }
        })
    }

    pub(crate) fn can_extend(&self) -> bool {
        self.stm.config.extension && !self.attr.no_extend && !self.read_only
    }

    /// Move the snapshot up to the current clock if the read set still holds.
    pub(crate) fn extend(&mut self) -> bool {
        if !self.can_extend() {
            return false;
        }
        let now = self.stm.clock.read();
        if !self.validate() {
            return false;
        }
        debug_log!(tid = self.tid, from = self.end, to = now, "snapshot extended");
        self.end = now;
        self.stats.on_extend();
        true
    }

    /// Undo the current attempt and record `reason`.
    ///
    /// Returns the error the failing operation hands back to its caller.
    pub(crate) fn rollback(&mut self, reason: AbortReason) -> StmError {
        debug_assert_eq!(self.status, Status::Active);
        if self.stm.config.design == Design::WriteThrough {
            self.undo_in_place();
        } else {
            self.release_to_prior();
        }
        self.r_set.clear();
        self.w_set.clear();
        match reason {
            AbortReason::WriteSetGrowth => {
                self.w_set.grow();
                tracing::debug!(
                    tid = self.tid,
                    capacity = self.w_set.capacity(),
                    "write set grown"
                );
            }
            AbortReason::ReadOnlyWrite => self.force_rw = true,
            _ => {}
        }
        self.nesting = 0;
        self.status = Status::Aborted;
        self.last_abort = Some(reason);
        self.leave_quiesce();
        self.stats.on_abort(reason);
        debug_log!(tid = self.tid, %reason, "rollback");
        self.fire(Event::Abort, Some(reason));
        self.contention_wait(reason);
        StmError::Aborted(reason)
    }

    /// Release every held lock to the word it replaced.
    fn release_to_prior(&self) {
        let locks = &self.stm.locks;
        for entry in self.w_set.entries().iter().filter(|e| e.held) {
            locks.release(entry.lock, entry.prior);
        }
    }

    /// Install buffered values. All locks are held.
    fn write_back(&self) {
        for entry in self.w_set.entries().iter().filter(|e| e.mask != 0) {
            // SAFETY: the address was valid when stored and the access
            // contract keeps it valid until the transaction ends.
            let cell = unsafe { word(entry.addr) };
            let value = if entry.mask == usize::MAX {
                entry.value
            } else {
                entry.apply(cell.load(Ordering::Relaxed))
            };
            cell.store(value, Ordering::Release);
        }
    }

    fn finish_commit(&mut self) {
        self.r_set.clear();
        self.w_set.clear();
        self.nesting = 0;
        self.status = Status::Committed;
        self.force_rw = false;
        self.leave_quiesce();
        self.contention_commit();
        self.stats.on_commit();
        self.fire(Event::Commit, None);
    }

    fn leave_quiesce(&self) {
        if self.stm.config.rollover {
            self.stm.quiesce.leave();
        }
    }

    /// Pick up callbacks registered since this descriptor last looked.
    fn refresh_callbacks(&mut self) {
        if self.stm.hooks.generation() != self.callbacks.generation {
            self.callbacks = self.stm.hooks.snapshot();
        }
    }

    /// Run the callbacks registered for `event`.
    pub(crate) fn fire(&mut self, event: Event, reason: Option<AbortReason>) {
        let callbacks = self.callbacks.for_event(event);
        if callbacks.is_empty() {
            return;
        }
        let mut ctx = CallbackContext {
            tid: self.tid,
            id: self.attr.id,
            reason,
            specific: &mut self.specific,
        };
        for callback in callbacks {
            callback(&mut ctx);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.status == Status::Active {
            self.rollback(AbortReason::Explicit);
        }
        self.refresh_callbacks();
        self.fire(Event::ThreadExit, None);
        self.specific.clear();
        self.stm.quiesce_check();
        self.stm.registry.free_tid(self.tid);
        tracing::debug!(
            tid = self.tid,
            commits = self.stats.get("nb_commits"),
            aborts = self.stats.get("nb_aborts"),
            "descriptor released"
        );
    }
}
