//! Global version clock and the roll-over barrier.
//!
//! The clock is bumped once per committing update transaction; the value it
//! returns is installed into every lock the commit releases. When roll-over
//! is enabled and the clock reaches `version_max`, the next thread to reach
//! a fence (transaction start, descriptor release) waits for all active
//! transactions to drain, then zeroes the clock and the whole lock table.
//!
//! A thread that already has an active transaction keeps the barrier open
//! itself, so it never waits at a fence: its further starts and unit stores
//! go through, and the reset happens once its transactions are done.

use crate::lock::LockTable;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

thread_local! {
    /// Transactions the current thread has entered and not yet left, on any engine.
    static ENTERED: Cell<usize> = const { Cell::new(0) };
}

fn entered_here() -> usize {
    ENTERED.with(Cell::get)
}

/// Monotonic commit counter.
pub(crate) struct Clock {
    now: CachePadded<AtomicU64>,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            now: CachePadded::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    pub(crate) fn read(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    /// Add one and return the new value.
    #[inline]
    pub(crate) fn increment(&self) -> u64 {
        self.now.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn reset(&self) {
        self.now.store(0, Ordering::SeqCst);
    }
}

/// Barrier used to reset the clock once every active transaction has drained.
pub(crate) struct Quiesce {
    /// Transactions between `enter` and `leave`.
    active: CachePadded<AtomicUsize>,
    /// Set while a reset is pending or running.
    resetting: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    rollovers: AtomicU64,
}

impl Quiesce {
    pub(crate) fn new() -> Self {
        Self {
            active: CachePadded::new(AtomicUsize::new(0)),
            resetting: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            rollovers: AtomicU64::new(0),
        }
    }

    /// Number of completed resets.
    pub(crate) fn rollovers(&self) -> u64 {
        self.rollovers.load(Ordering::Relaxed)
    }

    /// Register an outermost transaction start; blocks while a reset is due or running.
    ///
    /// Never blocks on a thread that is already inside a transaction: no reset
    /// can run until that transaction leaves.
    pub(crate) fn enter(&self, clock: &Clock, locks: &LockTable, version_max: u64) {
        ENTERED.with(|n| n.set(n.get() + 1));
        if entered_here() > 1 {
            self.active.fetch_add(1, Ordering::SeqCst);
            return;
        }
        loop {
            if clock.read() >= version_max {
                self.rollover(clock, locks, version_max);
                continue;
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            if !self.resetting.load(Ordering::SeqCst) {
                return;
            }
            // A reset started between our clock check and registration: step back.
            self.release();
            self.wait_reset();
        }
    }

    /// Unregister a transaction that committed or aborted.
    pub(crate) fn leave(&self) {
        ENTERED.with(|n| n.set(n.get().saturating_sub(1)));
        self.release();
    }

    fn release(&self) {
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "quiesce leave without enter");
        if prev == 1 && self.resetting.load(Ordering::SeqCst) {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    /// Fence check for a thread outside transactions; a no-op inside one.
    pub(crate) fn check(&self, clock: &Clock, locks: &LockTable, version_max: u64) {
        if entered_here() == 0 && clock.read() >= version_max {
            self.rollover(clock, locks, version_max);
        }
    }

    fn wait_reset(&self) {
        let mut guard = self.lock.lock();
        while self.resetting.load(Ordering::SeqCst) {
            self.cond.wait(&mut guard);
        }
    }

    fn rollover(&self, clock: &Clock, locks: &LockTable, version_max: u64) {
        let mut guard = self.lock.lock();
        if clock.read() < version_max {
            // Someone else already reset it.
            return;
        }
        self.resetting.store(true, Ordering::SeqCst);
        tracing::debug!(
            active = self.active.load(Ordering::SeqCst),
            "clock reached version_max, waiting for active transactions"
        );
        while self.active.load(Ordering::SeqCst) != 0 && clock.read() >= version_max {
            self.cond.wait(&mut guard);
        }
        if clock.read() >= version_max {
            // No transaction is active, so no lock is owned.
            locks.reset();
            clock.reset();
            let n = self.rollovers.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::info!(rollovers = n, "clock rolled over");
        }
        self.resetting.store(false, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn increment_returns_new_value() {
        let clock = Clock::new();
        assert_eq!(clock.read(), 0);
        assert_eq!(clock.increment(), 1);
        assert_eq!(clock.increment(), 2);
        assert_eq!(clock.read(), 2);
    }

    #[test]
    fn enter_below_max_does_not_reset() {
        let clock = Clock::new();
        let locks = LockTable::new(4, 0);
        let q = Quiesce::new();
        clock.increment();
        q.enter(&clock, &locks, 10);
        q.leave();
        assert_eq!(clock.read(), 1);
        assert_eq!(q.rollovers(), 0);
    }

    #[test]
    fn enter_at_max_resets_when_idle() {
        let clock = Clock::new();
        let locks = LockTable::new(4, 0);
        let q = Quiesce::new();
        for _ in 0..10 {
            clock.increment();
        }
        q.enter(&clock, &locks, 10);
        assert_eq!(clock.read(), 0);
        assert_eq!(q.rollovers(), 1);
        q.leave();
    }

    #[test]
    fn second_enter_on_active_thread_does_not_wait() {
        let clock = Clock::new();
        let locks = LockTable::new(4, 0);
        let q = Quiesce::new();
        q.enter(&clock, &locks, 3);
        for _ in 0..5 {
            clock.increment();
        }
        // Past the limit, but this thread holds the barrier open.
        q.enter(&clock, &locks, 3);
        q.check(&clock, &locks, 3);
        q.leave();
        assert_eq!(q.rollovers(), 0);
        assert_eq!(clock.read(), 5);
        q.leave();

        q.check(&clock, &locks, 3);
        assert_eq!(q.rollovers(), 1);
        assert_eq!(clock.read(), 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn reset_waits_for_active_transaction() {
        let clock = Arc::new(Clock::new());
        let locks = Arc::new(LockTable::new(4, 0));
        let q = Arc::new(Quiesce::new());

        // One transaction is active when the clock crosses the limit.
        q.enter(&clock, &locks, 5);
        for _ in 0..5 {
            clock.increment();
        }

        let waiter = {
            let (clock, locks, q) = (clock.clone(), locks.clone(), q.clone());
            thread::spawn(move || {
                q.enter(&clock, &locks, 5);
                let seen = clock.read();
                q.leave();
                seen
            })
        };

        // Still active: the reset cannot have happened yet.
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(q.rollovers(), 0);
        assert_eq!(clock.read(), 5);

        q.leave();
        assert_eq!(waiter.join().unwrap(), 0);
        assert_eq!(q.rollovers(), 1);
    }
}
