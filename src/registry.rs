//! Descriptor ids and the small piece of per-descriptor state other threads may read.
//!
//! Everything else in a descriptor is private to its thread. The priority
//! contention manager needs to compare its own priority against the owner of
//! a contended lock and to ask that owner to abort; those two fields live
//! here, indexed by the id stored in owned lock words.

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Shared view of one descriptor.
pub(crate) struct OwnerState {
    priority: AtomicU64,
    killed: AtomicBool,
}

impl OwnerState {
    fn new() -> Self {
        Self {
            priority: AtomicU64::new(0),
            killed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn priority(&self) -> u64 {
        self.priority.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_priority(&self, priority: u64) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// Ask the descriptor to abort at its next engine call.
    #[inline]
    pub(crate) fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn clear_killed(&self) {
        self.killed.store(false, Ordering::Relaxed);
    }
}

/// Id allocator plus the shared state table.
///
/// The table has one more row than allocatable ids: the last one stands for
/// unit stores, which own locks without a descriptor.
pub(crate) struct Registry {
    owners: Box<[CachePadded<OwnerState>]>,
    max_threads: u32,
    next_tid: AtomicU32,
    free_tids: Mutex<Vec<u32>>,
    live: AtomicU32,
}

impl Registry {
    pub(crate) fn new(max_threads: usize) -> Self {
        Self {
            owners: (0..=max_threads)
                .map(|_| CachePadded::new(OwnerState::new()))
                .collect(),
            max_threads: max_threads as u32,
            next_tid: AtomicU32::new(0),
            free_tids: Mutex::new(Vec::new()),
            live: AtomicU32::new(0),
        }
    }

    /// Allocate an id, preferring recycled ones.
    pub(crate) fn alloc_tid(&self) -> Option<u32> {
        let recycled = self.free_tids.lock().pop();
        let tid = match recycled {
            Some(tid) => tid,
            None => self
                .next_tid
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    (n < self.max_threads).then_some(n + 1)
                })
                .ok()?,
        };
        let owner = &self.owners[tid as usize];
        owner.set_priority(0);
        owner.clear_killed();
        self.live.fetch_add(1, Ordering::Relaxed);
        Some(tid)
    }

    /// Return an id for reuse.
    pub(crate) fn free_tid(&self, tid: u32) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.free_tids.lock().push(tid);
    }

    #[inline]
    pub(crate) fn owner(&self, tid: u32) -> &OwnerState {
        &self.owners[tid as usize]
    }

    /// Descriptors currently registered.
    pub(crate) fn live(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    /// Id used in lock words taken by unit stores.
    #[inline]
    pub(crate) fn unit_tid(&self) -> u32 {
        self.max_threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_recycled() {
        let reg = Registry::new(2);
        let a = reg.alloc_tid().unwrap();
        let b = reg.alloc_tid().unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.alloc_tid(), None);
        assert_eq!(reg.live(), 2);
        assert_eq!(reg.unit_tid(), 2);
        assert_eq!(reg.owner(reg.unit_tid()).priority(), 0);

        reg.owner(a).set_priority(9);
        reg.owner(a).kill();
        reg.free_tid(a);
        let c = reg.alloc_tid().unwrap();
        assert_eq!(c, a);
        // Recycled ids start clean.
        assert_eq!(reg.owner(c).priority(), 0);
        assert!(!reg.owner(c).is_killed());
    }
}
