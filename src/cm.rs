//! Contention management.
//!
//! The manager runs exactly when a transaction finds the lock it needs owned
//! by another transaction, and once more after every rollback. It never
//! retries a transaction by itself: retries are driven by the caller
//! starting the transaction again.

use crate::error::{AbortReason, StmError};
use crate::lock::{LockWord, Owner};
use crate::trace::debug_log;
use crate::transaction::Transaction;
use core::fmt;
use core::hint::spin_loop;
use crossbeam_utils::Backoff;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Policy applied on lock conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ContentionPolicy {
    /// Abort immediately.
    #[default]
    Suicide = 0,
    /// Abort, then wait until the contended lock is released before retrying.
    Delay = 1,
    /// Abort, then spin for a random, exponentially growing number of iterations.
    Backoff = 2,
    /// Higher priority wins and waits; the loser aborts and gains priority.
    Priority = 3,
}

impl ContentionPolicy {
    /// Name reported by the `contention_manager` parameter.
    pub const fn name(self) -> &'static str {
        match self {
            ContentionPolicy::Suicide => "SUICIDE",
            ContentionPolicy::Delay => "DELAY",
            ContentionPolicy::Backoff => "BACKOFF",
            ContentionPolicy::Priority => "PRIORITY",
        }
    }

    /// Parse a policy name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        [
            ContentionPolicy::Suicide,
            ContentionPolicy::Delay,
            ContentionPolicy::Backoff,
            ContentionPolicy::Priority,
        ]
        .into_iter()
        .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ContentionPolicy::Delay,
            2 => ContentionPolicy::Backoff,
            3 => ContentionPolicy::Priority,
            _ => ContentionPolicy::Suicide,
        }
    }
}

impl fmt::Display for ContentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Contention-manager scratch state of one descriptor.
pub(crate) struct CmState {
    /// Current backoff window.
    backoff: u64,
    /// Lock that caused the last conflict abort (delay policy).
    contended: Option<usize>,
    /// Validation aborts since the last commit (visible reads).
    pub(crate) visible_reads: u64,
    /// Own priority; mirrored into the registry for other threads.
    priority: u64,
    rng: SmallRng,
}

impl CmState {
    pub(crate) fn new(tid: u32, backoff_min: u64) -> Self {
        Self {
            backoff: backoff_min,
            contended: None,
            visible_reads: 0,
            priority: 0,
            rng: SmallRng::seed_from_u64(0x9e37_79b9_7f4a_7c15 ^ u64::from(tid)),
        }
    }
}

impl Transaction<'_> {
    /// Called with the lock word `seen`, owned by someone else.
    ///
    /// `Ok(())` means the lock may have been released and the access should
    /// be retried; otherwise the transaction has been rolled back.
    pub(crate) fn resolve_conflict(
        &mut self,
        lock: usize,
        seen: LockWord,
        reason: AbortReason,
    ) -> Result<(), StmError> {
        debug_log!(tid = self.tid, lock, ?seen, %reason, "lock conflict");
        match self.stm.contention_manager() {
            ContentionPolicy::Suicide | ContentionPolicy::Backoff => Err(self.rollback(reason)),
            ContentionPolicy::Delay => {
                self.cm.contended = Some(lock);
                Err(self.rollback(reason))
            }
            ContentionPolicy::Priority => match seen.owner() {
                Some(owner) => self.priority_conflict(lock, seen, owner, reason),
                None => Ok(()),
            },
        }
    }

    fn priority_conflict(
        &mut self,
        lock: usize,
        seen: LockWord,
        owner: Owner,
        reason: AbortReason,
    ) -> Result<(), StmError> {
        let stm = self.stm;
        let registry = &stm.registry;
        let theirs = registry.owner(owner.tid).priority();
        let mine = self.cm.priority;
        let wins = mine > theirs || (mine == theirs && self.tid < owner.tid);
        if !wins {
            return Err(self.rollback(reason));
        }
        // Ranks only go down along a chain of waiters, so waiting cannot cycle.
        registry.owner(owner.tid).kill();
        let backoff = Backoff::new();
        while stm.locks.load(lock) == seen {
            if registry.owner(self.tid).is_killed() {
                return Err(self.rollback(AbortReason::Killed));
            }
            backoff.snooze();
        }
        Ok(())
    }

    /// Whether loads should take their lock like a write (priority policy).
    pub(crate) fn reads_visible(&self) -> bool {
        if self.read_only
            || !self.stm.config.design.locks_at_encounter()
            || self.stm.contention_manager() != ContentionPolicy::Priority
        {
            return false;
        }
        let threshold = self.stm.vr_threshold();
        self.attr.visible_reads || (threshold >= 0 && self.cm.visible_reads >= threshold as u64)
    }

    /// Policy work after a rollback, before control returns to the caller.
    pub(crate) fn contention_wait(&mut self, reason: AbortReason) {
        if reason.is_validation() {
            self.cm.visible_reads += 1;
        }
        match self.stm.contention_manager() {
            ContentionPolicy::Suicide => {}
            ContentionPolicy::Delay => {
                if let Some(lock) = self.cm.contended.take() {
                    let backoff = Backoff::new();
                    while self.stm.locks.load(lock).is_owned() {
                        backoff.snooze();
                    }
                }
            }
            ContentionPolicy::Backoff => {
                let spins = self.cm.rng.random_range(0..self.cm.backoff);
                for _ in 0..spins {
                    spin_loop();
                }
                if self.cm.backoff < self.stm.config.backoff_max {
                    self.cm.backoff = (self.cm.backoff * 2).min(self.stm.config.backoff_max);
                }
            }
            ContentionPolicy::Priority => {
                if reason.is_conflict() || reason == AbortReason::Killed {
                    self.cm.priority += 1;
                    self.stm.registry.owner(self.tid).set_priority(self.cm.priority);
                }
            }
        }
    }

    /// Reset policy state after a successful commit.
    pub(crate) fn contention_commit(&mut self) {
        self.cm.backoff = self.stm.config.backoff_min;
        self.cm.contended = None;
        self.cm.visible_reads = 0;
        if self.cm.priority != 0 {
            self.cm.priority = 0;
            self.stm.registry.owner(self.tid).set_priority(0);
        }
    }
}
