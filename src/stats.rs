//! Per-descriptor counters.
//!
//! Counters are plain integers: a descriptor is only touched by its own
//! thread. They survive across transactions and are reset only when the
//! descriptor is released.

use crate::error::AbortReason;

const ABORT_PREFIX: &str = "nb_aborts_";

#[derive(Debug, Default, Clone)]
pub(crate) struct Stats {
    commits: u64,
    aborts: u64,
    aborts_by: [u64; AbortReason::ALL.len()],
    extensions: u64,
    /// Consecutive aborts of the current transaction.
    retries: u64,
    max_retries: u64,
    clock_increments: u64,
}

impl Stats {
    #[inline]
    pub(crate) fn on_commit(&mut self) {
        self.commits += 1;
        self.max_retries = self.max_retries.max(self.retries);
        self.retries = 0;
    }

    #[inline]
    pub(crate) fn on_abort(&mut self, reason: AbortReason) {
        self.aborts += 1;
        self.aborts_by[reason.index()] += 1;
        self.retries += 1;
    }

    #[inline]
    pub(crate) fn on_extend(&mut self) {
        self.extensions += 1;
    }

    #[inline]
    pub(crate) fn on_clock_increment(&mut self) {
        self.clock_increments += 1;
    }

    /// Counter by name; `None` for names not tracked here.
    pub(crate) fn get(&self, name: &str) -> Option<u64> {
        if let Some(reason) = name.strip_prefix(ABORT_PREFIX) {
            return AbortReason::ALL
                .iter()
                .find(|r| r.name() == reason)
                .map(|r| self.aborts_by[r.index()]);
        }
        let value = match name {
            "nb_commits" => self.commits,
            "nb_aborts" => self.aborts,
            "nb_extensions" => self.extensions,
            "max_retries" => self.max_retries.max(self.retries),
            "nb_clock_increments" => self.clock_increments,
            _ => return None,
        };
        Some(value)
    }
}
