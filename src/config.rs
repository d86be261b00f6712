//! Engine configuration.
//!
//! A [`Config`] is fixed when the [`Stm`](crate::Stm) is built, except for the
//! few knobs exposed through [`Stm::set_parameter`](crate::Stm::set_parameter).

use crate::cm::ContentionPolicy;
use crate::error::StmError;
use crate::lock::{MAX_OWNER_ID, VERSION_CAPACITY};
use core::fmt;

/// Lock-encoding and update-timing design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Design {
    /// Write-back, locks acquired at the first write (encounter time).
    /// Lock words point at the owner's write-set entry.
    #[default]
    WriteBackEtl,
    /// Write-back, locks acquired only while committing.
    WriteBackCtl,
    /// Write-through: memory is updated in place under the lock, with an undo log.
    WriteThrough,
}

impl Design {
    /// Name reported by the `design` parameter.
    pub const fn name(self) -> &'static str {
        match self {
            Design::WriteBackEtl => "WRITE-BACK (ETL)",
            Design::WriteBackCtl => "WRITE-BACK (CTL)",
            Design::WriteThrough => "WRITE-THROUGH",
        }
    }

    /// Whether lock words are held between the first write and commit.
    pub(crate) const fn locks_at_encounter(self) -> bool {
        !matches!(self, Design::WriteBackCtl)
    }
}

impl fmt::Display for Design {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameter value, as read or written through the string-keyed interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    /// Integer-valued parameter.
    Int(i64),
    /// Boolean switch.
    Bool(bool),
    /// Name-valued parameter (design, contention manager).
    Text(String),
}

impl Parameter {
    /// Integer value, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Parameter::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value, if this is a `Text`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Parameter::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Default number of lock table entries, as a power of two.
pub const DEFAULT_LOCK_TABLE_BITS: u32 = 20;
/// Extra address bits dropped before hashing: 2^N consecutive words share a lock.
pub const DEFAULT_LOCK_SHIFT_EXTRA: u32 = 2;
/// Default initial capacity of the read and write sets.
pub const DEFAULT_RW_SET_SIZE: usize = 4096;
/// Validation aborts before reads become visible (priority policy).
pub const DEFAULT_VR_THRESHOLD: i64 = 3;
/// Default descriptor limit.
pub const DEFAULT_MAX_THREADS: usize = 1024;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Update design.
    pub design: Design,
    /// Policy applied when a lock is found owned by another transaction.
    pub contention_manager: ContentionPolicy,
    /// Lock table holds `1 << lock_table_bits` entries.
    pub lock_table_bits: u32,
    /// Extra low address bits ignored when hashing addresses to locks.
    pub lock_shift_extra: u32,
    /// Initial read/write set capacity per descriptor.
    pub initial_rw_set_size: usize,
    /// Reset the clock when it reaches `version_max` instead of aborting the process.
    pub rollover: bool,
    /// Largest clock value a transaction may start from.
    pub version_max: u64,
    /// Allow snapshot extension on newer versions.
    pub extension: bool,
    /// Maximum number of live descriptors.
    pub max_threads: usize,
    /// Lower bound of the randomised backoff window, in spin iterations.
    pub backoff_min: u64,
    /// Upper bound of the randomised backoff window, in spin iterations.
    pub backoff_max: u64,
    /// Validation aborts before loads acquire locks (priority policy); negative disables.
    pub vr_threshold: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            design: Design::default(),
            contention_manager: ContentionPolicy::default(),
            lock_table_bits: DEFAULT_LOCK_TABLE_BITS,
            lock_shift_extra: DEFAULT_LOCK_SHIFT_EXTRA,
            initial_rw_set_size: DEFAULT_RW_SET_SIZE,
            rollover: true,
            version_max: VERSION_CAPACITY - DEFAULT_MAX_THREADS as u64,
            extension: true,
            max_threads: DEFAULT_MAX_THREADS,
            backoff_min: 0x4,
            backoff_max: 0x10000,
            vr_threshold: DEFAULT_VR_THRESHOLD,
        }
    }
}

impl Config {
    /// Use `design` for updates.
    pub fn with_design(mut self, design: Design) -> Self {
        self.design = design;
        self
    }

    /// Use `policy` on lock conflicts.
    pub fn with_contention_manager(mut self, policy: ContentionPolicy) -> Self {
        self.contention_manager = policy;
        self
    }

    /// Size the lock table to `1 << bits` entries.
    pub fn with_lock_table_bits(mut self, bits: u32) -> Self {
        self.lock_table_bits = bits;
        self
    }

    /// Initial read/write set capacity.
    pub fn with_initial_rw_set_size(mut self, size: usize) -> Self {
        self.initial_rw_set_size = size;
        self
    }

    /// Enable or disable clock roll-over, resetting at `version_max`.
    pub fn with_rollover(mut self, rollover: bool, version_max: u64) -> Self {
        self.rollover = rollover;
        self.version_max = version_max;
        self
    }

    /// Enable or disable snapshot extension.
    pub fn with_extension(mut self, extension: bool) -> Self {
        self.extension = extension;
        self
    }

    /// Cap the number of live descriptors.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Backoff window bounds, in spin iterations.
    pub fn with_backoff(mut self, min: u64, max: u64) -> Self {
        self.backoff_min = min;
        self.backoff_max = max;
        self
    }

    /// Visible-read threshold for the priority policy.
    pub fn with_vr_threshold(mut self, threshold: i64) -> Self {
        self.vr_threshold = threshold;
        self
    }

    /// Check the configuration for values the engine cannot honour.
    pub fn validate(&self) -> Result<(), StmError> {
        if !(1..=30).contains(&self.lock_table_bits) {
            return Err(StmError::InvalidConfig(format!(
                "lock_table_bits must be within 1..=30, got {}",
                self.lock_table_bits
            )));
        }
        if self.lock_shift_extra > 16 {
            return Err(StmError::InvalidConfig(format!(
                "lock_shift_extra must be at most 16, got {}",
                self.lock_shift_extra
            )));
        }
        if self.initial_rw_set_size == 0 {
            return Err(StmError::InvalidConfig(
                "initial_rw_set_size must be non-zero".to_string(),
            ));
        }
        if self.max_threads == 0 || self.max_threads > MAX_OWNER_ID as usize {
            return Err(StmError::InvalidConfig(format!(
                "max_threads must be within 1..={}, got {}",
                MAX_OWNER_ID, self.max_threads
            )));
        }
        // Each descriptor may commit once past `version_max` before reaching a fence.
        let headroom = self.max_threads as u64;
        if self.version_max == 0 || self.version_max > VERSION_CAPACITY - headroom {
            return Err(StmError::InvalidConfig(format!(
                "version_max must be within 1..={}, got {}",
                VERSION_CAPACITY - headroom,
                self.version_max
            )));
        }
        if self.backoff_min == 0 || self.backoff_min > self.backoff_max {
            return Err(StmError::InvalidConfig(format!(
                "backoff window {}..{} is empty",
                self.backoff_min, self.backoff_max
            )));
        }
        Ok(())
    }
}
