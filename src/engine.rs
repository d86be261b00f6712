//! The engine context: clock, lock table, descriptor registry and hooks.

use crate::clock::{Clock, Quiesce};
use crate::cm::ContentionPolicy;
use crate::config::{Config, Parameter};
use crate::error::StmError;
use crate::hooks::{Callback, CallbackContext, Event, Hooks, SlotKey};
use crate::lock::{LockTable, VERSION_CAPACITY};
use crate::registry::Registry;
use crate::transaction::Transaction;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

/// A software transactional memory engine.
///
/// Building one allocates the lock table and the clock; dropping it releases
/// them. Threads take part through a [`Transaction`] descriptor obtained from
/// [`Stm::register_thread`].
///
/// # Example
///
/// ```
/// use wordstm::{Stm, TWord};
///
/// let stm = Stm::default();
/// let counter = TWord::new(10);
/// let mut tx = stm.register_thread().unwrap();
///
/// tx.atomically(|tx| {
///     let v = tx.read(&counter)?;
///     tx.write(&counter, v + 1)
/// });
/// assert_eq!(counter.load_unsynchronized(), 11);
/// ```
pub struct Stm {
    pub(crate) config: Config,
    pub(crate) clock: Clock,
    pub(crate) quiesce: Quiesce,
    pub(crate) locks: LockTable,
    pub(crate) registry: Registry,
    pub(crate) hooks: Hooks,
    policy: AtomicU8,
    vr_threshold: AtomicI64,
}

impl Stm {
    /// Validate `config` and build an engine.
    pub fn new(config: Config) -> Result<Self, StmError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: Config) -> Self {
        let stm = Self {
            clock: Clock::new(),
            quiesce: Quiesce::new(),
            locks: LockTable::new(config.lock_table_bits, config.lock_shift_extra),
            registry: Registry::new(config.max_threads),
            hooks: Hooks::new(),
            policy: AtomicU8::new(config.contention_manager as u8),
            vr_threshold: AtomicI64::new(config.vr_threshold),
            config,
        };
        tracing::info!(
            design = %stm.config.design,
            contention_manager = %stm.config.contention_manager,
            locks = stm.locks.len(),
            rollover = stm.config.rollover,
            "stm engine initialized"
        );
        stm
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Allocate a descriptor for the calling thread.
    ///
    /// A thread may hold several descriptors and run transactions on one
    /// while another is active; they only conflict through the locks.
    pub fn register_thread(&self) -> Result<Transaction<'_>, StmError> {
        let tid = self
            .registry
            .alloc_tid()
            .ok_or(StmError::TooManyThreads {
                max: self.config.max_threads,
            })?;
        let mut tx = Transaction::new(self, tid);
        tx.fire(Event::ThreadInit, None);
        tracing::debug!(tid, "descriptor registered");
        Ok(tx)
    }

    /// Run `f` atomically on a short-lived descriptor.
    ///
    /// Registering a descriptor takes a lock; threads running many
    /// transactions should keep one from [`Stm::register_thread`] instead.
    /// Safe to call while the thread has another transaction active.
    pub fn atomically<'stm, F, T>(&'stm self, f: F) -> T
    where
        F: FnMut(&mut Transaction<'stm>) -> Result<T, StmError>,
    {
        match self.register_thread() {
            Ok(mut tx) => tx.atomically(f),
            Err(e) => panic!("cannot register transaction descriptor: {e}"),
        }
    }

    /// Current clock value.
    pub fn clock(&self) -> u64 {
        self.clock.read()
    }

    /// Completed clock roll-overs.
    pub fn rollovers(&self) -> u64 {
        self.quiesce.rollovers()
    }

    /// Descriptors currently registered.
    pub fn live_threads(&self) -> usize {
        self.registry.live() as usize
    }

    /// Policy in force for new conflicts.
    pub fn contention_manager(&self) -> ContentionPolicy {
        ContentionPolicy::from_u8(self.policy.load(Ordering::Relaxed))
    }

    pub(crate) fn vr_threshold(&self) -> i64 {
        self.vr_threshold.load(Ordering::Relaxed)
    }

    /// Read a parameter by name.
    pub fn get_parameter(&self, name: &str) -> Option<Parameter> {
        let c = &self.config;
        let value = match name {
            "design" => Parameter::Text(c.design.name().to_string()),
            "contention_manager" => Parameter::Text(self.contention_manager().name().to_string()),
            "lock_table_size" => Parameter::Int(self.locks.len() as i64),
            "initial_rw_set_size" => Parameter::Int(c.initial_rw_set_size as i64),
            "vr_threshold" => Parameter::Int(self.vr_threshold()),
            "version_max" => Parameter::Int(c.version_max.min(i64::MAX as u64) as i64),
            "rollover" => Parameter::Bool(c.rollover),
            "extension" => Parameter::Bool(c.extension),
            "max_threads" => Parameter::Int(c.max_threads as i64),
            "backoff_min" => Parameter::Int(c.backoff_min as i64),
            "backoff_max" => Parameter::Int(c.backoff_max as i64),
            _ => return None,
        };
        Some(value)
    }

    /// Change a runtime parameter: `contention_manager` (by name) or `vr_threshold`.
    pub fn set_parameter(&self, name: &str, value: Parameter) -> Result<(), StmError> {
        match (name, value) {
            ("contention_manager", Parameter::Text(policy)) => {
                let policy = ContentionPolicy::from_name(&policy).ok_or_else(|| {
                    StmError::InvalidConfig(format!("unknown contention manager '{policy}'"))
                })?;
                self.policy.store(policy as u8, Ordering::Relaxed);
                tracing::info!(%policy, "contention manager changed");
                Ok(())
            }
            ("vr_threshold", Parameter::Int(threshold)) => {
                self.vr_threshold.store(threshold, Ordering::Relaxed);
                Ok(())
            }
            ("contention_manager" | "vr_threshold", other) => Err(StmError::InvalidConfig(
                format!("wrong value type for '{name}': {other:?}"),
            )),
            _ => Err(StmError::UnknownParameter(name.to_string())),
        }
    }

    /// Reserve a specific-data slot for a collaborator.
    pub fn create_slot(&self) -> Result<SlotKey, StmError> {
        self.hooks.create_slot()
    }

    /// Run `f` at `event` on every descriptor registered from now on.
    pub fn register_callback<F>(&self, event: Event, f: F)
    where
        F: Fn(&mut CallbackContext<'_>) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(f);
        self.hooks.register(event, callback);
    }

    /// Shorthand for [`Event::ThreadInit`] callbacks.
    pub fn on_thread_init<F>(&self, f: F)
    where
        F: Fn(&mut CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.register_callback(Event::ThreadInit, f);
    }

    /// Shorthand for [`Event::ThreadExit`] callbacks.
    pub fn on_thread_exit<F>(&self, f: F)
    where
        F: Fn(&mut CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.register_callback(Event::ThreadExit, f);
    }

    /// Shorthand for [`Event::Start`] callbacks.
    pub fn on_start<F>(&self, f: F)
    where
        F: Fn(&mut CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.register_callback(Event::Start, f);
    }

    /// Shorthand for [`Event::Commit`] callbacks.
    pub fn on_commit<F>(&self, f: F)
    where
        F: Fn(&mut CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.register_callback(Event::Commit, f);
    }

    /// Shorthand for [`Event::Abort`] callbacks.
    pub fn on_abort<F>(&self, f: F)
    where
        F: Fn(&mut CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.register_callback(Event::Abort, f);
    }

    /// Take the next commit version.
    ///
    /// Past `version_max` without roll-over, versions can no longer be
    /// trusted and the process is aborted.
    pub(crate) fn next_version(&self) -> u64 {
        let ts = self.clock.increment();
        let limit = if self.config.rollover {
            VERSION_CAPACITY
        } else {
            self.config.version_max
        };
        if ts > limit {
            tracing::error!(
                clock = ts,
                limit,
                rollover = self.config.rollover,
                "version clock exhausted"
            );
            std::process::abort();
        }
        ts
    }

    /// Fence for callers outside any transaction.
    pub(crate) fn quiesce_check(&self) {
        if self.config.rollover {
            self.quiesce
                .check(&self.clock, &self.locks, self.config.version_max);
        }
    }
}

impl Default for Stm {
    fn default() -> Self {
        Self::build(Config::default())
    }
}

impl Drop for Stm {
    fn drop(&mut self) {
        tracing::info!(
            clock = self.clock.read(),
            rollovers = self.quiesce.rollovers(),
            "stm engine shut down"
        );
    }
}
