//! Lifecycle callbacks and per-transaction specific data.
//!
//! Collaborators (allocators, loggers, statistics) register callbacks once,
//! before descriptors are created, and attach their own state to a
//! descriptor through a [`SlotKey`] without the engine knowing its type.

use crate::error::{AbortReason, StmError};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Number of specific-data slots per descriptor.
pub const MAX_SPECIFIC: usize = 7;

/// Handle to a specific-data slot, shared by all descriptors of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey(usize);

/// Points in a descriptor's life where callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Descriptor registered.
    ThreadInit,
    /// Descriptor released.
    ThreadExit,
    /// Outermost transaction (re)started.
    Start,
    /// Outermost transaction committed.
    Commit,
    /// Transaction rolled back.
    Abort,
}

/// Callback registered with [`Stm::register_callback`](crate::Stm::register_callback).
pub type Callback = Arc<dyn Fn(&mut CallbackContext<'_>) + Send + Sync>;

/// What a callback sees of the descriptor it runs on.
pub struct CallbackContext<'a> {
    pub(crate) tid: u32,
    pub(crate) id: u64,
    pub(crate) reason: Option<AbortReason>,
    pub(crate) specific: &'a mut Specific,
}

impl CallbackContext<'_> {
    /// Descriptor id.
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Application id from the transaction's attributes.
    pub fn transaction_id(&self) -> u64 {
        self.id
    }

    /// Reason, for [`Event::Abort`] callbacks.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.reason
    }

    /// Specific data stored under `key`, if it has type `T`.
    pub fn get<T: Any>(&self, key: SlotKey) -> Option<&T> {
        self.specific.get(key)
    }

    /// Mutable specific data stored under `key`, if it has type `T`.
    pub fn get_mut<T: Any>(&mut self, key: SlotKey) -> Option<&mut T> {
        self.specific.get_mut(key)
    }

    /// Store `value` under `key`, replacing what was there.
    pub fn set<T: Any + Send>(&mut self, key: SlotKey, value: T) {
        self.specific.set(key, value);
    }
}

/// Per-descriptor specific-data slots.
#[derive(Default)]
pub(crate) struct Specific {
    slots: [Option<Box<dyn Any + Send>>; MAX_SPECIFIC],
}

impl Specific {
    pub(crate) fn get<T: Any>(&self, key: SlotKey) -> Option<&T> {
        self.slots[key.0].as_deref()?.downcast_ref()
    }

    pub(crate) fn get_mut<T: Any>(&mut self, key: SlotKey) -> Option<&mut T> {
        self.slots[key.0].as_deref_mut()?.downcast_mut()
    }

    pub(crate) fn set<T: Any + Send>(&mut self, key: SlotKey, value: T) {
        self.slots[key.0] = Some(Box::new(value));
    }

    pub(crate) fn take(&mut self, key: SlotKey) -> Option<Box<dyn Any + Send>> {
        self.slots[key.0].take()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

/// Callbacks captured by a descriptor; refreshed at each outermost start.
#[derive(Default, Clone)]
pub(crate) struct Callbacks {
    /// Registrations that produced this list.
    pub(crate) generation: u64,
    thread_init: Vec<Callback>,
    thread_exit: Vec<Callback>,
    start: Vec<Callback>,
    commit: Vec<Callback>,
    abort: Vec<Callback>,
}

impl Callbacks {
    #[inline]
    pub(crate) fn for_event(&self, event: Event) -> &[Callback] {
        match event {
            Event::ThreadInit => &self.thread_init,
            Event::ThreadExit => &self.thread_exit,
            Event::Start => &self.start,
            Event::Commit => &self.commit,
            Event::Abort => &self.abort,
        }
    }

    fn for_event_mut(&mut self, event: Event) -> &mut Vec<Callback> {
        match event {
            Event::ThreadInit => &mut self.thread_init,
            Event::ThreadExit => &mut self.thread_exit,
            Event::Start => &mut self.start,
            Event::Commit => &mut self.commit,
            Event::Abort => &mut self.abort,
        }
    }
}

/// Engine-wide registration point.
pub(crate) struct Hooks {
    registered: RwLock<Arc<Callbacks>>,
    generation: AtomicU64,
    next_slot: AtomicUsize,
}

impl Hooks {
    pub(crate) fn new() -> Self {
        Self {
            registered: RwLock::new(Arc::new(Callbacks::default())),
            generation: AtomicU64::new(0),
            next_slot: AtomicUsize::new(0),
        }
    }

    /// Add a callback. Live descriptors pick it up at their next outermost start.
    pub(crate) fn register(&self, event: Event, callback: Callback) {
        let mut registered = self.registered.write();
        let mut next = Callbacks::clone(&registered);
        next.for_event_mut(event).push(callback);
        next.generation += 1;
        self.generation.store(next.generation, Ordering::Release);
        *registered = Arc::new(next);
    }

    /// Bumped by every registration.
    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn snapshot(&self) -> Arc<Callbacks> {
        self.registered.read().clone()
    }

    pub(crate) fn create_slot(&self) -> Result<SlotKey, StmError> {
        self.next_slot
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < MAX_SPECIFIC).then_some(n + 1)
            })
            .map(SlotKey)
            .map_err(|_| StmError::TooManySlots { max: MAX_SPECIFIC })
    }
}
