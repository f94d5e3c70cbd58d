//! The embedding environment
//!
//! An [`Env`] owns the value heap, every tracked entry (references, instance
//! data, posted finalizers), the set of finalizers waiting for a safe point,
//! and the interrupt queue used to reach one. It is bound to the thread that
//! created it.

use crate::error::{Error, Result, fatal_error};
use crate::finalizer::{FinalizeCallback, Finalizer, Opaque};
use crate::heap::{Heap, Object, Value, ValueData};
use crate::interrupt::{InterruptHandle, InterruptQueue};
use crate::reference::{Ownership, RefCount, Shape, TrackedFinalizer};
use crate::tracker::{ListKind, RefId, Tracker};
use std::collections::HashSet;
use std::marker::PhantomData;
use tracing::{debug, trace, warn};

/// Environment configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvOptions {
    /// Run collector-driven finalizers directly inside the weak callback
    /// instead of deferring them. Such finalizers must not touch GC state.
    pub finalizers_in_gc: bool,
    /// Post a drain of pending finalizers through the interrupt queue as soon
    /// as the first one is enqueued
    pub auto_drain: bool,
    /// Number of tracked entries to reserve room for up front
    pub reference_capacity: usize,
}

impl EnvOptions {
    pub const DEFAULT: Self = Self {
        finalizers_in_gc: false,
        auto_drain: true,
        reference_capacity: 64,
    };
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Per-instance state shared by every native call
///
/// # Example
///
/// ```
/// use verweis::{Env, Mode};
///
/// let mut env = Env::new();
/// let object = env.create_object();
/// let reference = env.create_reference(object, 1).unwrap();
///
/// assert_eq!(env.reference_unref(reference), Ok(0));
/// assert_eq!(env.reference_mode(reference), Ok(Mode::Weak));
///
/// env.collect_garbage();
/// assert_eq!(env.get_reference_value(reference), Ok(None));
/// env.delete_reference(reference).unwrap();
/// ```
pub struct Env {
    pub(crate) heap: Heap,
    pub(crate) refs: Tracker<TrackedFinalizer>,
    pending_finalizers: HashSet<RefId>,
    interrupts: InterruptQueue,
    options: EnvOptions,
    pub(crate) instance_data: Option<RefId>,
    in_gc_finalizer: bool,
    drain_scheduled: bool,
    tearing_down: bool,
    _non_send_or_sync: PhantomData<*const ()>,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    pub fn new() -> Self {
        Self::with_options(EnvOptions::DEFAULT)
    }

    pub fn with_options(options: EnvOptions) -> Self {
        Self {
            heap: Heap::new(),
            refs: Tracker::with_capacity(options.reference_capacity),
            pending_finalizers: HashSet::new(),
            interrupts: InterruptQueue::new(),
            options,
            instance_data: None,
            in_gc_finalizer: false,
            drain_scheduled: false,
            tearing_down: false,
            _non_send_or_sync: PhantomData,
        }
    }

    pub fn options(&self) -> &EnvOptions {
        &self.options
    }

    /// Read access to the underlying heap (for inspection)
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// `true` while a collector-driven finalizer runs in in-GC mode
    pub fn in_gc_finalizer(&self) -> bool {
        self.in_gc_finalizer
    }

    /// Abort if called from a finalizer running inside the collector.
    pub fn check_gc_access(&self, location: &str) {
        if self.in_gc_finalizer {
            fatal_error(
                location,
                "Finalizer is calling a function that may affect GC state. \
                 The finalizers run directly from GC and must not affect GC state. \
                 Use `post_finalizer` from inside of the finalizer to work around this issue.",
            );
        }
    }

    pub fn undefined(&self) -> Value {
        self.check_gc_access("undefined");
        self.heap.undefined()
    }

    pub fn null(&self) -> Value {
        self.check_gc_access("null");
        self.heap.null()
    }

    pub fn boolean(&self, value: bool) -> Value {
        self.check_gc_access("boolean");
        self.heap.boolean(value)
    }

    pub fn create_object(&mut self) -> Value {
        self.check_gc_access("create_object");
        self.heap.allocate(ValueData::Object(Object::default()))
    }

    pub fn create_string(&mut self, text: &str) -> Value {
        self.check_gc_access("create_string");
        self.heap.allocate(ValueData::String(text.to_owned()))
    }

    pub fn create_number(&mut self, number: f64) -> Value {
        self.check_gc_access("create_number");
        self.heap.allocate(ValueData::Number(number))
    }

    /// A fresh, unregistered symbol. Unlike [`Env::symbol_for`] it can be
    /// held weakly.
    pub fn create_symbol(&mut self, description: Option<&str>) -> Value {
        self.check_gc_access("create_symbol");
        self.heap.allocate(ValueData::Symbol {
            description: description.map(str::to_owned),
            registered: false,
        })
    }

    pub fn symbol_for(&mut self, key: &str) -> Value {
        self.check_gc_access("symbol_for");
        self.heap.symbol_for(key)
    }

    /// Append `value` to the fields of `object`, making it reachable from there
    pub fn set_field(&mut self, object: Value, value: Value) -> Result<()> {
        self.check_gc_access("set_field");
        if !self.heap.is_live(value) {
            return Err(Error::InvalidArg);
        }
        self.heap
            .object_mut(object)
            .ok_or(Error::InvalidArg)?
            .push_field(value);
        Ok(())
    }

    /// Run a full collection and the weak callbacks it produced.
    ///
    /// Returns the number of reclaimed values. Finalizers are only enqueued
    /// here unless [`EnvOptions::finalizers_in_gc`] is set.
    pub fn collect_garbage(&mut self) -> usize {
        self.check_gc_access("collect_garbage");
        let collection = self.heap.collect();
        for id in collection.weak_callbacks {
            self.weak_callback(id);
        }
        collection.reclaimed
    }

    /// Sending side of the interrupt queue, usable from any thread
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupts.handle()
    }

    pub fn request_interrupt<F>(&self, f: F)
    where
        F: FnOnce(&mut Env) + Send + 'static,
    {
        self.interrupts.push(Box::new(f));
    }

    pub fn has_pending_interrupts(&self) -> bool {
        self.interrupts.has_pending()
    }

    /// Safe point: run queued interrupts until none are left, including those
    /// queued while running. Returns how many ran.
    pub fn run_and_clear_interrupts(&mut self) -> usize {
        self.check_gc_access("run_and_clear_interrupts");
        let mut ran = 0;
        loop {
            let batch = self.interrupts.take();
            if batch.is_empty() {
                break;
            }
            for interrupt in batch {
                interrupt(&mut *self);
                ran += 1;
            }
        }
        ran
    }

    /// Second half of a collector-driven finalize, after the weak callback
    /// has reset the handle.
    pub(crate) fn invoke_finalizer_from_gc(&mut self, id: RefId) {
        if self.options.finalizers_in_gc {
            let saved = std::mem::replace(&mut self.in_gc_finalizer, true);
            self.finalize(id);
            self.in_gc_finalizer = saved;
        } else {
            self.enqueue_finalizer(id);
        }
    }

    pub(crate) fn enqueue_finalizer(&mut self, id: RefId) {
        if !self.pending_finalizers.insert(id) {
            return;
        }
        trace!(?id, pending = self.pending_finalizers.len(), "finalizer enqueued");

        if self.options.auto_drain && !self.drain_scheduled && !self.tearing_down {
            self.drain_scheduled = true;
            self.interrupts.push(Box::new(|env: &mut Env| {
                env.drain_scheduled = false;
                env.drain_pending_finalizers();
            }));
        }
    }

    pub(crate) fn dequeue_finalizer(&mut self, id: RefId) -> bool {
        self.pending_finalizers.remove(&id)
    }

    /// Finalize everything the collector handed over, in no particular order.
    ///
    /// Entries enqueued by the callbacks themselves are drained as well.
    /// Returns the number of finalized entries.
    pub fn drain_pending_finalizers(&mut self) -> usize {
        self.check_gc_access("drain_pending_finalizers");
        let mut drained = 0;
        while !self.pending_finalizers.is_empty() {
            let batch = std::mem::take(&mut self.pending_finalizers);
            for id in batch {
                // an earlier callback in this batch may have deleted it
                if !self.refs.contains(id) {
                    continue;
                }
                self.finalize(id);
                drained += 1;
            }
        }
        if drained > 0 {
            debug!(drained, "pending finalizers drained");
        }
        drained
    }

    pub fn pending_finalizer_count(&self) -> usize {
        self.pending_finalizers.len()
    }

    pub fn tracked_count(&self, list: ListKind) -> usize {
        self.refs.len(list)
    }

    /// Tracked entries of `list`, most recently linked first
    pub fn tracked(&self, list: ListKind) -> impl Iterator<Item = RefId> + '_ {
        self.refs.iter(list)
    }

    /// The list an entry currently belongs to; `None` once it was finalized
    /// or released
    pub fn tracked_list(&self, id: RefId) -> Option<ListKind> {
        self.refs.list_of(id)
    }

    /// Attach native data to the environment. A previous value is dropped
    /// without running its finalizer.
    pub fn set_instance_data(
        &mut self,
        data: Opaque,
        finalize_cb: Option<FinalizeCallback>,
        hint: Opaque,
    ) {
        self.check_gc_access("set_instance_data");
        if let Some(old) = self.instance_data.take() {
            self.delete_entry(old);
        }
        let entry = TrackedFinalizer::new(
            Finalizer::from_parts(finalize_cb, data, hint),
            Shape::Counted(RefCount::new(0, Ownership::Runtime)),
        );
        self.instance_data = Some(self.track(entry));
    }

    pub fn get_instance_data(&self) -> Option<Opaque> {
        let id = self.instance_data?;
        self.refs.get(id).map(|entry| entry.finalizer().data())
    }

    /// Schedule `callback` for the next drain of pending finalizers.
    ///
    /// This is the one way for an in-GC finalizer to get work done that
    /// touches GC state.
    pub fn post_finalizer(&mut self, callback: FinalizeCallback, data: Opaque, hint: Opaque) {
        let entry = TrackedFinalizer::new(Finalizer::new(callback, data, hint), Shape::Plain);
        let id = self.track(entry);
        trace!(?id, "finalizer posted");
        self.enqueue_finalizer(id);
    }

    /// Store and link a new entry. Entries with a callback go into the
    /// finalizing list, the rest into the live list.
    pub(crate) fn track(&mut self, entry: TrackedFinalizer) -> RefId {
        let list = if entry.finalizer().has_callback() {
            ListKind::Finalizing
        } else {
            ListKind::Live
        };
        let id = self.refs.insert(entry);
        self.refs.link(id, list);
        id
    }

    pub(crate) fn call_finalizer(&mut self, callback: FinalizeCallback, data: Opaque, hint: Opaque) {
        trace!(data = data.addr(), "calling finalizer");
        callback(self, data, hint);
    }

    fn finalize_all(&mut self, list: ListKind) {
        while let Some(id) = self.refs.first(list) {
            self.finalize(id);
        }
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!(
                finalizing = self.refs.len(ListKind::Finalizing),
                "environment dropped during a panic, skipping finalizers"
            );
            return;
        }

        self.in_gc_finalizer = false;
        self.tearing_down = true;
        let finalizing = self.refs.len(ListKind::Finalizing);
        let live = self.refs.len(ListKind::Live);

        // finalizers may still look at plain references, so they go first
        self.finalize_all(ListKind::Finalizing);
        self.finalize_all(ListKind::Live);

        let pending = self.pending_finalizers.len();
        self.pending_finalizers.clear();
        let interrupts = self.interrupts.clear();
        debug!(finalizing, live, pending, interrupts, "environment torn down");
    }
}
