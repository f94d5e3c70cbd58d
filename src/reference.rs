//! Tracked finalizers, counted handles and managed references
//!
//! Every entry the environment tracks is a [`TrackedFinalizer`]: a finalize
//! callback that runs at most once, plus a shape fixed at construction.
//!
//! - `Plain`: nothing but the callback (`post_finalizer`)
//! - `Counted`: an explicit count and an [`Ownership`] policy (instance data)
//! - `Reference`: a count, a policy and a persistent handle that is strong
//!   while the count is positive and weak once it drops to zero
//!
//! A finalize either runs right away (explicit deletion, a runtime-owned
//! count reaching zero) or is handed over by the collector's weak callback
//! and runs when the environment drains its pending set at a safe point.

use crate::env::Env;
use crate::error::{Error, Result};
use crate::finalizer::{FinalizeCallback, Finalizer, Opaque};
use crate::heap::{Persistent, Value};
use crate::tracker::{HandleState, RefId};
use tracing::{trace, warn};

/// Who is responsible for destroying a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Destroyed by the runtime once released; no native call needed
    Runtime,
    /// Native code deletes it with [`Env::delete_reference`]
    Userland,
}

/// Current mode of a reference's handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The value is kept alive
    Strong,
    /// The value may be collected; a weak callback is armed
    Weak,
    /// The handle was released, after collection or finalization
    Empty,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RefCount {
    count: u32,
    ownership: Ownership,
}

impl RefCount {
    pub(crate) fn new(count: u32, ownership: Ownership) -> Self {
        Self { count, ownership }
    }

    /// `None` if the count would overflow
    fn inc(&mut self) -> Option<u32> {
        self.count = self.count.checked_add(1)?;
        Some(self.count)
    }

    /// `None` if the count is already zero
    fn dec(&mut self) -> Option<u32> {
        self.count = self.count.checked_sub(1)?;
        Some(self.count)
    }
}

#[derive(Debug)]
pub(crate) struct ManagedValue {
    persistent: Option<Persistent>,
    can_be_weak: bool,
    weak: bool,
}

impl ManagedValue {
    fn mode(&self) -> Mode {
        match self.persistent {
            None => Mode::Empty,
            Some(_) if self.weak => Mode::Weak,
            Some(_) => Mode::Strong,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Shape {
    Plain,
    Counted(RefCount),
    Reference(RefCount, ManagedValue),
}

/// What happens when a count drops to zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Nothing,
    MakeWeak,
    Destroy,
}

#[derive(Debug)]
pub(crate) struct TrackedFinalizer {
    finalizer: Finalizer,
    finalized: bool,
    shape: Shape,
}

impl TrackedFinalizer {
    pub(crate) fn new(finalizer: Finalizer, shape: Shape) -> Self {
        Self {
            finalizer,
            finalized: false,
            shape,
        }
    }

    pub(crate) fn finalizer(&self) -> &Finalizer {
        &self.finalizer
    }

    pub(crate) fn finalizer_mut(&mut self) -> &mut Finalizer {
        &mut self.finalizer
    }

    pub(crate) fn ownership(&self) -> Option<Ownership> {
        self.ref_count().map(|rc| rc.ownership)
    }

    fn take_callback(&mut self) -> Option<(FinalizeCallback, Opaque, Opaque)> {
        if self.finalized {
            return None;
        }
        self.finalized = true;
        self.finalizer.take()
    }

    fn ref_count(&self) -> Option<&RefCount> {
        match &self.shape {
            Shape::Plain => None,
            Shape::Counted(rc) | Shape::Reference(rc, _) => Some(rc),
        }
    }

    fn ref_count_mut(&mut self) -> Option<&mut RefCount> {
        match &mut self.shape {
            Shape::Plain => None,
            Shape::Counted(rc) | Shape::Reference(rc, _) => Some(rc),
        }
    }

    fn managed(&self) -> Option<&ManagedValue> {
        match &self.shape {
            Shape::Reference(_, managed) => Some(managed),
            _ => None,
        }
    }

    fn managed_mut(&mut self) -> Option<&mut ManagedValue> {
        match &mut self.shape {
            Shape::Reference(_, managed) => Some(managed),
            _ => None,
        }
    }

    fn deletes_on_finalize(&self) -> bool {
        self.ref_count()
            .is_none_or(|rc| rc.ownership == Ownership::Runtime)
    }

    fn release_policy(&self) -> Release {
        match &self.shape {
            Shape::Plain => Release::Nothing,
            Shape::Reference(_, managed) if managed.can_be_weak => Release::MakeWeak,
            Shape::Counted(rc) | Shape::Reference(rc, _) => match rc.ownership {
                Ownership::Runtime => Release::Destroy,
                Ownership::Userland => Release::Nothing,
            },
        }
    }
}

impl Env {
    /// Create a userland reference without a finalizer.
    ///
    /// A count of 0 makes a weak reference, anything above a strong one.
    pub fn create_reference(&mut self, value: Value, initial_refcount: u32) -> Result<RefId> {
        self.create_reference_with(value, initial_refcount, Ownership::Userland, Finalizer::NONE)
    }

    /// Create a reference with an explicit ownership policy and finalizer.
    ///
    /// Fails with [`Error::InvalidArg`] if `value` is not live, or for a
    /// runtime-owned reference starting at 0 on a value that cannot be held
    /// weakly, since nothing could ever release it.
    pub fn create_reference_with(
        &mut self,
        value: Value,
        initial_refcount: u32,
        ownership: Ownership,
        finalizer: Finalizer,
    ) -> Result<RefId> {
        self.check_gc_access("create_reference");
        if !self.heap.is_live(value) {
            return Err(Error::InvalidArg);
        }
        let can_be_weak = self.heap.can_be_held_weakly(value);
        if initial_refcount == 0 && ownership == Ownership::Runtime && !can_be_weak {
            return Err(Error::InvalidArg);
        }

        let managed = ManagedValue {
            persistent: Some(self.heap.new_persistent(value)),
            can_be_weak,
            weak: false,
        };
        let shape = Shape::Reference(RefCount::new(initial_refcount, ownership), managed);
        let id = self.track(TrackedFinalizer::new(finalizer, shape));
        if initial_refcount == 0 {
            self.set_weak(id);
        }

        trace!(?id, initial_refcount, ?ownership, can_be_weak, "reference created");
        Ok(id)
    }

    /// Increment the count, making the reference strong again if it was weak.
    ///
    /// Returns 0 without touching the count if the value was already
    /// collected; it cannot be brought back.
    pub fn reference_ref(&mut self, id: RefId) -> Result<u32> {
        self.check_gc_access("reference_ref");
        match self.refs.state(id) {
            HandleState::Invalid => return Err(Error::InvalidArg),
            HandleState::Released => return Ok(0),
            HandleState::Live => {}
        }

        let entry = self.refs.get_mut(id).ok_or(Error::InvalidArg)?;
        let count = match &mut entry.shape {
            Shape::Plain => return Err(Error::InvalidArg),
            Shape::Counted(rc) => rc.inc().ok_or(Error::GenericFailure)?,
            Shape::Reference(rc, managed) => {
                let Some(persistent) = managed.persistent else {
                    return Ok(0);
                };
                let count = rc.inc().ok_or(Error::GenericFailure)?;
                if count == 1 && managed.weak {
                    managed.weak = false;
                    self.heap.clear_weak(persistent);
                }
                count
            }
        };

        trace!(?id, count, "reference ref");
        Ok(count)
    }

    /// Decrement the count.
    ///
    /// Reaching 0 makes a weakable reference weak. A runtime-owned reference
    /// that cannot go weak is finalized and deleted on the spot. Calling this
    /// at 0 is [`Error::GenericFailure`].
    pub fn reference_unref(&mut self, id: RefId) -> Result<u32> {
        self.check_gc_access("reference_unref");
        match self.refs.state(id) {
            HandleState::Invalid => return Err(Error::InvalidArg),
            HandleState::Released => return Err(Error::GenericFailure),
            HandleState::Live => {}
        }

        let entry = self.refs.get_mut(id).ok_or(Error::InvalidArg)?;
        let release = entry.release_policy();
        let count = entry
            .ref_count_mut()
            .ok_or(Error::InvalidArg)?
            .dec()
            .ok_or(Error::GenericFailure)?;

        trace!(?id, count, "reference unref");
        if count == 0 {
            match release {
                Release::MakeWeak => self.set_weak(id),
                Release::Destroy => self.finalize(id),
                Release::Nothing => {}
            }
        }
        Ok(count)
    }

    /// Current count. A released reference reads as 0.
    pub fn reference_count(&self, id: RefId) -> Result<u32> {
        match self.refs.state(id) {
            HandleState::Invalid => Err(Error::InvalidArg),
            HandleState::Released => Ok(0),
            HandleState::Live => self
                .refs
                .get(id)
                .and_then(TrackedFinalizer::ref_count)
                .map(|rc| rc.count)
                .ok_or(Error::InvalidArg),
        }
    }

    pub fn reference_mode(&self, id: RefId) -> Result<Mode> {
        match self.refs.state(id) {
            HandleState::Invalid => Err(Error::InvalidArg),
            HandleState::Released => Ok(Mode::Empty),
            HandleState::Live => self
                .refs
                .get(id)
                .and_then(TrackedFinalizer::managed)
                .map(ManagedValue::mode)
                .ok_or(Error::InvalidArg),
        }
    }

    /// The referenced value, or `None` if it was collected or the reference
    /// has already been released.
    pub fn get_reference_value(&self, id: RefId) -> Result<Option<Value>> {
        match self.refs.state(id) {
            HandleState::Invalid => return Err(Error::InvalidArg),
            HandleState::Released => return Ok(None),
            HandleState::Live => {}
        }
        let managed = self
            .refs
            .get(id)
            .and_then(TrackedFinalizer::managed)
            .ok_or(Error::InvalidArg)?;
        Ok(managed.persistent.and_then(|handle| self.heap.get(handle)))
    }

    /// Destroy the reference now, running its finalizer if it has not run yet.
    ///
    /// Deleting a reference that was already released is
    /// [`Error::GenericFailure`].
    pub fn delete_reference(&mut self, id: RefId) -> Result<()> {
        match self.refs.state(id) {
            HandleState::Invalid => return Err(Error::InvalidArg),
            HandleState::Released => return Err(Error::GenericFailure),
            HandleState::Live => {}
        }
        if self.refs.get(id).and_then(TrackedFinalizer::managed).is_none() {
            return Err(Error::InvalidArg);
        }

        // whichever of this and a queued collector finalize runs first wins
        self.dequeue_finalizer(id);
        self.release_value(id);
        self.finalize_core(id, true);
        trace!(?id, "reference deleted");
        Ok(())
    }

    fn set_weak(&mut self, id: RefId) {
        let Some(managed) = self.refs.get_mut(id).and_then(|entry| entry.managed_mut()) else {
            return;
        };
        if !managed.can_be_weak {
            return;
        }
        if let Some(persistent) = managed.persistent {
            managed.weak = true;
            self.heap.make_weak(persistent, id);
        }
    }

    fn release_value(&mut self, id: RefId) {
        if let Some(managed) = self.refs.get_mut(id).and_then(|entry| entry.managed_mut()) {
            managed.weak = false;
            if let Some(persistent) = managed.persistent.take() {
                self.heap.reset(persistent);
            }
        }
    }

    /// Finalize an entry the way its shape asks for: release the value, run
    /// the callback once, and delete the entry unless native code owns it.
    pub(crate) fn finalize(&mut self, id: RefId) {
        let Some(entry) = self.refs.get(id) else {
            trace!(?id, "finalize skipped, entry already released");
            return;
        };
        let delete_me = entry.deletes_on_finalize();
        self.release_value(id);
        self.finalize_core(id, delete_me);
    }

    fn finalize_core(&mut self, id: RefId, delete_me: bool) {
        let Some(entry) = self.refs.get_mut(id) else {
            return;
        };
        let callback = entry.take_callback();

        // the callback may delete the entry itself
        self.refs.unlink(id);
        if let Some((callback, data, hint)) = callback {
            self.call_finalizer(callback, data, hint);
        }

        if delete_me {
            self.delete_entry(id);
        }
    }

    /// Drop an entry without running its finalizer.
    pub(crate) fn delete_entry(&mut self, id: RefId) {
        self.dequeue_finalizer(id);
        if let Some(mut entry) = self.refs.remove(id) {
            if let Some(persistent) = entry.managed_mut().and_then(|managed| managed.persistent.take()) {
                self.heap.reset(persistent);
            }
            trace!(?id, "tracked entry deleted");
        }
    }

    /// First pass of a collector-driven finalize. The handle must be reset
    /// here; everything else is left to [`Env::invoke_finalizer_from_gc`].
    pub(crate) fn weak_callback(&mut self, id: RefId) {
        let Some(managed) = self.refs.get_mut(id).and_then(|entry| entry.managed_mut()) else {
            warn!(?id, "weak callback for an untracked reference");
            return;
        };
        managed.weak = false;
        if let Some(persistent) = managed.persistent.take() {
            self.heap.reset(persistent);
        }
        trace!(?id, "weak callback");
        self.invoke_finalizer_from_gc(id);
    }
}
