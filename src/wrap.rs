//! Native data attached to heap values
//!
//! Wrapping, free-standing finalizers on objects and external values all come
//! down to a reference with count 0 that carries the finalizer. The object's
//! collection then fires the weak callback. With `want_reference` native code
//! gets that reference back and owns it (userland); otherwise it belongs to
//! the runtime and deletes itself once finalized.

use crate::env::Env;
use crate::error::{Error, Result};
use crate::finalizer::{FinalizeCallback, Finalizer, Opaque};
use crate::heap::{Object, Value, ValueData};
use crate::reference::Ownership;
use crate::tracker::RefId;

impl Env {
    /// Associate `native` with `object`.
    ///
    /// Returns the backing reference when `want_reference` is set, in which
    /// case a callback is required and the caller has to delete the reference.
    pub fn wrap(
        &mut self,
        object: Value,
        native: Opaque,
        finalize_cb: Option<FinalizeCallback>,
        hint: Opaque,
        want_reference: bool,
    ) -> Result<Option<RefId>> {
        self.check_gc_access("wrap");
        self.heap.object(object).ok_or(Error::InvalidArg)?;
        // a wrap whose reference was deleted no longer counts
        if self.wrap_of(object).is_ok() {
            return Err(Error::InvalidArg);
        }

        let id = self.attach(object, Finalizer::from_parts(finalize_cb, native, hint), want_reference)?;
        if let Some(target) = self.heap.object_mut(object) {
            target.set_wrap(Some(id));
        }
        Ok(want_reference.then_some(id))
    }

    /// Native data previously attached with [`Env::wrap`]
    pub fn unwrap(&self, object: Value) -> Result<Opaque> {
        let id = self.wrap_of(object)?;
        self.refs
            .get(id)
            .map(|entry| entry.finalizer().data())
            .ok_or(Error::InvalidArg)
    }

    /// Detach the wrapped native data and return it.
    ///
    /// The finalizer will not run: a userland reference loses its callback
    /// (the caller still deletes it), a runtime one is deleted right away.
    pub fn remove_wrap(&mut self, object: Value) -> Result<Opaque> {
        let id = self.wrap_of(object)?;
        let entry = self.refs.get_mut(id).ok_or(Error::InvalidArg)?;
        let data = entry.finalizer().data();
        if entry.ownership() == Some(Ownership::Userland) {
            entry.finalizer_mut().reset();
        } else {
            self.delete_entry(id);
        }

        if let Some(target) = self.heap.object_mut(object) {
            target.set_wrap(None);
        }
        Ok(data)
    }

    /// Run `finalize_cb` once `object` is collected, without wrapping it.
    pub fn add_finalizer(
        &mut self,
        object: Value,
        data: Opaque,
        finalize_cb: FinalizeCallback,
        hint: Opaque,
        want_reference: bool,
    ) -> Result<Option<RefId>> {
        self.check_gc_access("add_finalizer");
        self.heap.object(object).ok_or(Error::InvalidArg)?;
        let id = self.attach(object, Finalizer::new(finalize_cb, data, hint), want_reference)?;
        Ok(want_reference.then_some(id))
    }

    /// Allocate an external value carrying `data`.
    ///
    /// With a callback, it runs once the value is collected.
    pub fn create_external(
        &mut self,
        data: Opaque,
        finalize_cb: Option<FinalizeCallback>,
        hint: Opaque,
    ) -> Result<Value> {
        self.check_gc_access("create_external");
        let value = self.heap.allocate(ValueData::External(data));
        if let Some(callback) = finalize_cb {
            self.create_reference_with(value, 0, Ownership::Runtime, Finalizer::new(callback, data, hint))?;
        }
        Ok(value)
    }

    pub fn get_value_external(&self, value: Value) -> Result<Opaque> {
        match self.heap.data(value) {
            Some(ValueData::External(data)) => Ok(*data),
            _ => Err(Error::InvalidArg),
        }
    }

    fn attach(&mut self, object: Value, finalizer: Finalizer, want_reference: bool) -> Result<RefId> {
        let ownership = if want_reference {
            if !finalizer.has_callback() {
                return Err(Error::InvalidArg);
            }
            Ownership::Userland
        } else {
            Ownership::Runtime
        };
        self.create_reference_with(object, 0, ownership, finalizer)
    }

    fn wrap_of(&self, object: Value) -> Result<RefId> {
        self.heap
            .object(object)
            .and_then(Object::wrap)
            .filter(|&id| self.refs.contains(id))
            .ok_or(Error::InvalidArg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ListKind;

    fn noop(_: &mut Env, _: Opaque, _: Opaque) {}

    #[test]
    fn wrap_rejects_non_objects_and_rewrap() {
        let mut env = Env::new();
        let text = env.create_string("not an object");
        assert_eq!(
            env.wrap(text, Opaque::from_addr(1), None, Opaque::NULL, false),
            Err(Error::InvalidArg)
        );

        let object = env.create_object();
        assert_eq!(env.wrap(object, Opaque::from_addr(1), None, Opaque::NULL, false), Ok(None));
        assert_eq!(
            env.wrap(object, Opaque::from_addr(2), None, Opaque::NULL, false),
            Err(Error::InvalidArg)
        );
        assert_eq!(env.unwrap(object), Ok(Opaque::from_addr(1)));
    }

    #[test]
    fn wanted_reference_needs_callback() {
        let mut env = Env::new();
        let object = env.create_object();
        assert_eq!(
            env.wrap(object, Opaque::from_addr(1), None, Opaque::NULL, true),
            Err(Error::InvalidArg)
        );
        assert_eq!(env.unwrap(object), Err(Error::InvalidArg));
    }

    #[test]
    fn remove_runtime_wrap_deletes_entry() {
        let mut env = Env::new();
        let object = env.create_object();
        env.wrap(object, Opaque::from_addr(3), Some(noop), Opaque::NULL, false)
            .unwrap();
        assert_eq!(env.tracked_count(ListKind::Finalizing), 1);
        assert_eq!(env.remove_wrap(object), Ok(Opaque::from_addr(3)));
        assert_eq!(env.tracked_count(ListKind::Finalizing), 0);
        assert_eq!(env.unwrap(object), Err(Error::InvalidArg));
        assert_eq!(env.remove_wrap(object), Err(Error::InvalidArg));
    }

    #[test]
    fn external_data_round_trip() {
        let mut env = Env::new();
        let external = env.create_external(Opaque::from_addr(9), None, Opaque::NULL).unwrap();
        assert_eq!(env.get_value_external(external), Ok(Opaque::from_addr(9)));
        assert!(env.heap().can_be_held_weakly(external));
        let object = env.create_object();
        assert_eq!(env.get_value_external(object), Err(Error::InvalidArg));
    }
}
