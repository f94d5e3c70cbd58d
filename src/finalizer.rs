//! Native finalize callbacks and their opaque context

use crate::env::Env;
use std::ffi::c_void;
use std::fmt;

/// Opaque pointer owned by native code
///
/// The crate stores and hands it back unchanged, it is never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opaque(*mut c_void);

// SAFETY: the pointer is only carried around, never dereferenced here. What
// it points to, and on which thread that may be touched, is the embedder's
// business.
unsafe impl Send for Opaque {}
unsafe impl Sync for Opaque {}

impl Opaque {
    pub const NULL: Self = Self(std::ptr::null_mut());

    pub const fn new(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    /// Wrap an integer token, e.g. an index into an embedder-side table
    pub fn from_addr(addr: usize) -> Self {
        Self(std::ptr::without_provenance_mut(addr))
    }

    pub fn addr(self) -> usize {
        self.0.addr()
    }

    pub const fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Default for Opaque {
    fn default() -> Self {
        Self::NULL
    }
}

/// Native cleanup function: `(env, data, hint)`
pub type FinalizeCallback = fn(env: &mut Env, data: Opaque, hint: Opaque);

/// A finalize callback together with the two context pointers passed to it
#[derive(Clone, Copy, Default)]
pub struct Finalizer {
    callback: Option<FinalizeCallback>,
    data: Opaque,
    hint: Opaque,
}

impl Finalizer {
    pub const NONE: Self = Self {
        callback: None,
        data: Opaque::NULL,
        hint: Opaque::NULL,
    };

    pub fn new(callback: FinalizeCallback, data: Opaque, hint: Opaque) -> Self {
        Self {
            callback: Some(callback),
            data,
            hint,
        }
    }

    /// Context without a callback; the data can still be read back
    pub fn data_only(data: Opaque) -> Self {
        Self {
            callback: None,
            data,
            hint: Opaque::NULL,
        }
    }

    pub(crate) fn from_parts(callback: Option<FinalizeCallback>, data: Opaque, hint: Opaque) -> Self {
        Self {
            callback,
            data,
            hint,
        }
    }

    pub fn callback(&self) -> Option<FinalizeCallback> {
        self.callback
    }

    pub fn data(&self) -> Opaque {
        self.data
    }

    pub fn hint(&self) -> Opaque {
        self.hint
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::NONE;
    }

    /// Swap the callback out so it cannot run twice
    pub(crate) fn take(&mut self) -> Option<(FinalizeCallback, Opaque, Opaque)> {
        let taken = std::mem::take(self);
        taken.callback.map(|cb| (cb, taken.data, taken.hint))
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer")
            .field("has_callback", &self.has_callback())
            .field("data", &self.data)
            .field("hint", &self.hint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Env, _: Opaque, _: Opaque) {}

    #[test]
    fn take_empties_the_holder() {
        let mut finalizer = Finalizer::new(noop, Opaque::from_addr(8), Opaque::from_addr(16));
        assert!(finalizer.has_callback());
        let (_, data, hint) = finalizer.take().expect("callback present");
        assert_eq!(data.addr(), 8);
        assert_eq!(hint.addr(), 16);
        assert!(!finalizer.has_callback());
        assert!(finalizer.data().is_null());
        assert!(finalizer.take().is_none());
    }

    #[test]
    fn data_only_keeps_data() {
        let mut finalizer = Finalizer::data_only(Opaque::from_addr(4));
        assert!(!finalizer.has_callback());
        assert_eq!(finalizer.data().addr(), 4);
        finalizer.reset();
        assert!(finalizer.data().is_null());
    }
}
