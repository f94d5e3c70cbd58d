//! Trace trait for the value heap
//!
//! Heap data implements [`Trace`] so the mark phase can walk from rooted
//! cells to everything they reference.

use crate::heap::Value;

/// Collects the outgoing edges of the cell currently being scanned
///
/// The heap drains the tracer after every cell and shades what it found.
#[derive(Debug, Default)]
pub struct Tracer(Vec<Value>);

impl Tracer {
    pub(crate) fn new() -> Self {
        Self(Vec::new())
    }

    /// Report `value` as reachable from the cell being traced
    #[inline]
    pub fn mark(&mut self, value: Value) {
        self.0.push(value);
    }

    /// Take the edges discovered since the last call
    pub(crate) fn take_edges(&mut self) -> std::vec::Drain<'_, Value> {
        self.0.drain(..)
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.0.is_empty()
    }
}

/// Types stored in the heap that may reference other heap values
///
/// Implementations must call [`Tracer::mark`] for every [`Value`] they hold.
/// A missed edge does not cause undefined behaviour; the target is simply
/// reclaimed early and later reads through stale handles come back empty.
pub trait Trace {
    fn trace(&self, tracer: &mut Tracer);
}

impl Trace for Value {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.mark(*self);
    }
}

impl<T: Trace> Trace for Option<T> {
    fn trace(&self, tracer: &mut Tracer) {
        if let Some(value) = self {
            value.trace(tracer);
        }
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, tracer: &mut Tracer) {
        for item in self {
            item.trace(tracer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn collects_edges_in_order() {
        let heap = Heap::new();
        let a = heap.undefined();
        let b = heap.null();
        let mut tracer = Tracer::new();
        vec![Some(a), None, Some(b)].trace(&mut tracer);
        assert!(tracer.has_work());
        let edges: Vec<_> = tracer.take_edges().collect();
        assert_eq!(edges, vec![a, b]);
        assert!(!tracer.has_work());
    }
}
