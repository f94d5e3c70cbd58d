//! Verweis - reference counting and deferred finalization for native handles into a GC heap
//!
//! Native code that embeds a garbage-collected script heap needs handles to
//! heap values whose lifetime it controls with an explicit count, and cleanup
//! callbacks that run once the collector has reclaimed a value. This crate
//! reconciles the two lifetime authorities.
//!
//! # Features
//!
//! - **Counted References**: strong while the count is positive, weak at zero,
//!   re-rooted when the count goes back up
//! - **Exactly-Once Finalizers**: explicit deletion and collection race safely;
//!   whichever comes first runs the callback
//! - **Deferred Finalization**: the collector only enqueues, callbacks run at
//!   the next safe point through the interrupt queue
//! - **Ordered Teardown**: entries with finalizers are torn down before plain
//!   references, so callbacks can still read them
//!
//! # Example
//!
//! ```
//! use verweis::{Env, Finalizer, Opaque, Ownership};
//!
//! fn release(_env: &mut Env, data: Opaque, _hint: Opaque) {
//!     assert_eq!(data.addr(), 42);
//! }
//!
//! let mut env = Env::new();
//! let object = env.create_object();
//! let reference = env
//!     .create_reference_with(object, 1, Ownership::Runtime, Finalizer::new(release, Opaque::from_addr(42), Opaque::NULL))
//!     .unwrap();
//!
//! // drop the last count; the object may now be collected
//! env.reference_unref(reference).unwrap();
//! env.collect_garbage();
//! assert_eq!(env.pending_finalizer_count(), 1);
//!
//! // safe point
//! env.run_and_clear_interrupts();
//! assert_eq!(env.pending_finalizer_count(), 0);
//! assert_eq!(env.get_reference_value(reference), Ok(None));
//! ```

mod color;
mod env;
mod error;
mod finalizer;
mod heap;
mod interrupt;
mod reference;
mod trace;
mod tracker;
mod wrap;

pub use env::{Env, EnvOptions};
pub use error::{Error, Result, fatal_error};
pub use finalizer::{FinalizeCallback, Finalizer, Opaque};
pub use heap::{Collection, Heap, Object, Persistent, Value, ValueData};
pub use interrupt::{Interrupt, InterruptHandle};
pub use reference::{Mode, Ownership};
pub use trace::{Trace, Tracer};
pub use tracker::{ListKind, RefId};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_reference() {
        let mut env = Env::new();
        let object = env.create_object();
        let reference = env.create_reference(object, 1).unwrap();
        assert_eq!(env.get_reference_value(reference), Ok(Some(object)));
        assert_eq!(env.reference_ref(reference), Ok(2));
        assert_eq!(env.reference_count(reference), Ok(2));
    }

    #[test]
    fn reference_survives_collection() {
        let mut env = Env::new();
        let object = env.create_object();
        let _garbage = env.create_object();
        let reference = env.create_reference(object, 1).unwrap();
        assert_eq!(env.collect_garbage(), 1);
        assert_eq!(env.get_reference_value(reference), Ok(Some(object)));
        assert!(env.heap().is_live(object));
    }

    #[test]
    fn handle_is_send() {
        fn assert_send<T: Send + Sync>() {}
        assert_send::<InterruptHandle>();
        assert_send::<Opaque>();
    }
}
