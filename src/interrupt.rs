//! Cross-thread interrupt queue
//!
//! Work that has to touch the environment is pushed here from any thread and
//! runs later on the environment's own thread, at the next safe point
//! ([`Env::run_and_clear_interrupts`]). The queue is the only part of an
//! environment that is shared across threads.

use crate::env::Env;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Work item run on the environment's thread
pub type Interrupt = Box<dyn FnOnce(&mut Env) + Send + 'static>;

#[derive(Default)]
struct Shared {
    queue: Mutex<Vec<Interrupt>>,
    /// Lets `has_pending` answer without taking the lock
    pending: AtomicUsize,
}

impl Shared {
    fn push(&self, interrupt: Interrupt) {
        let mut queue = self.queue.lock();
        queue.push(interrupt);
        self.pending.fetch_add(1, Ordering::Release);
    }

    fn take(&self) -> Vec<Interrupt> {
        if self.pending.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }
        let mut queue = self.queue.lock();
        let batch = std::mem::take(&mut *queue);
        self.pending.fetch_sub(batch.len(), Ordering::Release);
        batch
    }
}

/// Sending side of an environment's interrupt queue
///
/// Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct InterruptHandle {
    shared: Arc<Shared>,
}

impl InterruptHandle {
    /// Ask for `f` to run on the environment's thread at its next safe point
    pub fn request_interrupt<F>(&self, f: F)
    where
        F: FnOnce(&mut Env) + Send + 'static,
    {
        self.shared.push(Box::new(f));
        tracing::trace!(pending = self.pending(), "interrupt requested");
    }

    pub fn has_pending(&self) -> bool {
        self.pending() > 0
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Receiving side, owned by the environment
pub(crate) struct InterruptQueue {
    shared: Arc<Shared>,
}

impl InterruptQueue {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    pub(crate) fn handle(&self) -> InterruptHandle {
        InterruptHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn push(&self, interrupt: Interrupt) {
        self.shared.push(interrupt);
    }

    /// Swap out everything queued so far
    pub(crate) fn take(&self) -> Vec<Interrupt> {
        self.shared.take()
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire) > 0
    }

    /// Drop queued work without running it. Returns how much was dropped.
    pub(crate) fn clear(&self) -> usize {
        self.take().len()
    }
}
