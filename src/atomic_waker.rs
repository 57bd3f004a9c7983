//! Waker slot shared between a completion future and the interrupt that completes it.

use core::{cell::Cell, task::Waker};
use critical_section::Mutex;

/// Holds the waker of the one future waiting on a direction of the bus.
pub(crate) struct AtomicWaker {
    waker: Mutex<Cell<Option<Waker>>>,
}

impl AtomicWaker {
    pub(crate) const fn new() -> Self {
        Self {
            waker: Mutex::new(Cell::new(None)),
        }
    }

    /// Registers `new_waker`, replacing any previous one.
    pub(crate) fn register(&self, new_waker: &Waker) {
        critical_section::with(|cs| {
            let slot = self.waker.borrow(cs);
            let waker = match slot.take() {
                Some(w) if w.will_wake(new_waker) => w,
                _ => new_waker.clone(),
            };
            slot.set(Some(waker));
        });
    }

    /// Wakes the registered waker, if any. Must be called after the state the future polls has
    /// been updated.
    pub(crate) fn wake(&self) {
        if let Some(w) = critical_section::with(|cs| self.waker.borrow(cs).take()) {
            w.wake();
        }
    }
}
