//! Two-bit cross-thread handshake.
//!
//! Bit ownership:
//!
//! - `request` is set by the initiating side. It is cleared either by the
//!   worker as part of [`Signal::complete`], which hands the bit back to the
//!   initiator, or by the consumer in [`Signal::reset`].
//! - `state` is set only by the worker and cleared only by the consumer.
//!
//! The initiator and the consumer are the same control thread, so `request`
//! is never written by two threads for the same piece of work. An initiator
//! that raises again before consuming (an abandoning input) owns the newer
//! request; the newer completion clears it. Payloads and wake-ups travel
//! over channels, a `Signal` only answers "is this concern busy or done".

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct Signal {
    request: AtomicBool,
    state: AtomicBool,
}

impl Signal {
    pub const fn new() -> Self {
        Self {
            request: AtomicBool::new(false),
            state: AtomicBool::new(false),
        }
    }

    pub fn raise(&self) {
        self.request.store(true, Ordering::Release);
    }

    /// Worker side. Set the state bit before dropping the request, so an
    /// observer never sees the concern idle in between.
    pub fn complete(&self) {
        self.state.store(true, Ordering::Release);
        self.request.store(false, Ordering::Release);
    }

    pub fn reset(&self) {
        self.reset_with_state(false);
    }

    pub fn reset_with_state(&self, state: bool) {
        self.request.store(false, Ordering::Release);
        self.state.store(state, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.request.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }

    /// Requested or completed but not yet consumed.
    pub fn is_active(&self) -> bool {
        self.is_requested() || self.is_completed()
    }
}

/// The four concerns every processor tracks.
#[derive(Debug, Default)]
pub(crate) struct Signals {
    pub initialize: Signal,
    pub destroy: Signal,
    pub input: Signal,
    pub decode: Signal,
}

impl Signals {
    pub fn reset_all(&self) {
        self.initialize.reset();
        self.destroy.reset();
        self.input.reset();
        self.decode.reset();
    }
}
