//! Shared session lifecycle flags.
//!
//! `RunControls` is the single source of truth for "is the experiment clock
//! live". One instance exists per session, shared behind an `Arc` between
//! the synchronization loop, the state machine, and any external
//! collaborators (capture pipelines, rendering threads). Collaborators are
//! expected to poll these flags rather than receive push notifications;
//! the fields are atomics so a cross-thread read is always a consistent
//! snapshot and never blocks the loop.

use std::sync::atomic::{AtomicBool, Ordering};

/// The three lifecycle flags of a session.
///
/// - `beginning`: the start handshake with the firmware is pending; the
///   loop will flip this off (and `active` on) once the hardware clock has
///   been confirmed reset.
/// - `active`: the experiment clock is live; sensors are being logged and
///   task states are running.
/// - `quitting`: a shutdown has been requested; level-triggered, so an
///   in-flight tick always completes before shutdown executes.
#[derive(Debug)]
pub struct RunControls {
    beginning: AtomicBool,
    active: AtomicBool,
    quitting: AtomicBool,
}

impl RunControls {
    /// Create the session's control flags. With `autostart` the start
    /// handshake begins on the first tick; otherwise the session idles
    /// until an explicit start.
    pub fn new(autostart: bool) -> Self {
        Self {
            beginning: AtomicBool::new(autostart),
            active: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
        }
    }

    pub fn beginning(&self) -> bool {
        self.beginning.load(Ordering::SeqCst)
    }

    pub fn set_beginning(&self, value: bool) {
        self.beginning.store(value, Ordering::SeqCst);
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, value: bool) {
        self.active.store(value, Ordering::SeqCst);
    }

    pub fn quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    pub fn set_quitting(&self, value: bool) {
        self.quitting.store(value, Ordering::SeqCst);
    }
}

impl Default for RunControls {
    fn default() -> Self {
        Self::new(true)
    }
}
