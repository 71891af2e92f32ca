//! Small global-state primitives used during library init/deinit.

use std::sync::atomic::{AtomicBool, Ordering};

/// A simple atomic flag, set once and cleared once.
pub struct Flag(AtomicBool);

impl Flag {
    /// Creates a new, unset `Flag`.
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns whether the flag is currently set.
    pub fn test(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sets the flag.
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Unsets the flag.
    pub fn unset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}
