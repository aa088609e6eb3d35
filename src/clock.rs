// src/clock.rs
//! Monotonic timestamps shared across threads.
//!
//! Candidates record when they last sent or received traffic. The event loop
//! is the only writer, but the check loop and selected-pair readers inspect
//! the values from other tasks, so the timestamp is stored as a nanosecond
//! offset from a fixed base instant in an atomic cell.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic instant readable and writable without locks.
#[derive(Debug)]
pub struct AtomicInstant {
    base: Instant,
    offset_nanos: AtomicU64,
}

impl AtomicInstant {
    /// Create a new timestamp initialized to "now".
    pub fn now() -> Self {
        Self {
            base: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    /// Store the current time.
    pub fn set_now(&self) {
        let nanos = Instant::now().duration_since(self.base).as_nanos() as u64;
        self.offset_nanos.store(nanos, Ordering::Release);
    }

    /// Load the stored instant.
    pub fn get(&self) -> Instant {
        let nanos = self.offset_nanos.load(Ordering::Acquire);
        self.base + Duration::from_nanos(nanos)
    }

    /// Time elapsed since the stored instant.
    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.get())
    }
}

impl Default for AtomicInstant {
    fn default() -> Self {
        Self::now()
    }
}
