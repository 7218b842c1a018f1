//! # Clock
//!
//! Millisecond wall-clock handle. Production nodes read the system clock;
//! tests inject a manually advanced one so timestamps in emitted envelopes
//! and event records are reproducible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cheap cloneable source of epoch milliseconds.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Real time via the system clock.
    System,
    /// Manually driven time, shared across clones.
    Manual(Arc<AtomicU64>),
}

impl Clock {
    /// The system wall clock.
    pub fn system() -> Self {
        Clock::System
    }

    /// A manual clock starting at `start_ms`. Clones share the same
    /// underlying counter, so advancing one advances all.
    pub fn manual(start_ms: u64) -> Self {
        Clock::Manual(Arc::new(AtomicU64::new(start_ms)))
    }

    /// Current time in epoch milliseconds.
    pub fn now_ms(&self) -> u64 {
        match self {
            Clock::System => chrono::Utc::now().timestamp_millis().max(0) as u64,
            Clock::Manual(ms) => ms.load(Ordering::Relaxed),
        }
    }

    /// Advances a manual clock by `delta_ms`. No-op on the system clock.
    pub fn advance(&self, delta_ms: u64) {
        if let Clock::Manual(ms) = self {
            ms.fetch_add(delta_ms, Ordering::Relaxed);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}
