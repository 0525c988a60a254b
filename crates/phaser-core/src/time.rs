//! Millisecond clocks and fixed-cadence tickers.
//!
//! All game timing is expressed as milliseconds since boot so that state
//! transitions can be driven deterministically in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Source of monotonic milliseconds since boot.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Monotonic clock anchored at construction. Follows tokio's clock, so a
/// paused test runtime pauses it too.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    boot: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for tests and simulations. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Fires at most once per period. The first poll always fires.
#[derive(Debug, Clone)]
pub struct Ticker {
    period_ms: u64,
    next_due_ms: Option<u64>,
}

impl Ticker {
    pub fn new(period_ms: u64) -> Self {
        Self {
            period_ms,
            next_due_ms: None,
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    /// Returns true and schedules the next tick if `now` has reached the
    /// current due time. Missed periods are skipped, not replayed.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        match self.next_due_ms {
            Some(due) if now_ms < due => false,
            _ => {
                self.next_due_ms = Some(now_ms + self.period_ms);
                true
            },
        }
    }

    pub fn reset(&mut self) {
        self.next_due_ms = None;
    }
}

/// A fixed point in time, such as the end of a respawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at_ms: u64,
}

impl Deadline {
    pub fn after(now_ms: u64, duration_ms: u64) -> Self {
        Self {
            at_ms: now_ms.saturating_add(duration_ms),
        }
    }

    pub fn at_ms(&self) -> u64 {
        self.at_ms
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms >= self.at_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.at_ms.saturating_sub(now_ms)
    }
}

/// Envelope timestamps are 32-bit and wrap after ~49 days of uptime.
pub fn wire_timestamp(now_ms: u64) -> u32 {
    now_ms as u32
}
