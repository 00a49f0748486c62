use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of arrival timestamps, in microseconds.
///
/// History tier aging is measured against this clock rather than sensor timestamps,
/// so tests and replayed streams can drive it explicitly.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> i64;
}

/// Monotonic clock anchored at construction time
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> i64 {
        nanos_to_micros(i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX))
    }
}

/// Manually advanced clock, shared between clones
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_us: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            now_us: Arc::new(AtomicI64::new(start_us)),
        }
    }

    pub fn set_us(&self, now_us: i64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: i64) {
        self.set_us(now_ms * 1_000);
    }

    pub fn advance_us(&self, delta_us: i64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

/// Round a nanosecond timestamp to the nearest microsecond.
pub fn nanos_to_micros(ns: i64) -> i64 {
    ns.saturating_add(500).div_euclid(1_000)
}
