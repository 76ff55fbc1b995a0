//! Coarse monotonic time source.
//!
//! The cache only ever compares whole seconds, so the clock reports seconds.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Whole-second monotonic clock.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

/// Clock backed by [`Instant`], counting seconds since construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
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
    fn now_secs(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }
}

/// Manually driven clock for deterministic eviction and dump rate limiting.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_secs: u64) -> Self {
        Self {
            secs: AtomicU64::new(start_secs),
        }
    }

    /// Move the clock forward by `secs` and return the new time.
    pub fn advance(&self, secs: u64) -> u64 {
        self.secs.fetch_add(secs, Ordering::AcqRel) + secs
    }

    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.secs.load(Ordering::Acquire)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_secs(&self) -> u64 {
        (**self).now_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_and_sets() {
        let clock = ManualClock::new(10);
        assert_eq!(clock.now_secs(), 10);
        assert_eq!(clock.advance(3), 13);
        assert_eq!(clock.now_secs(), 13);
        clock.set(2);
        assert_eq!(clock.now_secs(), 2);
    }

    #[test]
    fn shared_clock_observes_updates() {
        let clock = Arc::new(ManualClock::new(0));
        let shared: Arc<ManualClock> = Arc::clone(&clock);
        clock.advance(5);
        assert_eq!(shared.now_secs(), 5);
    }

    #[test]
    fn monotonic_clock_starts_near_zero() {
        let clock = MonotonicClock::new();
        assert!(clock.now_secs() <= 1);
    }
}
