//! Wall-clock seam for replica selection.
//!
//! Picking which healthy replica answers a remote query takes the current
//! nanosecond reading modulo the healthy count, so the only thing the shard
//! needs from a clock is one `i64`. Tests pin it to steer the pick.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the nanosecond reading the shard spreads query load with.
///
/// The reading is only ever consumed modulo a replica count; resolution and
/// monotonicity are irrelevant as long as successive readings vary.
pub trait NanoClock: std::fmt::Debug + Send + Sync + 'static {
    fn now_nanos(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Default)]
pub struct WallClock;

impl NanoClock for WallClock {
    fn now_nanos(&self) -> i64 {
        // saturates past 2262, by which point the modulo is still fine
        Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

/// A clock pinned to a fixed reading, so a test can force which replica a
/// query lands on.
#[derive(Debug, Default)]
pub struct FixedClock {
    nanos: AtomicI64,
}

impl FixedClock {
    pub fn new(nanos: i64) -> Self {
        Self {
            nanos: AtomicI64::new(nanos),
        }
    }

    pub fn set_nanos(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl NanoClock for FixedClock {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_reads_the_epoch_offset() {
        let clock = WallClock;
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(a > 0);
        assert!(a <= b);
    }

    #[test]
    fn fixed_clock_stays_where_it_is_put() {
        let clock = FixedClock::new(42);
        assert_eq!(clock.now_nanos(), 42);
        assert_eq!(clock.now_nanos(), 42);

        clock.set_nanos(7);
        assert_eq!(clock.now_nanos(), 7);
    }
}
