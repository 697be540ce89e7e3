//! Wall-clock source for round timing.
//!
//! Timestamps are unix seconds, like Solana's `Clock::unix_timestamp`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch.
pub type UnixTimestamp = i64;

/// Source of the current time for upkeep checks and round bookkeeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimestamp;
}

/// Reads the host's system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as UnixTimestamp)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to. Used to step rounds past their
/// interval deterministically.
#[derive(Debug)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: UnixTimestamp) -> Self {
        Self(AtomicI64::new(start))
    }

    /// Move the clock forward by `secs` seconds.
    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, timestamp: UnixTimestamp) {
        self.0.store(timestamp, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimestamp {
        self.0.load(Ordering::SeqCst)
    }
}
