//! Injectable time source
//!
//! Every timestamp the store and the sync protocol produce comes from a
//! [`Clock`], so tests can drive pruning windows and merge ordering without
//! sleeping.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of Unix-millisecond timestamps
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
