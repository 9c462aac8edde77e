//! Clock abstractions used by the workers and the circuit breaker.
//!
//! Schedule scores, dead-letter timestamps, and outbox retry deadlines are
//! all expressed in epoch seconds, so the clock seam exposes wall time
//! rather than a monotonic origin.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall time in whole epoch seconds.
    fn now_secs(&self) -> i64;

    /// Current wall time in epoch milliseconds.
    fn now_millis(&self) -> i64 {
        self.now_secs() * 1_000
    }
}

/// Wall clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        self.now_millis() / 1_000
    }

    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock at a specific epoch second.
    pub fn at(secs: i64) -> Self {
        let clock = Self::new();
        clock.set_secs(secs);
        clock
    }

    pub fn set_secs(&self, secs: i64) {
        self.now_ms.store(secs * 1_000, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.now_ms.fetch_add(secs * 1_000, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: i64) {
        self.now_ms.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst) / 1_000
    }

    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
