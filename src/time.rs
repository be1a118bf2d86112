//! Monotonic millisecond clock seam.
//!
//! The engine never calls `SystemTime::now()` directly; every deadline is computed
//! against a [`TimeProvider`] so that retransmission and timeout tests can drive
//! time deterministically instead of sleeping.

use parking_lot::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic millisecond clock, as required by the external-interfaces contract (§1).
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Milliseconds since an arbitrary but fixed epoch, non-decreasing across calls.
    fn now_ms(&self) -> i64;
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }
}

/// Manual clock for deterministic simulations: tests advance it explicitly instead
/// of sleeping, mirroring this codebase's own transport-layer test double.
#[derive(Debug)]
pub struct ManualTimeProvider {
    now_ms: RwLock<i64>,
}

impl ManualTimeProvider {
    pub fn new(start_ms: i64) -> Self {
        Self { now_ms: RwLock::new(start_ms) }
    }

    pub fn set(&self, ms: i64) {
        *self.now_ms.write() = ms;
    }

    pub fn advance_ms(&self, delta: i64) {
        *self.now_ms.write() += delta;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_ms(&self) -> i64 {
        *self.now_ms.read()
    }
}

/// A deadline that never fires, used for `timeout = INFINITE`.
pub const INFINITE: i64 = i64::MAX;

/// A deadline meaning "expire on the next dispatch", used for `timeout = IMMEDIATE`.
pub const IMMEDIATE: i64 = 0;
