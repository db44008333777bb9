//! Fault injection for exercising transport and handler failure paths in tests.
//! Injection happens wherever a caller chooses to consult it; the engine itself
//! never checks an injector unless a test wires one in.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::StatusCode;

/// Action to take for a frame after consulting fault injection rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultAction {
    Pass,
    Drop,
    Error(StatusCode),
    Delay(Duration),
}

/// Basis-point fault rates (0-10000 = 0.00%-100.00%), checked in
/// drop > error > delay priority order.
pub struct FaultInjector {
    drop_rate: AtomicU32,
    error_rate: AtomicU32,
    delay_ms: AtomicU32,
    counter: AtomicU64,
    random_state: RandomState,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self {
            drop_rate: AtomicU32::new(0),
            error_rate: AtomicU32::new(0),
            delay_ms: AtomicU32::new(0),
            counter: AtomicU64::new(0),
            random_state: RandomState::new(),
        }
    }

    pub fn check(&self) -> FaultAction {
        let drop_rate = self.drop_rate.load(Ordering::Relaxed);
        if drop_rate > 0 && self.rand_percent() < drop_rate {
            return FaultAction::Drop;
        }

        let error_rate = self.error_rate.load(Ordering::Relaxed);
        if error_rate > 0 && self.rand_percent() < error_rate {
            return FaultAction::Error(StatusCode::Internal);
        }

        let delay_ms = self.delay_ms.load(Ordering::Relaxed);
        if delay_ms > 0 {
            return FaultAction::Delay(Duration::from_millis(delay_ms as u64));
        }

        FaultAction::Pass
    }

    pub fn set_drop_rate(&self, rate: u32) {
        self.drop_rate.store(rate.min(10000), Ordering::Relaxed);
    }

    pub fn set_error_rate(&self, rate: u32) {
        self.error_rate.store(rate.min(10000), Ordering::Relaxed);
    }

    pub fn set_delay(&self, delay_ms: u32) {
        self.delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    pub fn drop_rate(&self) -> u32 {
        self.drop_rate.load(Ordering::Relaxed)
    }

    pub fn error_rate(&self) -> u32 {
        self.error_rate.load(Ordering::Relaxed)
    }

    pub fn delay_ms(&self) -> u32 {
        self.delay_ms.load(Ordering::Relaxed)
    }

    /// A deterministic, dependency-free stand-in for randomness: hash a
    /// monotonically increasing counter into [0, 10000).
    fn rand_percent(&self) -> u32 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        (self.random_state.hash_one(counter) % 10000) as u32
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}
