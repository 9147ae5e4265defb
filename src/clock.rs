//! Time source used by every retry and polling loop.

use std::time::{Duration, Instant};

/// Monotonic time plus blocking sleep.
///
/// The engine never calls `std::thread::sleep` directly so tests can drive
/// retry and reconnect loops without waiting in real time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}
