use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Monotonic time source used by the bucket and store for waiting.
///
/// Production code uses [`SystemClock`]. Tests inject a [`ManualClock`] so
/// that blocking behavior can be verified without real sleeps.
pub trait Clock: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Suspend the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Real clock backed by `Instant::now` and `thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock for tests.
///
/// Time only moves when `advance` is called or when a waiter sleeps; a
/// `sleep` advances the clock by the full requested duration, so blocking
/// acquire paths run instantly while still reporting accurate waits.
#[derive(Debug, Clone)]
pub struct ManualClock {
    anchor: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut offset = self
            .offset
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *offset += duration;
    }

    /// Total virtual time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.anchor + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
