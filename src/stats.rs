use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default, Clone)]
struct StatsInner {
    total_requests: u64,
    total_waits: u64,
    total_wait_time: Duration,
    rate_limit_warnings: u64,
}

/// Counters describing the controller's admission behavior.
///
/// All counters sit behind one mutex so `snapshot` reads a consistent set.
#[derive(Debug, Default)]
pub struct StatsCollector {
    inner: Mutex<StatsInner>,
}

/// Point-in-time view of the collector plus derived ratios.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub total_waits: u64,
    pub total_wait_time_secs: f64,
    pub rate_limit_warnings: u64,
    pub current_tokens: f64,
    pub requests_per_minute: u32,
    /// Fraction of permit-consuming calls that had to block.
    pub wait_percentage: f64,
    /// Mean blocked time across calls that blocked.
    pub average_wait_secs: f64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a permit-consuming call.
    pub fn record_request(&self) {
        self.lock().total_requests += 1;
    }

    /// Record that an acquire had to block for `waited`.
    pub fn record_wait(&self, waited: Duration) {
        let mut inner = self.lock();
        inner.total_waits += 1;
        inner.total_wait_time += waited;
    }

    /// Record a low-remaining-quota warning from header inspection.
    pub fn record_warning(&self) {
        self.lock().rate_limit_warnings += 1;
    }

    pub fn snapshot(&self, current_tokens: f64, requests_per_minute: u32) -> StatsSnapshot {
        let inner = self.lock();
        let wait_percentage = if inner.total_requests == 0 {
            0.0
        } else {
            inner.total_waits as f64 / inner.total_requests as f64
        };
        let average_wait_secs = if inner.total_waits == 0 {
            0.0
        } else {
            inner.total_wait_time.as_secs_f64() / inner.total_waits as f64
        };
        StatsSnapshot {
            total_requests: inner.total_requests,
            total_waits: inner.total_waits,
            total_wait_time_secs: inner.total_wait_time.as_secs_f64(),
            rate_limit_warnings: inner.rate_limit_warnings,
            current_tokens,
            requests_per_minute,
            wait_percentage,
            average_wait_secs,
        }
    }

    /// Zero every counter. Token levels are untouched; that is the
    /// bucket's state, not the collector's.
    pub fn reset(&self) {
        *self.lock() = StatsInner::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_consistent_counters() {
        let stats = StatsCollector::new();
        stats.record_request();
        stats.record_request();
        stats.record_wait(Duration::from_secs(2));
        stats.record_warning();

        let snap = stats.snapshot(5.0, 60);
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.total_waits, 1);
        assert_eq!(snap.rate_limit_warnings, 1);
        assert!((snap.total_wait_time_secs - 2.0).abs() < 1e-9);
        assert!((snap.wait_percentage - 0.5).abs() < 1e-9);
        assert!((snap.average_wait_secs - 2.0).abs() < 1e-9);
        assert_eq!(snap.current_tokens, 5.0);
        assert_eq!(snap.requests_per_minute, 60);
    }

    #[test]
    fn snapshot_is_stable_without_activity() {
        let stats = StatsCollector::new();
        stats.record_request();

        let first = stats.snapshot(1.0, 60);
        let second = stats.snapshot(1.0, 60);
        assert_eq!(first, second);
    }

    #[test]
    fn derived_values_guard_division_by_zero() {
        let stats = StatsCollector::new();
        let snap = stats.snapshot(0.0, 60);
        assert_eq!(snap.wait_percentage, 0.0);
        assert_eq!(snap.average_wait_secs, 0.0);
    }

    #[test]
    fn reset_zeroes_counters() {
        let stats = StatsCollector::new();
        stats.record_request();
        stats.record_wait(Duration::from_millis(100));
        stats.record_warning();

        stats.reset();
        let snap = stats.snapshot(3.0, 60);
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.total_waits, 0);
        assert_eq!(snap.total_wait_time_secs, 0.0);
        assert_eq!(snap.rate_limit_warnings, 0);
        // The token level passed through is unaffected by reset.
        assert_eq!(snap.current_tokens, 3.0);
    }

    #[test]
    fn counters_accumulate_across_threads() {
        use std::sync::Arc;

        let stats = Arc::new(StatsCollector::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        stats.record_request();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.snapshot(0.0, 60).total_requests, 1000);
    }
}
