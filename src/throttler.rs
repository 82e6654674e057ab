use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ThrottleConfig;
use crate::error::{Acquisition, ThrottleError};
use crate::headers::{HeaderInspector, HeaderReport, ResponseMeta};
use crate::retry::{classify, RetryPolicy};
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::store::CrossProcessStore;
use crate::token_bucket::TokenBucket;

/// Where the authoritative token level lives.
enum Backend {
    Memory(TokenBucket),
    Shared(CrossProcessStore),
}

/// Value plus response metadata returned by a throttled callable.
#[derive(Debug)]
pub struct CallOutcome<T> {
    pub value: T,
    pub meta: ResponseMeta,
}

impl<T> CallOutcome<T> {
    pub fn new(value: T, meta: ResponseMeta) -> Self {
        Self { value, meta }
    }
}

/// Admission controller for one external API quota.
///
/// Combines the token bucket (in-memory, or file-shared across processes
/// when `shared_state_path` is configured), the retry/backoff policy,
/// rate-limit header inspection, and request statistics behind one facade.
/// Manage multiple quotas with multiple `Throttler` instances.
pub struct Throttler {
    config: ThrottleConfig,
    backend: Backend,
    retry: RetryPolicy,
    inspector: HeaderInspector,
    stats: StatsCollector,
    clock: Arc<dyn Clock>,
}

impl Throttler {
    pub fn new(config: ThrottleConfig) -> Result<Self, ThrottleError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build with an injected clock. Tests use this with `ManualClock` to
    /// make every blocking path deterministic.
    pub fn with_clock(
        config: ThrottleConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ThrottleError> {
        config.validate()?;

        let backend = match &config.shared_state_path {
            Some(path) => Backend::Shared(CrossProcessStore::new(
                path.clone(),
                config.burst(),
                config.refill_rate(),
                config.lock_wait_timeout,
                config.lock_staleness,
                clock.clone(),
            )),
            None => Backend::Memory(TokenBucket::new(
                config.burst(),
                config.refill_rate(),
                clock.clone(),
            )),
        };

        let retry = RetryPolicy::new(
            config.max_retry_attempts,
            config.base_backoff,
            config.max_backoff,
            config.jitter_factor,
        );
        let inspector = HeaderInspector::new(config.warning_threshold);

        Ok(Self {
            config,
            backend,
            retry,
            inspector,
            stats: StatsCollector::new(),
            clock,
        })
    }

    /// Block until `permits` tokens are available, or until `timeout`
    /// elapses (`None` blocks indefinitely). No FIFO ordering among waiters.
    pub fn acquire(
        &self,
        permits: u32,
        timeout: Option<Duration>,
    ) -> Result<Acquisition, ThrottleError> {
        let outcome = match &self.backend {
            Backend::Memory(bucket) => bucket.acquire(permits, timeout)?,
            Backend::Shared(store) => store.acquire(permits, timeout)?,
        };

        match outcome {
            Acquisition::Granted { waited } => {
                self.stats.record_request();
                if !waited.is_zero() {
                    self.stats.record_wait(waited);
                }
            }
            Acquisition::TimedOut => {
                // The caller was blocked for its whole budget before giving up.
                if let Some(timeout) = timeout {
                    self.stats.record_wait(timeout);
                }
            }
            Acquisition::LockTimedOut => {
                debug!("shared state lock wait exhausted");
            }
        }
        Ok(outcome)
    }

    /// Non-blocking variant of [`acquire`](Self::acquire).
    ///
    /// In cross-process mode a bounded wait for the advisory lock still
    /// applies; a lock timeout reports as not-granted.
    pub fn try_acquire(&self, permits: u32) -> Result<bool, ThrottleError> {
        let granted = match &self.backend {
            Backend::Memory(bucket) => bucket.try_acquire(permits)?,
            Backend::Shared(store) => {
                let outcome = store.try_acquire(permits)?;
                if outcome == Acquisition::LockTimedOut {
                    debug!("shared state lock wait exhausted");
                }
                outcome.is_granted()
            }
        };
        if granted {
            self.stats.record_request();
        }
        Ok(granted)
    }

    /// Feed a completed call's response metadata back into the controller.
    ///
    /// Parses rate-limit headers, counts low-quota warnings, and tightens
    /// the local token estimate down to the server-reported remaining count
    /// when the server claims less headroom than we do. The correction is
    /// one-directional: the server can shrink our view, never grow it.
    pub fn observe_response(&self, meta: &ResponseMeta) -> HeaderReport {
        let report = self.inspector.inspect(meta);
        if report.low_quota {
            self.stats.record_warning();
        }

        if let Some(remaining) = report.remaining {
            match &self.backend {
                Backend::Memory(bucket) => bucket.tighten(remaining as f64),
                Backend::Shared(store) => {
                    if let Err(err) = store.tighten(remaining as f64) {
                        warn!(%err, "failed to reconcile shared state with server headers");
                    }
                }
            }
        }
        report
    }

    /// Acquire then invoke. The plain decorator, with no retry logic.
    pub fn run<T>(&self, permits: u32, f: impl FnOnce() -> T) -> Result<T, ThrottleError> {
        self.block_for(permits)?;
        Ok(f())
    }

    /// Full throttled call: acquire permits, invoke the callable, inspect
    /// the response, and retry transient failures with backoff.
    ///
    /// Rate-limit (429) and transient server errors (500/502/503/504) are
    /// retried up to the configured attempt budget, honoring any larger
    /// server `Retry-After`. Every other response, success or a client
    /// error the caller has to fix, is handed back as-is on the first
    /// occurrence. Exhausting the budget yields
    /// [`ThrottleError::RetriesExhausted`] carrying the last status seen.
    pub fn call<T, F>(&self, permits: u32, mut f: F) -> Result<T, ThrottleError>
    where
        F: FnMut() -> CallOutcome<T>,
    {
        let mut last_status = None;

        for attempt in 0..self.retry.max_attempts() {
            self.block_for(permits)?;

            let outcome = f();
            let status = outcome.meta.status();
            let report = self.observe_response(&outcome.meta);

            if !classify(status).is_retryable() {
                return Ok(outcome.value);
            }

            last_status = Some(status);
            if attempt + 1 < self.retry.max_attempts() {
                let delay = self.retry.next_delay(attempt, report.retry_after);
                debug!(
                    attempt,
                    status,
                    delay_ms = delay.as_millis() as u64,
                    "transient response, backing off before retry"
                );
                self.clock.sleep(delay);
            }
        }

        Err(ThrottleError::RetriesExhausted {
            attempts: self.retry.max_attempts(),
            last_status,
        })
    }

    /// Acquire `permits` for the duration of a scope.
    ///
    /// Tokens are consumed, not borrowed: dropping the permit performs
    /// bookkeeping only and returns nothing to the bucket.
    pub fn permit(&self, permits: u32) -> Result<Permit<'_>, ThrottleError> {
        let waited = self.block_for(permits)?;
        Ok(Permit {
            permits,
            waited,
            acquired_at: self.clock.now(),
            clock: self.clock.clone(),
            _marker: std::marker::PhantomData,
        })
    }

    /// Current statistics plus a point-in-time token snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.available(), self.config.requests_per_minute)
    }

    /// Zero the statistics counters. The token level is untouched.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Current token level (authoritative source: memory or shared file).
    pub fn available(&self) -> f64 {
        match &self.backend {
            Backend::Memory(bucket) => bucket.available(),
            Backend::Shared(store) => store.available(),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Indefinitely-blocking acquire that rides out advisory-lock
    /// contention. Used by the call-site wrappers, which have no timeout.
    fn block_for(&self, permits: u32) -> Result<Duration, ThrottleError> {
        loop {
            match self.acquire(permits, None)? {
                Acquisition::Granted { waited } => return Ok(waited),
                Acquisition::LockTimedOut => {
                    debug!("retrying after shared lock timeout");
                    continue;
                }
                // No timeout was supplied, so the bucket cannot time out.
                Acquisition::TimedOut => unreachable!("acquire without timeout timed out"),
            }
        }
    }
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.backend {
            Backend::Memory(_) => "memory",
            Backend::Shared(_) => "shared",
        };
        f.debug_struct("Throttler")
            .field("requests_per_minute", &self.config.requests_per_minute)
            .field("burst", &self.config.burst())
            .field("backend", &backend)
            .finish()
    }
}

/// Scoped acquisition handle returned by [`Throttler::permit`].
pub struct Permit<'a> {
    permits: u32,
    waited: Duration,
    acquired_at: Instant,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<&'a Throttler>,
}

impl Permit<'_> {
    pub fn permits(&self) -> u32 {
        self.permits
    }

    /// How long the acquisition blocked before being granted.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let held = self.clock.now().saturating_duration_since(self.acquired_at);
        debug!(
            permits = self.permits,
            held_ms = held.as_millis() as u64,
            "permit scope ended, tokens consumed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::cell::Cell;

    fn throttler(requests_per_minute: u32, burst: u32) -> (Throttler, ManualClock) {
        let clock = ManualClock::new();
        let config = ThrottleConfig {
            burst_capacity: Some(burst),
            jitter_factor: 0.0,
            ..ThrottleConfig::per_minute(requests_per_minute)
        };
        let throttler = Throttler::with_clock(config, Arc::new(clock.clone())).unwrap();
        (throttler, clock)
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(matches!(
            Throttler::new(ThrottleConfig::per_minute(0)),
            Err(ThrottleError::InvalidConfig(_))
        ));
    }

    #[test]
    fn acquire_updates_stats() {
        let (throttler, _clock) = throttler(60, 2);

        assert!(throttler.acquire(2, None).unwrap().is_granted());
        // Bucket is dry; the next acquire blocks ~1s of virtual time.
        assert!(throttler.acquire(1, None).unwrap().is_granted());

        let stats = throttler.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_waits, 1);
        assert!(stats.average_wait_secs > 0.9);
        assert!((stats.wait_percentage - 0.5).abs() < 1e-9);
    }

    #[test]
    fn timed_out_acquire_counts_wait_but_not_request() {
        let (throttler, _clock) = throttler(60, 1);
        assert!(throttler.try_acquire(1).unwrap());

        // Needs 1s of refill, gets 200ms of budget.
        let outcome = throttler
            .acquire(1, Some(Duration::from_millis(200)))
            .unwrap();
        assert_eq!(outcome, Acquisition::TimedOut);

        let stats = throttler.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_waits, 1);
    }

    #[test]
    fn reset_stats_keeps_tokens() {
        let (throttler, _clock) = throttler(60, 10);
        assert!(throttler.try_acquire(4).unwrap());

        let before = throttler.available();
        throttler.reset_stats();

        assert_eq!(throttler.stats().total_requests, 0);
        assert!((throttler.available() - before).abs() < 0.1);
    }

    #[test]
    fn observe_response_counts_warnings_and_tightens() {
        let (throttler, _clock) = throttler(60, 100);

        let meta = ResponseMeta::new(200)
            .with_header("x-ratelimit-limit", "100")
            .with_header("x-ratelimit-remaining", "5");
        let report = throttler.observe_response(&meta);

        assert!(report.low_quota);
        assert_eq!(throttler.stats().rate_limit_warnings, 1);
        // Local estimate was 100, server says 5: tightened down.
        assert!(throttler.available() <= 5.5);
    }

    #[test]
    fn observe_response_never_loosens() {
        let (throttler, _clock) = throttler(60, 10);
        assert!(throttler.try_acquire(8).unwrap());

        let meta = ResponseMeta::new(200)
            .with_header("x-ratelimit-limit", "10")
            .with_header("x-ratelimit-remaining", "9");
        throttler.observe_response(&meta);

        assert!(throttler.available() < 3.0);
    }

    #[test]
    fn run_invokes_after_admission() {
        let (throttler, _clock) = throttler(60, 5);
        let value = throttler.run(1, || 41 + 1).unwrap();
        assert_eq!(value, 42);
        assert_eq!(throttler.stats().total_requests, 1);
    }

    #[test]
    fn call_retries_rate_limited_then_succeeds() {
        let (throttler, clock) = throttler(600, 10);
        let attempts = Cell::new(0u32);

        let result = throttler.call(1, || {
            attempts.set(attempts.get() + 1);
            if attempts.get() == 1 {
                CallOutcome::new("limited", ResponseMeta::new(429).with_header("retry-after", "2"))
            } else {
                CallOutcome::new("ok", ResponseMeta::new(200))
            }
        });

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.get(), 2);
        // Server asked for 2s, larger than the 1s computed backoff.
        assert!(clock.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn call_returns_client_errors_without_retry() {
        let (throttler, _clock) = throttler(600, 10);
        let attempts = Cell::new(0u32);

        let value = throttler
            .call(1, || {
                attempts.set(attempts.get() + 1);
                CallOutcome::new("missing", ResponseMeta::new(404))
            })
            .unwrap();

        assert_eq!(value, "missing");
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn call_degrades_after_exhausting_attempts() {
        let (throttler, _clock) = throttler(600, 10);
        let attempts = Cell::new(0u32);

        let result: Result<(), _> = throttler.call(1, || {
            attempts.set(attempts.get() + 1);
            CallOutcome::new((), ResponseMeta::new(503))
        });

        assert_eq!(attempts.get(), 3);
        assert!(matches!(
            result,
            Err(ThrottleError::RetriesExhausted {
                attempts: 3,
                last_status: Some(503),
            })
        ));
    }

    #[test]
    fn permit_guard_consumes_tokens() {
        let (throttler, _clock) = throttler(60, 5);
        {
            let permit = throttler.permit(3).unwrap();
            assert_eq!(permit.permits(), 3);
            assert_eq!(permit.waited(), Duration::ZERO);
        }
        // Dropping the guard does not give tokens back: debit, not a lock.
        assert!(throttler.available() <= 2.1);
    }

    #[test]
    fn shared_backend_selected_by_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ThrottleConfig {
            shared_state_path: Some(dir.path().join("quota.json")),
            burst_capacity: Some(4),
            ..ThrottleConfig::per_minute(60)
        };
        let throttler = Throttler::new(config).unwrap();

        assert!(throttler.try_acquire(4).unwrap());
        assert!(!throttler.try_acquire(1).unwrap());
        assert!(dir.path().join("quota.json").exists());
        assert!(format!("{throttler:?}").contains("shared"));
    }
}
