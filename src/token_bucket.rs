use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Acquisition, ThrottleError};

/// Comparison slack for fractional token arithmetic. A waiter that slept
/// exactly the computed duration must not miss its grant to float rounding.
const TOKEN_EPSILON: f64 = 1e-9;

/// Floor for re-check sleeps, so near-zero computed waits do not degrade
/// into a busy loop on coarse platform timers.
const MIN_SLEEP: Duration = Duration::from_millis(5);

/// Mutable bucket bookkeeping, always accessed under the bucket mutex.
#[derive(Debug, Clone)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// In-memory token bucket with blocking and non-blocking acquisition.
///
/// Tokens refill continuously and lazily: every access credits
/// `elapsed × refill_rate`, clamped to capacity, so no background timer is
/// needed and long idle periods are accounted for correctly.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: u32,
    refill_rate: f64,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Creates a bucket that starts full.
    pub fn new(capacity: u32, refill_rate: f64, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: now,
            }),
            capacity,
            refill_rate,
            clock,
        }
    }

    /// Blocks until `permits` tokens are available or `timeout` elapses.
    ///
    /// The debit is all-or-nothing. The internal lock is released before
    /// sleeping, so a blocked waiter never stalls other threads' bookkeeping.
    /// Waiters racing to re-check after a sleep may be granted out of arrival
    /// order: there is no FIFO fairness guarantee.
    ///
    /// Requesting more permits than the bucket capacity is a programmer
    /// error and fails immediately with `ThrottleError::ExceedsCapacity`.
    pub fn acquire(
        &self,
        permits: u32,
        timeout: Option<Duration>,
    ) -> Result<Acquisition, ThrottleError> {
        self.check_capacity(permits)?;

        let start = self.clock.now();
        // A timeout too large to represent as an instant means no deadline.
        let deadline = timeout.and_then(|t| start.checked_add(t));

        loop {
            let wait = {
                let mut state = self.lock_state();
                self.refill(&mut state);

                if state.tokens + TOKEN_EPSILON >= f64::from(permits) {
                    state.tokens = (state.tokens - f64::from(permits)).max(0.0);
                    let waited = self.clock.now() - start;
                    debug!(permits, waited_ms = waited.as_millis() as u64, "permits granted");
                    return Ok(Acquisition::Granted { waited });
                }

                self.time_until(&state, permits)
            };

            // Lock released; sleep only as long as the timeout allows, then
            // re-check, since another waiter may have drained tokens meanwhile.
            let sleep_for = match deadline {
                Some(deadline) => {
                    let now = self.clock.now();
                    if now >= deadline {
                        return Ok(Acquisition::TimedOut);
                    }
                    wait.min(deadline - now)
                }
                None => wait,
            };
            self.clock.sleep(sleep_for.max(MIN_SLEEP));
        }
    }

    /// Non-blocking acquisition; returns `false` without side effects when
    /// tokens are insufficient.
    pub fn try_acquire(&self, permits: u32) -> Result<bool, ThrottleError> {
        self.check_capacity(permits)?;

        let mut state = self.lock_state();
        self.refill(&mut state);

        if state.tokens + TOKEN_EPSILON >= f64::from(permits) {
            state.tokens = (state.tokens - f64::from(permits)).max(0.0);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Current token level after refill. Fractional: a bucket refilling at
    /// 1/s holds half a token 500ms after running dry.
    pub fn available(&self) -> f64 {
        let mut state = self.lock_state();
        self.refill(&mut state);
        state.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Lowers the token level to `tokens` if the current estimate is higher.
    ///
    /// Used to reconcile with a server-reported remaining count; the
    /// correction is one-directional and never adds tokens.
    pub fn tighten(&self, tokens: f64) {
        let mut state = self.lock_state();
        self.refill(&mut state);
        if tokens < state.tokens {
            debug!(current = state.tokens, server = tokens, "tightening token estimate");
            state.tokens = tokens.max(0.0);
        }
    }

    fn check_capacity(&self, permits: u32) -> Result<(), ThrottleError> {
        if permits > self.capacity {
            return Err(ThrottleError::ExceedsCapacity {
                requested: permits,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        // A poisoned lock only means another thread panicked mid-bookkeeping;
        // the state itself is always left consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(f64::from(self.capacity));
        state.last_refill = now;
    }

    /// Wait needed before `permits` tokens will have accumulated, assuming
    /// no other consumers. Stale by the time the caller re-checks, which the
    /// acquire loop corrects.
    fn time_until(&self, state: &BucketState, permits: u32) -> Duration {
        let deficit = f64::from(permits) - state.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(deficit / self.refill_rate)
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .finish()
    }
}
