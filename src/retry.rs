use rand::Rng;
use std::time::Duration;

/// How a completed call should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 2xx/3xx: done, hand the response back.
    Success,
    /// 429: retryable, and the server may have said how long to wait.
    RateLimited,
    /// 500/502/503/504: retryable server-side trouble.
    Transient,
    /// Any other 4xx: the request itself is wrong; retrying won't help.
    Terminal,
}

impl Disposition {
    pub fn is_retryable(self) -> bool {
        matches!(self, Disposition::RateLimited | Disposition::Transient)
    }
}

/// Classify a response status for the retry loop.
pub fn classify(status: u16) -> Disposition {
    match status {
        429 => Disposition::RateLimited,
        500 | 502 | 503 | 504 => Disposition::Transient,
        400..=499 => Disposition::Terminal,
        _ => Disposition::Success,
    }
}

/// Exponential backoff with jitter and `Retry-After` precedence.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter_factor: f64,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter_factor,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (zero-based).
    ///
    /// Computed as `min(max_delay, base_delay × 2^attempt)` widened by a
    /// uniform jitter factor in `[1 − j, 1 + j]`. A server-supplied
    /// `Retry-After` that exceeds the computed (pre-jitter) backoff takes
    /// precedence verbatim; the server's explicit instruction beats local
    /// estimation.
    pub fn next_delay(&self, attempt: u32, server_retry_after: Option<Duration>) -> Duration {
        let computed = self.delay_without_jitter(attempt);

        if let Some(server) = server_retry_after {
            if server > computed {
                return server;
            }
        }

        if self.jitter_factor <= 0.0 {
            return computed;
        }
        let factor = rand::rng()
            .random_range(1.0 - self.jitter_factor..=1.0 + self.jitter_factor);
        Duration::from_secs_f64((computed.as_secs_f64() * factor).max(0.0))
    }

    /// The deterministic backoff sequence: non-decreasing in `attempt`,
    /// capped at `max_delay`.
    pub fn delay_without_jitter(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// True once `attempt` retries have been spent.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(60), 0.1)
    }

    #[test]
    fn backoff_sequence_is_non_decreasing_and_capped() {
        let policy = policy();
        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let delay = policy.delay_without_jitter(attempt);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
        assert_eq!(policy.delay_without_jitter(0), Duration::from_secs(1));
        assert_eq!(policy.delay_without_jitter(3), Duration::from_secs(8));
        assert_eq!(policy.delay_without_jitter(19), Duration::from_secs(60));
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = policy();
        assert_eq!(policy.delay_without_jitter(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = policy();
        for attempt in 0..8 {
            let computed = policy.delay_without_jitter(attempt).as_secs_f64();
            for _ in 0..50 {
                let delay = policy.next_delay(attempt, None).as_secs_f64();
                assert!(delay >= computed * 0.9 - 1e-9, "attempt {attempt}: {delay}");
                assert!(delay <= computed * 1.1 + 1e-9, "attempt {attempt}: {delay}");
            }
        }
    }

    #[test]
    fn larger_server_retry_after_wins() {
        let policy = policy();
        // Computed backoff for attempt 0 is 1s; server asks for 30s.
        let delay = policy.next_delay(0, Some(Duration::from_secs(30)));
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn smaller_server_retry_after_is_ignored() {
        let policy = policy();
        // Attempt 4 computes 16s; a 2s hint must not shorten the backoff.
        let delay = policy.next_delay(4, Some(Duration::from_secs(2)));
        assert!(delay >= Duration::from_secs_f64(16.0 * 0.9));
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(10), 0.0);
        assert_eq!(policy.next_delay(1, None), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2, None), Duration::from_secs(2));
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify(200), Disposition::Success);
        assert_eq!(classify(204), Disposition::Success);
        assert_eq!(classify(301), Disposition::Success);
        assert_eq!(classify(429), Disposition::RateLimited);
        assert_eq!(classify(500), Disposition::Transient);
        assert_eq!(classify(502), Disposition::Transient);
        assert_eq!(classify(503), Disposition::Transient);
        assert_eq!(classify(504), Disposition::Transient);
        assert_eq!(classify(400), Disposition::Terminal);
        assert_eq!(classify(404), Disposition::Terminal);
        assert_eq!(classify(501), Disposition::Success); // not transient, not client error

        assert!(classify(429).is_retryable());
        assert!(classify(503).is_retryable());
        assert!(!classify(404).is_retryable());
        assert!(!classify(200).is_retryable());
    }

    #[test]
    fn exhaustion_bound() {
        let policy = policy();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
        assert!(policy.exhausted(6));
    }
}
