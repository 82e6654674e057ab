use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ThrottleError;

/// Configuration for the admission controller.
///
/// Loading this from a file or environment is the embedding application's
/// job; the controller only consumes the finished struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Sustained request budget granted by the external API.
    pub requests_per_minute: u32,

    /// Maximum burst size. Defaults to one minute's worth of permits.
    pub burst_capacity: Option<u32>,

    /// Path to the shared state file. When set, independent processes
    /// pointing at the same path draw from one quota.
    pub shared_state_path: Option<PathBuf>,

    /// Attempts before a transient failure becomes terminal.
    pub max_retry_attempts: u32,

    /// First backoff delay; doubles on each subsequent attempt.
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,

    /// Ceiling for the computed backoff delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Uniform jitter applied to backoff delays, as a fraction in [0, 1).
    pub jitter_factor: f64,

    /// Warn when server-reported remaining quota drops below this fraction
    /// of the limit.
    pub warning_threshold: f64,

    /// Age after which another process may break the advisory lock and
    /// treat its holder as crashed.
    #[serde(with = "humantime_serde")]
    pub lock_staleness: Duration,

    /// Upper bound on waiting for the advisory lock in a single attempt.
    #[serde(with = "humantime_serde")]
    pub lock_wait_timeout: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 240,
            burst_capacity: None,
            shared_state_path: None,
            max_retry_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter_factor: 0.1,
            warning_threshold: 0.1,
            lock_staleness: Duration::from_secs(30),
            lock_wait_timeout: Duration::from_secs(5),
        }
    }
}

impl ThrottleConfig {
    /// Convenience constructor for the common single-knob case.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            ..Default::default()
        }
    }

    /// Effective burst capacity.
    pub fn burst(&self) -> u32 {
        self.burst_capacity.unwrap_or(self.requests_per_minute)
    }

    /// Refill rate in permits per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }

    pub fn validate(&self) -> Result<(), ThrottleError> {
        if self.requests_per_minute == 0 {
            return Err(ThrottleError::InvalidConfig(
                "requests_per_minute must be greater than zero".into(),
            ));
        }
        if self.burst() == 0 {
            return Err(ThrottleError::InvalidConfig(
                "burst_capacity must be greater than zero".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_factor) {
            return Err(ThrottleError::InvalidConfig(format!(
                "jitter_factor must be in [0, 1), got {}",
                self.jitter_factor
            )));
        }
        if !(self.warning_threshold > 0.0 && self.warning_threshold <= 1.0) {
            return Err(ThrottleError::InvalidConfig(format!(
                "warning_threshold must be in (0, 1], got {}",
                self.warning_threshold
            )));
        }
        if self.max_backoff < self.base_backoff {
            return Err(ThrottleError::InvalidConfig(
                "max_backoff must be at least base_backoff".into(),
            ));
        }
        if self.lock_staleness.is_zero() {
            return Err(ThrottleError::InvalidConfig(
                "lock_staleness must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
