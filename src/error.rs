use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the admission controller.
///
/// Timeouts are not errors. A blocking acquire that runs out of time
/// returns [`Acquisition::TimedOut`] as a normal result. Only programmer
/// errors, exhausted retries, and unrecoverable shared-state I/O reach this
/// enum.
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// More permits were requested than the bucket can ever hold.
    #[error("requested {requested} permits exceeds bucket capacity {capacity}")]
    ExceedsCapacity { requested: u32, capacity: u32 },

    /// The retry loop exhausted its attempt budget on transient failures.
    ///
    /// Carries the status of the last failed response, if any response was
    /// received at all.
    #[error("retries exhausted after {attempts} attempts (last status: {last_status:?})")]
    RetriesExhausted {
        attempts: u32,
        last_status: Option<u16>,
    },

    /// Configuration rejected by `ThrottleConfig::validate`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unrecoverable I/O against the shared state file.
    ///
    /// Only raised when an update cannot be committed; unreadable or
    /// corrupted records are recovered internally and never surface here.
    #[error("shared state I/O error: {0}")]
    Store(#[from] std::io::Error),
}

/// Outcome of a blocking permit acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Permits were debited; `waited` is how long the caller was blocked.
    Granted { waited: Duration },

    /// The caller-supplied timeout elapsed first. No tokens were debited.
    TimedOut,

    /// Cross-process mode only: the advisory lock could not be obtained
    /// within its bound, even after staleness checks. No tokens were
    /// debited. Distinguished from `TimedOut` for diagnostics.
    LockTimedOut,
}

impl Acquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquisition::Granted { .. })
    }

    /// Time spent blocked, zero for non-granted outcomes.
    pub fn waited(&self) -> Duration {
        match self {
            Acquisition::Granted { waited } => *waited,
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisition_accessors() {
        let granted = Acquisition::Granted {
            waited: Duration::from_millis(250),
        };
        assert!(granted.is_granted());
        assert_eq!(granted.waited(), Duration::from_millis(250));

        assert!(!Acquisition::TimedOut.is_granted());
        assert_eq!(Acquisition::LockTimedOut.waited(), Duration::ZERO);
    }

    #[test]
    fn error_display() {
        let err = ThrottleError::ExceedsCapacity {
            requested: 20,
            capacity: 10,
        };
        assert_eq!(
            err.to_string(),
            "requested 20 permits exceeds bucket capacity 10"
        );
    }
}
