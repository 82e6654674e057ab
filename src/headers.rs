use std::time::Duration;
use tracing::warn;

/// Response metadata reported back by the caller after an external call.
///
/// The controller is transport-agnostic: whatever HTTP client performed the
/// call, only the status code and headers matter here.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    status: u16,
    headers: Vec<(String, String)>,
}

impl ResponseMeta {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// What the provider's rate-limit headers said about the quota.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderReport {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_epoch_secs: Option<u64>,
    pub retry_after: Option<Duration>,
    /// Remaining quota fell below the configured warning threshold.
    pub low_quota: bool,
}

/// Parses provider rate-limit headers and flags low remaining quota.
#[derive(Debug, Clone)]
pub struct HeaderInspector {
    warning_threshold: f64,
}

impl HeaderInspector {
    pub fn new(warning_threshold: f64) -> Self {
        Self { warning_threshold }
    }

    /// Extract rate-limit signals from a completed call's metadata.
    ///
    /// Unparseable values are treated as absent; a provider sending garbage
    /// must not break the caller's request path.
    pub fn inspect(&self, meta: &ResponseMeta) -> HeaderReport {
        let limit = parse_u64(meta.header("x-ratelimit-limit"));
        let remaining = parse_u64(meta.header("x-ratelimit-remaining"));
        let reset_epoch_secs = parse_u64(meta.header("x-ratelimit-reset"));
        let retry_after = parse_retry_after(meta.header("retry-after"));

        let low_quota = match (remaining, limit) {
            (Some(remaining), Some(limit)) if limit > 0 => {
                (remaining as f64 / limit as f64) < self.warning_threshold
            }
            _ => false,
        };
        if low_quota {
            warn!(
                remaining = remaining.unwrap_or(0),
                limit = limit.unwrap_or(0),
                "remaining API quota is low"
            );
        }

        HeaderReport {
            limit,
            remaining,
            reset_epoch_secs,
            retry_after,
            low_quota,
        }
    }
}

fn parse_u64(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse().ok())
}

/// Parse a `Retry-After` header in delta-seconds form.
///
/// The HTTP-date form is rare from rate limiters and is ignored here.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
