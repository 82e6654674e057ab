//! Admission control for outbound calls to rate-limited external APIs.
//!
//! One quota, many callers: threads inside a process contend on a mutex-
//! protected token bucket, and independent processes can share the same
//! quota through a file-backed store with advisory locking and atomic
//! commits. Rejected or failed calls go through an exponential-backoff
//! retry policy that honors server `Retry-After` hints, and rate-limit
//! response headers feed back into the local token estimate.

pub mod clock;
pub mod config;
pub mod error;
pub mod headers;
pub mod retry;
pub mod stats;
pub mod store;
pub mod throttler;
pub mod token_bucket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ThrottleConfig;
pub use error::{Acquisition, ThrottleError};
pub use headers::{HeaderInspector, HeaderReport, ResponseMeta};
pub use retry::{classify, Disposition, RetryPolicy};
pub use stats::{StatsCollector, StatsSnapshot};
pub use store::{CrossProcessStore, PersistedBucketRecord, RECORD_VERSION};
pub use throttler::{CallOutcome, Permit, Throttler};
pub use token_bucket::TokenBucket;
