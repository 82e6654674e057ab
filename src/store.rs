use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Acquisition, ThrottleError};

/// Schema version of the persisted record. Records with any other version
/// are treated as corrupted and reinitialized.
pub const RECORD_VERSION: u32 = 1;

/// How often a waiter polls for the advisory lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Floor for sleeps between token re-checks, mirroring the in-memory bucket.
const MIN_SLEEP: Duration = Duration::from_millis(5);

/// On-disk bucket snapshot shared by all processes drawing from one quota.
///
/// Timestamps are wall-clock unix milliseconds: monotonic instants do not
/// survive a process boundary. Clock drift that makes elapsed time negative
/// simply refills nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedBucketRecord {
    pub version: u32,
    pub capacity: f64,
    pub tokens: f64,
    pub last_refill_unix_ms: u64,
    pub owner_pid: u32,
    pub updated_at_unix_ms: u64,
}

/// File-backed bucket shared across independent processes.
///
/// Coordination is a sidecar lock file (exclusive create as the advisory
/// lock, mtime as the staleness signal) around an atomic-rename commit of
/// the record. While this store is active, the persisted tokens value is the
/// single source of truth; no in-memory level is separately trusted.
pub struct CrossProcessStore {
    path: PathBuf,
    lock_path: PathBuf,
    capacity: u32,
    refill_rate: f64,
    lock_wait: Duration,
    lock_staleness: Duration,
    clock: Arc<dyn Clock>,
}

/// Held advisory lock; dropping it deletes the sidecar file.
struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to release state lock");
            }
        }
    }
}

impl CrossProcessStore {
    pub fn new(
        path: impl Into<PathBuf>,
        capacity: u32,
        refill_rate: f64,
        lock_wait: Duration,
        lock_staleness: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            capacity,
            refill_rate,
            lock_wait,
            lock_staleness,
            clock,
        }
    }

    /// Non-blocking acquisition against the shared record.
    ///
    /// Still waits (bounded) for the advisory lock; "non-blocking" refers
    /// to tokens, not to the critical section.
    pub fn try_acquire(&self, permits: u32) -> Result<Acquisition, ThrottleError> {
        self.check_capacity(permits)?;

        let Some(lock) = self.lock(self.lock_wait)? else {
            return Ok(Acquisition::LockTimedOut);
        };

        let mut record = self.load_or_init();
        self.refill(&mut record);

        let outcome = if record.tokens + 1e-9 >= f64::from(permits) {
            record.tokens = (record.tokens - f64::from(permits)).max(0.0);
            Acquisition::Granted {
                waited: Duration::ZERO,
            }
        } else {
            Acquisition::TimedOut
        };

        // Refill bookkeeping is committed even on refusal so the on-disk
        // timestamp keeps advancing.
        self.commit(&mut record)?;
        drop(lock);
        Ok(outcome)
    }

    /// Blocking acquisition: lock, read-modify-write, and when tokens are
    /// short, sleep *outside* the critical section before re-checking.
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
            if let Some(deadline) = deadline {
                if self.clock.now() >= deadline {
                    return Ok(Acquisition::TimedOut);
                }
            }

            // The lock wait has its own bound, independent of the caller's
            // timeout, so a crashed holder cannot starve us silently.
            let Some(lock) = self.lock(self.lock_wait)? else {
                return Ok(Acquisition::LockTimedOut);
            };

            let mut record = self.load_or_init();
            self.refill(&mut record);

            let wait = if record.tokens + 1e-9 >= f64::from(permits) {
                record.tokens = (record.tokens - f64::from(permits)).max(0.0);
                self.commit(&mut record)?;
                drop(lock);
                let waited = self.clock.now() - start;
                debug!(permits, waited_ms = waited.as_millis() as u64, "shared permits granted");
                return Ok(Acquisition::Granted { waited });
            } else {
                self.commit(&mut record)?;
                let deficit = f64::from(permits) - record.tokens;
                if self.refill_rate <= 0.0 {
                    // No refill ever: wait out the caller's timeout, if any.
                    Duration::MAX
                } else {
                    Duration::from_secs_f64(deficit / self.refill_rate)
                }
            };
            drop(lock);

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

    /// Current shared token level, read without taking the lock.
    ///
    /// Commits are atomic renames, so the record is always whole; the value
    /// may be momentarily stale, which is fine for reporting.
    pub fn available(&self) -> f64 {
        let mut record = self.load_or_init();
        self.refill(&mut record);
        record.tokens
    }

    /// Best-effort one-directional correction toward a server-reported
    /// remaining count. Skipped (with a debug log) if the lock is busy.
    pub fn tighten(&self, tokens: f64) -> Result<(), ThrottleError> {
        let Some(lock) = self.lock(self.lock_wait)? else {
            debug!("skipping reconciliation, state lock busy");
            return Ok(());
        };

        let mut record = self.load_or_init();
        self.refill(&mut record);
        if tokens < record.tokens {
            debug!(current = record.tokens, server = tokens, "tightening shared token estimate");
            record.tokens = tokens.max(0.0);
            self.commit(&mut record)?;
        }
        drop(lock);
        Ok(())
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
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

    /// Acquire the sidecar lock, waiting at most `max_wait`.
    ///
    /// A lock file older than the staleness threshold is force-broken: its
    /// holder is presumed crashed. Two waiters racing through that window is
    /// tolerable because the record commit is an atomic rename: the last
    /// writer's view wins, nothing is torn.
    fn lock(&self, max_wait: Duration) -> Result<Option<StateLock>, ThrottleError> {
        // An unrepresentable wait bound means wait as long as it takes.
        let deadline = self.clock.now().checked_add(max_wait);

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    // Owner pid in the lock file is diagnostic only.
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Some(StateLock {
                        path: self.lock_path.clone(),
                    }));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.break_if_stale() {
                        continue;
                    }
                    let poll = match deadline {
                        Some(deadline) => {
                            let now = self.clock.now();
                            if now >= deadline {
                                return Ok(None);
                            }
                            LOCK_POLL_INTERVAL.min(deadline - now)
                        }
                        None => LOCK_POLL_INTERVAL,
                    };
                    self.clock.sleep(poll);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Returns true if a stale lock was removed and creation should be
    /// retried immediately.
    fn break_if_stale(&self) -> bool {
        let modified = match fs::metadata(&self.lock_path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            // Lock vanished between create_new and stat: retry right away.
            Err(_) => return true,
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        if age <= self.lock_staleness {
            return false;
        }

        warn!(
            path = %self.lock_path.display(),
            age_secs = age.as_secs(),
            "breaking stale state lock, previous holder presumed crashed"
        );
        match fs::remove_file(&self.lock_path) {
            Ok(()) => true,
            // Another waiter broke it first.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => {
                warn!(%err, "failed to break stale lock");
                false
            }
        }
    }

    /// Read the record, or start a fresh full bucket when the file is
    /// absent, unreadable, or fails validation. Recovery favors
    /// availability: briefly too-generous quota beats refusing all callers.
    fn load_or_init(&self) -> PersistedBucketRecord {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no shared state yet, starting full");
                return self.fresh_record();
            }
            Err(err) => {
                warn!(%err, "shared state unreadable, reinitializing full bucket");
                return self.fresh_record();
            }
        };

        match serde_json::from_slice::<PersistedBucketRecord>(&bytes) {
            Ok(record) if self.validate(&record) => record,
            Ok(record) => {
                warn!(
                    version = record.version,
                    tokens = record.tokens,
                    "shared state failed validation, reinitializing full bucket"
                );
                self.fresh_record()
            }
            Err(err) => {
                warn!(%err, "shared state corrupted, reinitializing full bucket");
                self.fresh_record()
            }
        }
    }

    fn validate(&self, record: &PersistedBucketRecord) -> bool {
        record.version == RECORD_VERSION
            && record.tokens.is_finite()
            && record.tokens >= 0.0
            && record.capacity > 0.0
    }

    fn fresh_record(&self) -> PersistedBucketRecord {
        PersistedBucketRecord {
            version: RECORD_VERSION,
            capacity: f64::from(self.capacity),
            tokens: f64::from(self.capacity),
            last_refill_unix_ms: unix_ms(),
            owner_pid: std::process::id(),
            updated_at_unix_ms: unix_ms(),
        }
    }

    /// Same lazy refill as the in-memory bucket, against the disk snapshot.
    /// Also re-clamps to the configured capacity, which quietly adopts
    /// capacity changes between runs.
    fn refill(&self, record: &mut PersistedBucketRecord) {
        let now_ms = unix_ms();
        let elapsed_ms = now_ms.saturating_sub(record.last_refill_unix_ms);
        let added = (elapsed_ms as f64 / 1000.0) * self.refill_rate;
        record.capacity = f64::from(self.capacity);
        record.tokens = (record.tokens + added).min(record.capacity);
        record.last_refill_unix_ms = now_ms;
    }

    /// Commit via write-to-temp-then-rename so a concurrent reader can never
    /// observe a partial record.
    fn commit(&self, record: &mut PersistedBucketRecord) -> Result<(), ThrottleError> {
        record.owner_pid = std::process::id();
        record.updated_at_unix_ms = unix_ms();

        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut temp = match dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new_in(".")?,
        };
        let bytes = serde_json::to_vec_pretty(record).map_err(std::io::Error::from)?;
        temp.write_all(&bytes)?;
        temp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl std::fmt::Debug for CrossProcessStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossProcessStore")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .finish()
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
