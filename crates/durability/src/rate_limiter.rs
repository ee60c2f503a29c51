//! Process-wide write rate limiter for snapshot targets.
//!
//! Token bucket in bytes per second, refilled on demand from elapsed time.
//! The bucket holds at most one second of tokens. A caller asking for more
//! than is available reserves ahead: the balance goes negative and the caller
//! sleeps for the deficit, so later callers queue behind it.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tablesnap_core::SnapshotConfig;
use tracing::{debug, warn};

struct Bucket {
    /// May be negative while callers are sleeping off a reservation
    tokens: f64,
    last_refill: Instant,
}

/// Blocking byte-rate limiter
pub struct RateLimiter {
    /// `None` means unlimited
    bytes_per_sec: Option<u64>,
    bucket: Mutex<Bucket>,
    throttled_nanos: AtomicU64,
}

static GLOBAL_RATE_LIMITER: Lazy<Arc<RateLimiter>> = Lazy::new(|| {
    let config = SnapshotConfig::from_env().unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring invalid snapshot config for rate limiter");
        SnapshotConfig::default()
    });
    Arc::new(RateLimiter::new(config.rate_limit_bytes_per_sec()))
});

static ENFORCE_RATE_LIMIT: AtomicBool = AtomicBool::new(true);

impl RateLimiter {
    /// Limiter admitting `bytes_per_sec`; `None` or `Some(0)` is unlimited.
    pub fn new(bytes_per_sec: Option<u64>) -> Self {
        let bytes_per_sec = bytes_per_sec.filter(|r| *r > 0);
        RateLimiter {
            bytes_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: bytes_per_sec.unwrap_or(0) as f64,
                last_refill: Instant::now(),
            }),
            throttled_nanos: AtomicU64::new(0),
        }
    }

    /// Limiter that never blocks.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Process-wide limiter configured from `SNAPSHOT_RATELIMIT_MEGABYTES`.
    pub fn global() -> Arc<RateLimiter> {
        Arc::clone(&GLOBAL_RATE_LIMITER)
    }

    /// Configured rate, `None` if unlimited.
    pub fn bytes_per_sec(&self) -> Option<u64> {
        self.bytes_per_sec
    }

    /// Block until `bytes` may be written.
    pub fn acquire(&self, bytes: u64) {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            debug!(bytes, wait_ms = wait.as_millis() as u64, "Snapshot write throttled");
            self.throttled_nanos
                .fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
            std::thread::sleep(wait);
        }
    }

    /// Take `bytes` from the bucket and return how long the caller must wait.
    fn reserve(&self, bytes: u64) -> Duration {
        let rate = match self.bytes_per_sec {
            Some(rate) => rate as f64,
            None => return Duration::ZERO,
        };
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(rate);
        bucket.last_refill = now;

        bucket.tokens -= bytes as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / rate)
        }
    }

    /// Total time callers have spent throttled.
    pub fn throttled_time(&self) -> Duration {
        Duration::from_nanos(self.throttled_nanos.load(Ordering::Relaxed))
    }
}

/// Turn enforcement of snapshot rate limits on or off process-wide.
pub fn set_rate_limit_enforcement(enabled: bool) {
    ENFORCE_RATE_LIMIT.store(enabled, Ordering::Release);
}

/// Returns `true` if snapshot writers honor their rate limiter.
pub fn rate_limit_enforced() -> bool {
    ENFORCE_RATE_LIMIT.load(Ordering::Acquire)
}

/// Block the calling writer until `bytes` fit under the rate limit.
pub fn enforce_snapshot_rate_limit(limiter: &RateLimiter, bytes: usize) {
    if rate_limit_enforced() {
        limiter.acquire(bytes as u64);
    }
}
