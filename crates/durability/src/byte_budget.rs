//! Process-wide budget of written-but-unsynced bytes.
//!
//! Every buffered write takes permits equal to its framed size before it hits
//! the file and gives them back once the periodic sync task has forced those
//! bytes to disk. Writers block when the budget is exhausted, which bounds the
//! dirty page-cache footprint of all snapshots combined.

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tablesnap_core::{fatal_invariant, SnapshotConfig};
use tracing::{trace, warn};

/// Counting semaphore of bytes
pub struct ByteBudget {
    capacity: u64,
    available: Mutex<u64>,
    released: Condvar,
    waiters: AtomicUsize,
}

static GLOBAL_BYTE_BUDGET: Lazy<Arc<ByteBudget>> = Lazy::new(|| {
    let config = SnapshotConfig::from_env().unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring invalid snapshot config for byte budget");
        SnapshotConfig::default()
    });
    Arc::new(ByteBudget::new(config.bytes_before_sync))
});

impl ByteBudget {
    /// Budget of `capacity` bytes, all available.
    pub fn new(capacity: u64) -> Self {
        ByteBudget {
            capacity: capacity.max(1),
            available: Mutex::new(capacity.max(1)),
            released: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Process-wide budget sized by `SNAPSHOT_BYTES_BEFORE_SYNC`.
    pub fn global() -> Arc<ByteBudget> {
        Arc::clone(&GLOBAL_BYTE_BUDGET)
    }

    /// Total permits.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> u64 {
        *self.available.lock()
    }

    /// Returns `true` when fewer than a quarter of the permits are free.
    pub fn is_scarce(&self) -> bool {
        self.available() < self.capacity / 4
    }

    /// Writers currently blocked in [`ByteBudget::acquire`].
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Returns `true` when a writer is blocked on the budget.
    pub fn has_waiters(&self) -> bool {
        self.waiters() > 0
    }

    /// Returns `true` when holders of permits should give them back now:
    /// the budget is scarce or a writer is waiting.
    pub fn needs_release(&self) -> bool {
        self.has_waiters() || self.is_scarce()
    }

    /// Block until `bytes` permits are free and take them.
    ///
    /// Requests larger than the budget are clamped to the capacity so a
    /// single oversized block cannot wait forever. Returns the permits
    /// actually held, which must be passed to [`ByteBudget::release`].
    pub fn acquire(&self, bytes: u64) -> u64 {
        let wanted = bytes.min(self.capacity);
        let mut available = self.available.lock();
        if *available < wanted {
            self.waiters.fetch_add(1, Ordering::AcqRel);
            while *available < wanted {
                trace!(wanted, available = *available, "Waiting for snapshot byte budget");
                self.released.wait(&mut available);
            }
            self.waiters.fetch_sub(1, Ordering::AcqRel);
        }
        *available -= wanted;
        wanted
    }

    /// Take `bytes` permits without blocking; `None` if not enough are free.
    pub fn try_acquire(&self, bytes: u64) -> Option<u64> {
        let wanted = bytes.min(self.capacity);
        let mut available = self.available.lock();
        if *available < wanted {
            return None;
        }
        *available -= wanted;
        Some(wanted)
    }

    /// Return permits obtained from [`ByteBudget::acquire`].
    pub fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut available = self.available.lock();
        if *available + bytes > self.capacity {
            fatal_invariant(format!(
                "byte budget over-released: {} + {} > {}",
                *available, bytes, self.capacity
            ));
        }
        *available += bytes;
        self.released.notify_all();
    }
}
