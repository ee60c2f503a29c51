//! Testing utilities for snapshot targets
//!
//! - **Fault injection**: [`FaultInjector`] makes the N-th physical write of a
//!   target fail, so tests can exercise poisoning and drain-on-close without
//!   a full disk.
//!
//! # Example
//!
//! ```ignore
//! use tablesnap_durability::testing::FaultInjector;
//!
//! let faults = FaultInjector::new();
//! faults.fail_nth_write(2);
//! let resources = TargetResources::isolated(&config).with_faults(faults.clone());
//! ```

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultPlan {
    Never,
    /// Fail exactly this write (1-based)
    Nth(u64),
    /// Fail this write and every later one
    From(u64),
}

/// Deterministic write failure injection
#[derive(Debug)]
pub struct FaultInjector {
    plan: Mutex<FaultPlan>,
    writes: AtomicU64,
    injected: AtomicU64,
}

impl FaultInjector {
    /// Injector that never fails.
    pub fn new() -> Arc<Self> {
        Arc::new(FaultInjector {
            plan: Mutex::new(FaultPlan::Never),
            writes: AtomicU64::new(0),
            injected: AtomicU64::new(0),
        })
    }

    /// Fail the `n`-th physical write (1-based) and only that one.
    pub fn fail_nth_write(&self, n: u64) {
        *self.plan.lock() = FaultPlan::Nth(n.max(1));
    }

    /// Fail the `n`-th physical write and all that follow.
    pub fn fail_writes_from(&self, n: u64) {
        *self.plan.lock() = FaultPlan::From(n.max(1));
    }

    /// Stop injecting failures.
    pub fn disarm(&self) {
        *self.plan.lock() = FaultPlan::Never;
    }

    /// Physical writes observed so far.
    pub fn writes_seen(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    /// Failures injected so far.
    pub fn failures_injected(&self) -> u64 {
        self.injected.load(Ordering::Acquire)
    }

    /// Called by targets before each physical write.
    pub fn before_write(&self) -> io::Result<()> {
        let n = self.writes.fetch_add(1, Ordering::AcqRel) + 1;
        let fail = match *self.plan.lock() {
            FaultPlan::Never => false,
            FaultPlan::Nth(k) => n == k,
            FaultPlan::From(k) => n >= k,
        };
        if fail {
            self.injected.fetch_add(1, Ordering::AcqRel);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected failure on write {}", n),
            ));
        }
        Ok(())
    }
}

/// Run the injector if one is installed.
pub(crate) fn check_write(faults: Option<&FaultInjector>) -> io::Result<()> {
    match faults {
        Some(f) => f.before_write(),
        None => Ok(()),
    }
}
