//! State shared by both native target strategies.

use super::{BlockPayload, BlockSupplier, OnCloseHandler, TargetStrategy};
use crate::completion::WriteHandle;
use crate::format::header::{serialize_header, SnapshotHeader};
use crate::target::TargetSpec;
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tablesnap_core::{fatal_invariant, Result, SnapshotError, TableId};
use tracing::{error, warn};

/// Counters, failure records and close bookkeeping of one target
pub(crate) struct TargetCore {
    path: PathBuf,
    strategy: TargetStrategy,
    bytes_written: AtomicU64,
    write_error: Mutex<Option<SnapshotError>>,
    serialization_error: Mutex<Option<SnapshotError>>,
    outstanding: Mutex<u64>,
    drained: Condvar,
    closed: AtomicBool,
    on_close: Mutex<Option<OnCloseHandler>>,
}

impl TargetCore {
    pub(crate) fn new(path: PathBuf, strategy: TargetStrategy) -> Self {
        TargetCore {
            path,
            strategy,
            bytes_written: AtomicU64::new(0),
            write_error: Mutex::new(None),
            serialization_error: Mutex::new(None),
            outstanding: Mutex::new(0),
            drained: Condvar::new(),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn strategy(&self) -> TargetStrategy {
        self.strategy
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub(crate) fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the target closing; fails if `close` already ran.
    pub(crate) fn begin_close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SnapshotError::TargetClosed);
        }
        Ok(())
    }

    /// The error that poisoned the target.
    pub(crate) fn write_error(&self) -> Option<SnapshotError> {
        self.write_error.lock().clone()
    }

    /// Record a physical write failure. The first failure is kept.
    pub(crate) fn record_write_error(&self, err: SnapshotError) -> SnapshotError {
        let mut slot = self.write_error.lock();
        match &*slot {
            Some(first) => first.clone(),
            None => {
                error!(path = %self.path.display(), error = %err, "Snapshot write failed");
                *slot = Some(err.clone());
                err
            }
        }
    }

    pub(crate) fn report_serialization_failure(&self, err: SnapshotError) {
        let mut slot = self.serialization_error.lock();
        if slot.is_none() {
            warn!(path = %self.path.display(), error = %err, "Table serialization failed");
            *slot = Some(err);
        }
    }

    pub(crate) fn serialization_error(&self) -> Option<SnapshotError> {
        self.serialization_error.lock().clone()
    }

    /// Returns `true` if neither a write nor a serialization failure occurred.
    pub(crate) fn is_clean(&self) -> bool {
        self.write_error.lock().is_none() && self.serialization_error.lock().is_none()
    }

    fn task_started(&self) {
        *self.outstanding.lock() += 1;
    }

    fn task_finished(&self) {
        let mut outstanding = self.outstanding.lock();
        if *outstanding == 0 {
            fatal_invariant(format!(
                "outstanding write count underflow for {}",
                self.path.display()
            ));
        }
        *outstanding -= 1;
        if *outstanding == 0 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn outstanding(&self) -> u64 {
        *self.outstanding.lock()
    }

    /// Block until every accepted write has been written or failed.
    pub(crate) fn wait_drained(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.drained.wait(&mut outstanding);
        }
    }

    /// Handle for a write submitted after poisoning or close.
    ///
    /// The supplier still runs so the scan engine's buffer is released.
    pub(crate) fn reject_write(
        &self,
        supplier: BlockSupplier,
        table_id: TableId,
        err: SnapshotError,
    ) -> WriteHandle {
        drop(supplier());
        warn!(path = %self.path.display(), table = %table_id, error = %err, "Discarding snapshot block");
        WriteHandle::completed(Err(err))
    }

    /// Run the supplier, or reject the write if the target is unusable.
    pub(crate) fn admit(
        &self,
        supplier: BlockSupplier,
        table_id: TableId,
    ) -> std::result::Result<BlockPayload, WriteHandle> {
        if self.is_closed() {
            return Err(self.reject_write(supplier, table_id, SnapshotError::TargetClosed));
        }
        if let Some(err) = self.write_error() {
            return Err(self.reject_write(supplier, table_id, err));
        }
        Ok(supplier())
    }

    pub(crate) fn set_on_close_handler(&self, handler: OnCloseHandler) {
        *self.on_close.lock() = Some(handler);
    }

    /// Compute the close result and hand it to the on-close handler.
    pub(crate) fn finish_close(&self) -> Result<()> {
        let result = match (self.serialization_error(), self.write_error()) {
            (Some(e), _) => Err(e),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(()),
        };
        let handler = self.on_close.lock().take();
        if let Some(handler) = handler {
            handler(&result);
        }
        result
    }
}

/// Pipeline state that owns a [`TargetCore`]
pub(crate) trait HasCore: Send + Sync {
    fn core(&self) -> &TargetCore;
}

/// One accepted write; releases the outstanding count when dropped, so a
/// panicking task cannot leave `close` waiting forever
pub(crate) struct Outstanding<S: HasCore> {
    owner: Arc<S>,
}

impl<S: HasCore> Outstanding<S> {
    pub(crate) fn start(owner: &Arc<S>) -> Self {
        owner.core().task_started();
        Outstanding {
            owner: Arc::clone(owner),
        }
    }

    pub(crate) fn owner(&self) -> &Arc<S> {
        &self.owner
    }
}

impl<S: HasCore> Drop for Outstanding<S> {
    fn drop(&mut self) {
        self.owner.core().task_finished();
    }
}

/// Serialize the header for `spec`.
pub(crate) fn build_header(spec: &TargetSpec) -> Result<SnapshotHeader> {
    serialize_header(&spec.metadata, spec.version, &spec.schema)
}
