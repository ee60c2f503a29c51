//! Buffered snapshot target.
//!
//! Blocks are compressed on the shared compression pool and written through
//! the page cache by a dedicated per-target write thread, in submission order.
//!
//! # Backpressure
//!
//! Each written block holds permits from the process-wide [`ByteBudget`] until
//! the periodic sync task has forced its extent to disk. When the budget runs
//! low or a writer is blocked on it, the sync task syncs whatever is
//! outstanding instead of waiting for the per-target threshold.
//!
//! [`ByteBudget`]: crate::byte_budget::ByteBudget

use super::native::{build_header, HasCore, Outstanding, TargetCore};
use super::sys;
use super::{
    BlockPayload, BlockSupplier, OnCloseHandler, SnapshotDataTarget, TargetResources, TargetSpec,
    TargetStrategy,
};
use crate::codec::CompressedBlock;
use crate::completion::{Completion, Deferred, WriteHandle};
use crate::executor::{compress_async, PeriodicHandle, PeriodicScheduler, TaskQueue};
use crate::format::header::COMPLETION_FLAG_OFFSET;
use crate::rate_limiter::enforce_snapshot_rate_limit;
use crate::testing::check_write;
use parking_lot::Mutex;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tablesnap_core::{Result, SnapshotConfig, SnapshotError, TableId};
use tracing::{debug, info, warn};

/// Written-but-unsynced extent of the file and the permits it holds
#[derive(Debug, Default)]
struct SyncState {
    synced_to: u64,
    written_to: u64,
    held_permits: u64,
    advised_from: u64,
    synced_since_advice: u64,
}

struct BufferedShared {
    core: TargetCore,
    file: Mutex<Option<Arc<File>>>,
    write_offset: AtomicU64,
    sync: Mutex<SyncState>,
    resources: TargetResources,
    sync_threshold: u64,
    fadvise_bytes: u64,
}

impl HasCore for BufferedShared {
    fn core(&self) -> &TargetCore {
        &self.core
    }
}

/// Snapshot target writing through the page cache
pub struct DefaultSnapshotDataTarget {
    shared: Arc<BufferedShared>,
    queue: TaskQueue,
    sync_task: Mutex<Option<PeriodicHandle>>,
}

impl DefaultSnapshotDataTarget {
    /// Create the file, write its header and start the sync task.
    pub fn open(
        spec: &TargetSpec,
        config: &SnapshotConfig,
        resources: TargetResources,
    ) -> Result<Self> {
        let header = build_header(spec)?;
        let file = sys::create_buffered(&spec.path)?;
        check_write(resources.faults.as_deref())?;
        sys::write_all_at(&file, header.as_bytes(), 0)?;
        let header_len = header.len() as u64;

        let shared = Arc::new(BufferedShared {
            core: TargetCore::new(spec.path.clone(), TargetStrategy::Buffered),
            file: Mutex::new(Some(Arc::new(file))),
            write_offset: AtomicU64::new(header_len),
            sync: Mutex::new(SyncState {
                written_to: header_len,
                ..SyncState::default()
            }),
            resources,
            sync_threshold: config.sync_threshold_bytes,
            fadvise_bytes: config.fadvise_bytes,
        });
        shared.core.add_bytes_written(header_len);

        let queue = TaskQueue::new(format!("snapshot-write-{}", file_label(&spec.path)))?;

        let sync_shared = Arc::clone(&shared);
        let sync_task = PeriodicScheduler::global().schedule(
            Duration::from_millis(config.sync_frequency_ms),
            move || sync_shared.sync_pass(),
        );

        info!(
            path = %spec.path.display(),
            table = %spec.metadata.table_name,
            header_bytes = header_len,
            "Opened buffered snapshot target"
        );

        Ok(DefaultSnapshotDataTarget {
            shared,
            queue,
            sync_task: Mutex::new(Some(sync_task)),
        })
    }

    /// Permits held for written but not yet synced bytes.
    pub fn held_permits(&self) -> u64 {
        self.shared.sync.lock().held_permits
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string())
}

impl BufferedShared {
    fn file(&self) -> Option<Arc<File>> {
        self.file.lock().clone()
    }

    /// Runs on the write thread, strictly in submission order.
    fn write_block(
        &self,
        compressed: Deferred<Result<CompressedBlock>>,
        completion: Completion,
    ) {
        let block = match compressed.wait() {
            Some(Ok(block)) => block,
            Some(Err(e)) => {
                completion.fail(self.core.record_write_error(e));
                return;
            }
            None => {
                let err = SnapshotError::Compression("compression task abandoned".to_string());
                completion.fail(self.core.record_write_error(err));
                return;
            }
        };

        // An earlier block failed after this one was queued
        if let Some(err) = self.core.write_error() {
            completion.fail(err);
            return;
        }
        let file = match self.file() {
            Some(file) => file,
            None => {
                completion.fail(SnapshotError::TargetClosed);
                return;
            }
        };

        let framed = block.to_framed();
        let len = framed.len() as u64;
        let held = self.resources.budget.acquire(len);
        enforce_snapshot_rate_limit(&self.resources.rate_limiter, framed.len());

        let offset = self.write_offset.load(Ordering::Acquire);
        let written = check_write(self.resources.faults.as_deref())
            .and_then(|()| sys::write_all_at(&file, &framed, offset));
        match written {
            Ok(()) => {
                self.write_offset.store(offset + len, Ordering::Release);
                {
                    let mut sync = self.sync.lock();
                    sync.written_to = offset + len;
                    sync.held_permits += held;
                }
                self.core.add_bytes_written(len);
                completion.succeed();
            }
            Err(e) => {
                self.resources.budget.release(held);
                completion.fail(self.core.record_write_error(e.into()));
            }
        }
    }

    /// Periodic sync of the unsynced extent.
    fn sync_pass(&self) {
        let threshold = if self.resources.budget.needs_release() {
            0
        } else {
            self.sync_threshold
        };
        let (start, end, held) = {
            let mut sync = self.sync.lock();
            let unsynced = sync.written_to - sync.synced_to;
            if unsynced == 0 || unsynced < threshold {
                return;
            }
            let range = (sync.synced_to, sync.written_to, sync.held_permits);
            sync.synced_to = sync.written_to;
            sync.held_permits = 0;
            range
        };
        let file = match self.file() {
            Some(file) => file,
            None => {
                self.resources.budget.release(held);
                return;
            }
        };

        let synced = sys::sync_range(&file, start, end - start);
        self.resources.budget.release(held);
        if let Err(e) = synced {
            self.core.record_write_error(e.into());
            return;
        }
        debug!(
            path = %self.core.path().display(),
            offset = start,
            len = end - start,
            released = held,
            "Synced snapshot extent"
        );

        let advise = {
            let mut sync = self.sync.lock();
            sync.synced_since_advice += end - start;
            if sync.synced_since_advice > self.fadvise_bytes {
                let from = sync.advised_from;
                sync.advised_from = end;
                sync.synced_since_advice = 0;
                Some((from, end))
            } else {
                None
            }
        };
        if let Some((from, to)) = advise {
            match sys::fadvise_dontneed(&file, from, to - from) {
                Ok(()) => debug!(offset = from, len = to - from, "Dropped synced snapshot pages"),
                Err(e) => warn!(error = %e, "posix_fadvise failed"),
            }
        }
    }

    /// Give back every permit still held.
    fn release_all_permits(&self) {
        let held = std::mem::take(&mut self.sync.lock().held_permits);
        self.resources.budget.release(held);
    }
}

impl SnapshotDataTarget for DefaultSnapshotDataTarget {
    fn write(&self, supplier: BlockSupplier, table_id: TableId) -> WriteHandle {
        let block = match self.shared.core.admit(supplier, table_id) {
            Ok(BlockPayload::Pending(block)) => block,
            Ok(BlockPayload::Empty) => return WriteHandle::completed(Ok(())),
            Err(rejected) => return rejected,
        };

        let (handle, completion) = WriteHandle::pending();
        let outstanding = Outstanding::start(&self.shared);
        let compressed = compress_async(Arc::clone(&self.shared.resources.codec), block);
        let submitted = self.queue.submit(move || {
            outstanding.owner().write_block(compressed, completion);
            drop(outstanding);
        });
        if let Err(e) = submitted {
            // The closure (and with it the completion) was dropped by the queue
            warn!(error = %e, "Snapshot write queue rejected block");
        }
        handle
    }

    fn close(&self) -> Result<()> {
        self.shared.core.begin_close()?;
        self.shared.core.wait_drained();

        let sync_task = self.sync_task.lock().take();
        if let Some(mut task) = sync_task {
            task.cancel_and_wait();
        }

        let file = self.shared.file.lock().take();
        if let Some(file) = file {
            if let Err(e) = file.sync_all() {
                self.shared.core.record_write_error(e.into());
            }
            if self.shared.core.is_clean() {
                let patched = check_write(self.shared.resources.faults.as_deref())
                    .and_then(|()| sys::write_all_at(&file, &[1u8], COMPLETION_FLAG_OFFSET as u64))
                    .and_then(|()| file.sync_all());
                if let Err(e) = patched {
                    self.shared.core.record_write_error(e.into());
                }
            }
        }
        self.shared.release_all_permits();
        self.queue.shutdown();

        info!(
            path = %self.shared.core.path().display(),
            bytes = self.shared.core.bytes_written(),
            completed = self.shared.core.is_clean(),
            "Closed buffered snapshot target"
        );
        self.shared.core.finish_close()
    }

    fn bytes_written(&self) -> u64 {
        self.shared.core.bytes_written()
    }

    fn last_write_error(&self) -> Option<SnapshotError> {
        self.shared.core.write_error()
    }

    fn report_serialization_failure(&self, err: SnapshotError) {
        self.shared.core.report_serialization_failure(err)
    }

    fn serialization_error(&self) -> Option<SnapshotError> {
        self.shared.core.serialization_error()
    }

    fn set_on_close_handler(&self, handler: OnCloseHandler) {
        self.shared.core.set_on_close_handler(handler)
    }

    fn path(&self) -> &Path {
        self.shared.core.path()
    }

    fn strategy(&self) -> TargetStrategy {
        TargetStrategy::Buffered
    }
}

impl Drop for DefaultSnapshotDataTarget {
    fn drop(&mut self) {
        if !self.shared.core.is_closed() {
            warn!(path = %self.shared.core.path().display(), "Snapshot target dropped without close");
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::IdentityCodec;
    use crate::format::block::BlockReader;
    use crate::format::header::{HeaderView, SnapshotMetadata};
    use crate::target::TableBlock;
    use crate::testing::FaultInjector;
    use tablesnap_core::{HostId, PartitionId, TxnId};
    use tempfile::tempdir;

    fn spec(dir: &Path) -> TargetSpec {
        let meta = SnapshotMetadata::new(
            TxnId(1),
            HostId(0),
            "c",
            "d",
            "T",
            false,
            vec![PartitionId(0)],
            1,
            0,
        );
        TargetSpec::new(dir.join("t.vpt"), meta, b"schema".to_vec())
    }

    fn block(partition: i32, fill: u8, len: usize) -> BlockSupplier {
        Box::new(move || {
            let mut raw = partition.to_be_bytes().to_vec();
            raw.extend(std::iter::repeat(fill).take(len));
            BlockPayload::Pending(TableBlock::from_payload(raw))
        })
    }

    #[test]
    fn test_blocks_written_in_order_and_completed() {
        let dir = tempdir().unwrap();
        let config = SnapshotConfig::for_testing();
        let resources = TargetResources::isolated(&config);
        let target = DefaultSnapshotDataTarget::open(&spec(dir.path()), &config, resources).unwrap();

        let handles: Vec<_> = (0..20)
            .map(|i| target.write(block(i, i as u8, 1000 + i as usize * 37), TableId(1)))
            .collect();
        for h in &handles {
            h.wait().unwrap();
        }
        target.close().unwrap();

        let bytes = std::fs::read(dir.path().join("t.vpt")).unwrap();
        let header = HeaderView::parse(&bytes).unwrap();
        assert!(header.completed);
        let partitions: Vec<i32> = BlockReader::new(&bytes, header.total_len())
            .map(|b| b.unwrap().partition_id.0)
            .collect();
        assert_eq!(partitions, (0..20).collect::<Vec<_>>());
        assert_eq!(target.bytes_written(), bytes.len() as u64);
    }

    #[test]
    fn test_empty_payload_completes_without_io() {
        let dir = tempdir().unwrap();
        let config = SnapshotConfig::for_testing();
        let target =
            DefaultSnapshotDataTarget::open(&spec(dir.path()), &config, TargetResources::isolated(&config))
                .unwrap();
        let before = target.bytes_written();
        target
            .write(Box::new(|| BlockPayload::Empty), TableId(1))
            .wait()
            .unwrap();
        assert_eq!(target.bytes_written(), before);
        target.close().unwrap();
    }

    #[test]
    fn test_failure_poisons_and_leaves_incomplete() {
        let dir = tempdir().unwrap();
        let config = SnapshotConfig::for_testing();
        let faults = FaultInjector::new();
        // Write 1 is the header
        faults.fail_nth_write(3);
        let resources = TargetResources::isolated(&config)
            .with_codec(Arc::new(IdentityCodec))
            .with_faults(Arc::clone(&faults));
        let target = DefaultSnapshotDataTarget::open(&spec(dir.path()), &config, resources).unwrap();

        let first = target.write(block(0, 1, 100), TableId(1));
        let second = target.write(block(1, 2, 100), TableId(1));
        first.wait().unwrap();
        assert!(second.wait().is_err());
        assert!(target.last_write_error().is_some());

        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let c = Arc::clone(&called);
        let late = target.write(
            Box::new(move || {
                c.store(true, Ordering::Release);
                BlockPayload::Empty
            }),
            TableId(1),
        );
        assert!(late.is_done());
        assert!(late.wait().is_err());
        assert!(called.load(Ordering::Acquire));

        assert!(target.close().is_err());
        let bytes = std::fs::read(dir.path().join("t.vpt")).unwrap();
        assert!(!HeaderView::parse(&bytes).unwrap().completed);
        assert_eq!(faults.writes_seen(), 3);
    }

    #[test]
    fn test_serialization_failure_does_not_poison() {
        let dir = tempdir().unwrap();
        let config = SnapshotConfig::for_testing();
        let target =
            DefaultSnapshotDataTarget::open(&spec(dir.path()), &config, TargetResources::isolated(&config))
                .unwrap();
        target.report_serialization_failure(SnapshotError::serialization("bad tuple"));
        target.write(block(0, 0, 10), TableId(1)).wait().unwrap();
        let err = target.close().unwrap_err();
        assert!(matches!(err, SnapshotError::Serialization(_)));
        let bytes = std::fs::read(dir.path().join("t.vpt")).unwrap();
        assert!(!HeaderView::parse(&bytes).unwrap().completed);
    }

    #[test]
    fn test_permits_released_by_sync_and_close() {
        let dir = tempdir().unwrap();
        let config = SnapshotConfig::for_testing();
        let resources = TargetResources::isolated(&config).with_codec(Arc::new(IdentityCodec));
        let budget = Arc::clone(&resources.budget);
        let target = DefaultSnapshotDataTarget::open(&spec(dir.path()), &config, resources).unwrap();

        for i in 0..8 {
            target.write(block(i, 0, 64 * 1024), TableId(1)).wait().unwrap();
        }
        assert!(target.held_permits() <= budget.capacity());
        target.close().unwrap();
        assert_eq!(target.held_permits(), 0);
        assert_eq!(budget.available(), budget.capacity());
    }

    #[test]
    fn test_close_twice_and_write_after_close() {
        let dir = tempdir().unwrap();
        let config = SnapshotConfig::for_testing();
        let target =
            DefaultSnapshotDataTarget::open(&spec(dir.path()), &config, TargetResources::isolated(&config))
                .unwrap();
        target.close().unwrap();
        assert!(matches!(target.close(), Err(SnapshotError::TargetClosed)));
        let err = target.write(block(0, 0, 4), TableId(1)).wait().unwrap_err();
        assert!(matches!(err, SnapshotError::TargetClosed));
    }
}
