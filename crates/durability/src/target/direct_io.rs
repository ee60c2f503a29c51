//! Direct-I/O snapshot target.
//!
//! The file is written exclusively in whole pages from page-aligned pooled
//! buffers, so it can be opened with `O_DIRECT` and bypass the page cache.
//! Two per-target stages run on dedicated threads:
//!
//! - **pack**: waits for compressed blocks in submission order, frames them and
//!   copies the framed bytes into the current page; full pages go to the
//!   write stage together with the handles of every block ending in them
//! - **write**: gathers pages and issues one vectored write per
//!   `direct_io_write_pages` pages (or on flush), then completes the handles
//!
//! The header pages are written synchronously by `open`, before any block, so
//! a file that fails later still starts with a valid incomplete header. The
//! first page is kept resident so `close` can patch the completion flag and
//! rewrite it in place. The final partial page is padded with zeros to the
//! page boundary and the file is truncated back to its logical size, or to
//! the extent known to be on disk if a write failed.

use super::native::{build_header, HasCore, Outstanding, TargetCore};
use super::sys;
use super::{
    BlockPayload, BlockSupplier, OnCloseHandler, SnapshotDataTarget, TargetResources, TargetSpec,
    TargetStrategy,
};
use crate::codec::CompressedBlock;
use crate::completion::{Completion, Deferred, WriteHandle};
use crate::executor::{compress_async, TaskQueue};
use crate::format::header::COMPLETION_FLAG_OFFSET;
use crate::memory_pool::{PoolRef, PooledPage};
use crate::rate_limiter::enforce_snapshot_rate_limit;
use crate::testing::check_write;
use parking_lot::Mutex;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tablesnap_core::{fatal_invariant, Result, SnapshotConfig, SnapshotError, TableId};
use tracing::{debug, info, warn};

/// A full (or final padded) page and the handles waiting on it
struct OutstandingWrite {
    page: PooledPage,
    /// Bytes of the page that belong to the file
    logical: usize,
    completions: Vec<Completion>,
}

/// Owned by the pack stage
struct PackState {
    pool: Option<PoolRef>,
    current: Option<PooledPage>,
    fill: usize,
    /// Handles of blocks whose last byte is in `current`
    waiting: Vec<Completion>,
    logical_len: u64,
    pages_sealed: u64,
    first_page: Option<PooledPage>,
    /// Reusable framing buffer
    scratch: Vec<u8>,
}

impl PackState {
    fn append(
        &mut self,
        page_size: usize,
        mut bytes: &[u8],
        completion: Option<Completion>,
    ) -> Vec<OutstandingWrite> {
        let mut sealed = Vec::new();
        while !bytes.is_empty() {
            if self.current.is_none() {
                let page = match &self.pool {
                    Some(pool) => pool.acquire(),
                    None => fatal_invariant("direct-I/O pack stage used after pool release"),
                };
                self.current = Some(page);
            }
            let fill = self.fill;
            let n = (page_size - fill).min(bytes.len());
            if let Some(page) = self.current.as_mut() {
                page[fill..fill + n].copy_from_slice(&bytes[..n]);
            }
            self.fill += n;
            self.logical_len += n as u64;
            bytes = &bytes[n..];

            if self.fill == page_size {
                if let Some(page) = self.current.take() {
                    sealed.push(self.seal(page, page_size));
                }
                self.fill = 0;
            }
        }
        if let Some(completion) = completion {
            match sealed.last_mut() {
                Some(last) if self.fill == 0 => last.completions.push(completion),
                _ => self.waiting.push(completion),
            }
        }
        sealed
    }

    fn seal(&mut self, page: PooledPage, logical: usize) -> OutstandingWrite {
        if logical == 0 {
            fatal_invariant("zero-length page handed to the write stage");
        }
        if self.pages_sealed == 0 {
            self.first_page = Some(page.duplicate());
        }
        self.pages_sealed += 1;
        OutstandingWrite {
            page,
            logical,
            completions: std::mem::take(&mut self.waiting),
        }
    }

    /// Seal the partial page; returns it with its zero padding.
    fn flush(&mut self, page_size: usize) -> Option<(OutstandingWrite, usize)> {
        let page = self.current.take()?;
        let fill = std::mem::replace(&mut self.fill, 0);
        Some((self.seal(page, fill), page_size - fill))
    }
}

/// Owned by the write stage
struct WriteState {
    pending: Vec<OutstandingWrite>,
    file_offset: u64,
    /// Logical bytes from offset 0 known to be on disk
    durable_len: u64,
}

struct DirectShared {
    core: TargetCore,
    file: Mutex<Option<Arc<File>>>,
    pack: Mutex<PackState>,
    writes: Mutex<WriteState>,
    write_queue: TaskQueue,
    resources: TargetResources,
    page_size: usize,
    write_pages: usize,
    padding: AtomicU64,
    extents: Mutex<Vec<(u64, usize)>>,
}

impl HasCore for DirectShared {
    fn core(&self) -> &TargetCore {
        &self.core
    }
}

/// Snapshot target writing page-aligned buffers, with `O_DIRECT` if possible
pub struct DirectIoSnapshotDataTarget {
    shared: Arc<DirectShared>,
    pack_queue: TaskQueue,
    o_direct: bool,
}

impl DirectIoSnapshotDataTarget {
    /// Create the file and write its header pages.
    ///
    /// `pool` must hand out pages of `config.page_size`.
    pub fn open(
        spec: &TargetSpec,
        config: &SnapshotConfig,
        resources: TargetResources,
        pool: PoolRef,
    ) -> Result<Self> {
        if pool.page_size() != config.page_size {
            fatal_invariant(format!(
                "memory pool page size {} does not match configured {}",
                pool.page_size(),
                config.page_size
            ));
        }
        let header = build_header(spec)?;
        let (file, o_direct) = match sys::create_direct(&spec.path) {
            Ok(file) => (file, true),
            Err(e) => {
                warn!(
                    path = %spec.path.display(),
                    error = %e,
                    "O_DIRECT unavailable, using aligned writes through the page cache"
                );
                (sys::create_buffered(&spec.path)?, false)
            }
        };

        let mut pack = PackState {
            pool: Some(pool),
            current: None,
            fill: 0,
            waiting: Vec::new(),
            logical_len: 0,
            pages_sealed: 0,
            first_page: None,
            scratch: Vec::new(),
        };
        let header_pages = pack.append(config.page_size, header.as_bytes(), None);
        // The partial header page is rewritten once blocks fill it
        let header_partial = pack.current.as_ref().map(PooledPage::duplicate);
        let mut slices: Vec<&[u8]> = header_pages.iter().map(|w| &w.page[..]).collect();
        slices.extend(header_partial.as_deref());
        let header_extent = slices.len() * config.page_size;
        check_write(resources.faults.as_deref())?;
        sys::write_vectored_all_at(&file, &slices, 0)?;
        drop(slices);
        let full_pages = (header_pages.len() * config.page_size) as u64;
        drop(header_pages);
        drop(header_partial);

        let label = spec
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        let shared = Arc::new(DirectShared {
            core: TargetCore::new(spec.path.clone(), TargetStrategy::DirectIo),
            file: Mutex::new(Some(Arc::new(file))),
            pack: Mutex::new(pack),
            writes: Mutex::new(WriteState {
                pending: Vec::new(),
                file_offset: full_pages,
                durable_len: header.len() as u64,
            }),
            write_queue: TaskQueue::new(format!("snapshot-dio-write-{}", label))?,
            resources,
            page_size: config.page_size,
            write_pages: config.direct_io_write_pages,
            padding: AtomicU64::new(0),
            extents: Mutex::new(vec![(0, header_extent)]),
        });
        shared.core.add_bytes_written(full_pages);
        let pack_queue = TaskQueue::new(format!("snapshot-dio-pack-{}", label))?;

        info!(
            path = %spec.path.display(),
            table = %spec.metadata.table_name,
            o_direct,
            page_size = config.page_size,
            "Opened direct-I/O snapshot target"
        );
        Ok(DirectIoSnapshotDataTarget {
            shared,
            pack_queue,
            o_direct,
        })
    }

    /// Whether the file was really opened with `O_DIRECT`.
    pub fn is_o_direct(&self) -> bool {
        self.o_direct
    }

    /// Alignment unit of every physical write.
    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    /// Zero bytes added to pad the final page.
    pub fn padding_bytes(&self) -> u64 {
        self.shared.padding.load(Ordering::Acquire)
    }

    /// `(offset, len)` of every physical write issued so far.
    pub fn written_extents(&self) -> Vec<(u64, usize)> {
        self.shared.extents.lock().clone()
    }
}

impl DirectShared {
    fn file(&self) -> Option<Arc<File>> {
        self.file.lock().clone()
    }

    /// Runs on the pack thread, strictly in submission order.
    fn pack_block(
        self: &Arc<Self>,
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
        if let Some(err) = self.core.write_error() {
            completion.fail(err);
            return;
        }

        let pages = {
            let mut pack = self.pack.lock();
            let mut scratch = std::mem::take(&mut pack.scratch);
            scratch.clear();
            block.write_framed(&mut scratch);
            let pages = pack.append(self.page_size, &scratch, Some(completion));
            pack.scratch = scratch;
            pages
        };
        if !pages.is_empty() {
            self.submit_pages(pages, false);
        }
    }

    fn submit_pages(self: &Arc<Self>, pages: Vec<OutstandingWrite>, flush: bool) {
        let shared = Arc::clone(self);
        if let Err(e) = self
            .write_queue
            .submit(move || shared.accept_pages(pages, flush))
        {
            // Dropping the pages fails their handles
            warn!(error = %e, "Direct-I/O write queue rejected pages");
        }
    }

    /// Runs on the write thread.
    fn accept_pages(&self, pages: Vec<OutstandingWrite>, flush: bool) {
        let mut writes = self.writes.lock();
        writes.pending.extend(pages);
        if flush || writes.pending.len() >= self.write_pages {
            let batch = std::mem::take(&mut writes.pending);
            self.write_batch(&mut writes, batch);
        }
    }

    fn write_batch(&self, writes: &mut WriteState, batch: Vec<OutstandingWrite>) {
        if batch.is_empty() {
            return;
        }
        let fail_all = |batch: Vec<OutstandingWrite>, err: SnapshotError| {
            for w in batch {
                for c in w.completions {
                    c.fail(err.clone());
                }
            }
        };
        if let Some(err) = self.core.write_error() {
            fail_all(batch, err);
            return;
        }
        let file = match self.file() {
            Some(file) => file,
            None => {
                fail_all(batch, SnapshotError::TargetClosed);
                return;
            }
        };

        let offset = writes.file_offset;
        if offset % self.page_size as u64 != 0 {
            fatal_invariant(format!("direct-I/O write offset {} is not page aligned", offset));
        }
        let total = batch.len() * self.page_size;
        enforce_snapshot_rate_limit(&self.resources.rate_limiter, total);

        let slices: Vec<&[u8]> = batch.iter().map(|w| &w.page[..]).collect();
        let result = check_write(self.resources.faults.as_deref())
            .and_then(|()| sys::write_vectored_all_at(&file, &slices, offset));
        drop(slices);

        match result {
            Ok(()) => {
                writes.file_offset += total as u64;
                self.extents.lock().push((offset, total));
                let logical: usize = batch.iter().map(|w| w.logical).sum();
                writes.durable_len = offset + logical as u64;
                self.core.add_bytes_written(logical as u64);
                debug!(
                    path = %self.core.path().display(),
                    offset,
                    pages = batch.len(),
                    "Wrote direct-I/O pages"
                );
                for w in batch {
                    for c in w.completions {
                        c.succeed();
                    }
                }
            }
            Err(e) => {
                let err = self.core.record_write_error(e.into());
                fail_all(batch, err);
            }
        }
    }

    /// Patch the completion flag into the resident first page and rewrite it.
    fn patch_first_page(&self, file: &File, first_page: Option<PooledPage>) -> Result<()> {
        let mut page = match first_page {
            Some(page) => page,
            None => fatal_invariant("direct-I/O target closed without a first page"),
        };
        page[COMPLETION_FLAG_OFFSET] = 1;
        check_write(self.resources.faults.as_deref())?;
        sys::write_all_at(file, &page, 0)?;
        self.extents.lock().push((0, page.len()));
        Ok(())
    }
}

impl SnapshotDataTarget for DirectIoSnapshotDataTarget {
    fn write(&self, supplier: BlockSupplier, table_id: TableId) -> WriteHandle {
        let block = match self.shared.core.admit(supplier, table_id) {
            Ok(BlockPayload::Pending(block)) => block,
            Ok(BlockPayload::Empty) => return WriteHandle::completed(Ok(())),
            Err(rejected) => return rejected,
        };

        let (handle, completion) = WriteHandle::pending();
        let outstanding = Outstanding::start(&self.shared);
        let compressed = compress_async(Arc::clone(&self.shared.resources.codec), block);
        let submitted = self.pack_queue.submit(move || {
            outstanding.owner().pack_block(compressed, completion);
            drop(outstanding);
        });
        if let Err(e) = submitted {
            warn!(error = %e, "Direct-I/O pack queue rejected block");
        }
        handle
    }

    fn close(&self) -> Result<()> {
        let shared = &self.shared;
        shared.core.begin_close()?;
        shared.core.wait_drained();
        self.pack_queue.drain();

        let (tail, first_page, logical_len) = {
            let mut pack = shared.pack.lock();
            let tail = pack.flush(shared.page_size);
            (tail, pack.first_page.take(), pack.logical_len)
        };
        let mut pages = Vec::new();
        if let Some((page, padding)) = tail {
            shared.padding.store(padding as u64, Ordering::Release);
            pages.push(page);
        }
        shared.submit_pages(pages, true);
        shared.write_queue.drain();

        let file = shared.file.lock().take();
        if let Some(file) = file {
            if shared.core.is_clean() {
                if let Err(e) = shared.patch_first_page(&file, first_page) {
                    shared.core.record_write_error(e);
                }
            } else {
                drop(first_page);
            }
            let len = if shared.core.write_error().is_some() {
                shared.writes.lock().durable_len.min(logical_len)
            } else {
                logical_len
            };
            let finished = file.set_len(len).and_then(|()| file.sync_all());
            if let Err(e) = finished {
                shared.core.record_write_error(e.into());
            }
        }

        // Release the generation's pool reference once no page is held here
        let pool = shared.pack.lock().pool.take();
        drop(pool);
        self.pack_queue.shutdown();
        shared.write_queue.shutdown();

        info!(
            path = %shared.core.path().display(),
            bytes = shared.core.bytes_written(),
            padding = shared.padding.load(Ordering::Acquire),
            completed = shared.core.is_clean(),
            "Closed direct-I/O snapshot target"
        );
        shared.core.finish_close()
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
        TargetStrategy::DirectIo
    }
}

impl Drop for DirectIoSnapshotDataTarget {
    fn drop(&mut self) {
        if !self.shared.core.is_closed() {
            warn!(path = %self.shared.core.path().display(), "Snapshot target dropped without close");
            let _ = self.close();
        }
    }
}
