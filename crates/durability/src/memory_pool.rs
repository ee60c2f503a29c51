//! Page-aligned buffer pool for direct-I/O targets.
//!
//! A pool lives for one snapshot generation. Each holder (the target factory
//! and every direct-I/O target it creates) keeps a [`PoolRef`]. While at least
//! one reference is alive, dropped pages go back to the spare queue; once the
//! last reference is gone the spares are freed and any page still in flight
//! is freed when it is dropped.

use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tablesnap_core::fatal_invariant;
use tracing::debug;

// ============================================================================
// AlignedBuffer
// ============================================================================

/// Heap buffer whose address and length are multiples of its alignment
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `len` bytes aligned to `align`.
    pub fn zeroed(len: usize, align: usize) -> Self {
        let layout = match Layout::from_size_align(len.max(1), align) {
            Ok(layout) => layout,
            Err(e) => fatal_invariant(format!(
                "invalid aligned buffer layout len={} align={}: {}",
                len, align, e
            )),
        };
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        AlignedBuffer { ptr, layout }
    }

    /// Alignment of the buffer.
    pub fn align(&self) -> usize {
        self.layout.align()
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is a live allocation of layout.size() initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// SAFETY: AlignedBuffer uniquely owns its allocation, like Vec<u8>.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

// ============================================================================
// MemoryPool
// ============================================================================

struct PoolState {
    refs: usize,
    spare: Vec<AlignedBuffer>,
}

struct PoolInner {
    page_size: usize,
    state: Mutex<PoolState>,
    allocated: AtomicU64,
    acquired: AtomicU64,
    returned: AtomicU64,
    freed: AtomicU64,
}

impl PoolInner {
    fn acquire(inner: &Arc<PoolInner>) -> PooledPage {
        inner.acquired.fetch_add(1, Ordering::Relaxed);
        let reused = inner.state.lock().spare.pop();
        let buf = match reused {
            Some(mut buf) => {
                buf.fill(0);
                buf
            }
            None => {
                inner.allocated.fetch_add(1, Ordering::Relaxed);
                AlignedBuffer::zeroed(inner.page_size, inner.page_size)
            }
        };
        PooledPage {
            buf: Some(buf),
            pool: Arc::clone(inner),
        }
    }

    fn give_back(&self, buf: AlignedBuffer) {
        let mut state = self.state.lock();
        if state.refs > 0 {
            state.spare.push(buf);
            self.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            drop(state);
            drop(buf);
            self.freed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Pool of page-aligned buffers shared by one snapshot generation
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

/// Counters describing pool traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers allocated from the system
    pub allocated: u64,
    /// Pages handed out
    pub acquired: u64,
    /// Pages returned to the spare queue
    pub returned: u64,
    /// Buffers freed to the system
    pub freed: u64,
    /// Buffers currently in the spare queue
    pub spare: usize,
    /// Live references
    pub refs: usize,
}

impl PoolStats {
    /// Buffers allocated and neither spare nor freed, i.e. pages in use.
    pub fn outstanding(&self) -> u64 {
        self.allocated
            .saturating_sub(self.freed)
            .saturating_sub(self.spare as u64)
    }
}

impl MemoryPool {
    /// Empty pool of `page_size` pages with no references.
    pub fn new(page_size: usize) -> Self {
        MemoryPool {
            inner: Arc::new(PoolInner {
                page_size,
                state: Mutex::new(PoolState {
                    refs: 0,
                    spare: Vec::new(),
                }),
                allocated: AtomicU64::new(0),
                acquired: AtomicU64::new(0),
                returned: AtomicU64::new(0),
                freed: AtomicU64::new(0),
            }),
        }
    }

    /// Take a reference that keeps returned pages pooled.
    pub fn reference(&self) -> PoolRef {
        self.inner.state.lock().refs += 1;
        PoolRef {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Page size of the pool.
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            returned: self.inner.returned.load(Ordering::Relaxed),
            freed: self.inner.freed.load(Ordering::Relaxed),
            spare: state.spare.len(),
            refs: state.refs,
        }
    }
}

/// Counted reference to a [`MemoryPool`]
pub struct PoolRef {
    inner: Arc<PoolInner>,
}

impl PoolRef {
    /// Reuse a spare page or allocate a new one. The page is zeroed.
    pub fn acquire(&self) -> PooledPage {
        PoolInner::acquire(&self.inner)
    }

    /// Page size of the pool.
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// The pool this reference belongs to.
    pub fn pool(&self) -> MemoryPool {
        MemoryPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Clone for PoolRef {
    fn clone(&self) -> Self {
        self.pool().reference()
    }
}

impl Drop for PoolRef {
    fn drop(&mut self) {
        let spare = {
            let mut state = self.inner.state.lock();
            state.refs -= 1;
            if state.refs > 0 {
                return;
            }
            std::mem::take(&mut state.spare)
        };
        let count = spare.len() as u64;
        drop(spare);
        self.inner.freed.fetch_add(count, Ordering::Relaxed);
        debug!(freed = count, "Released last memory pool reference");
    }
}

/// A page on loan from a [`MemoryPool`]
pub struct PooledPage {
    buf: Option<AlignedBuffer>,
    pool: Arc<PoolInner>,
}

impl PooledPage {
    /// Page length in bytes.
    pub fn page_size(&self) -> usize {
        self.pool.page_size
    }

    /// A new page from the same pool with identical contents.
    pub fn duplicate(&self) -> PooledPage {
        let mut page = PoolInner::acquire(&self.pool);
        page.copy_from_slice(self);
        page
    }
}

impl Deref for PooledPage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => buf,
            None => &[],
        }
    }
}

impl DerefMut for PooledPage {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            Some(buf) => buf,
            None => &mut [],
        }
    }
}

impl Drop for PooledPage {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer_alignment() {
        let buf = AlignedBuffer::zeroed(8192, 4096);
        assert_eq!(buf.len(), 8192);
        assert_eq!(buf.as_ptr() as usize % 4096, 0);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_pages_are_reused_while_referenced() {
        let pool = MemoryPool::new(4096);
        let r = pool.reference();
        let mut page = r.acquire();
        page[0] = 0xAB;
        drop(page);
        let page = r.acquire();
        assert_eq!(page[0], 0, "reused pages are zeroed");
        drop(page);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.returned, 2);
        assert_eq!(stats.spare, 1);
    }

    #[test]
    fn test_last_reference_frees_spares() {
        let pool = MemoryPool::new(4096);
        let a = pool.reference();
        let b = a.clone();
        let pages: Vec<_> = (0..3).map(|_| a.acquire()).collect();
        drop(pages);
        drop(a);
        assert_eq!(pool.stats().spare, 3);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.spare, 0);
        assert_eq!(stats.freed, 3);
        assert_eq!(stats.allocated, stats.freed);
    }

    #[test]
    fn test_page_outliving_pool_is_freed() {
        let pool = MemoryPool::new(4096);
        let r = pool.reference();
        let page = r.acquire();
        drop(r);
        assert_eq!(pool.stats().outstanding(), 1);
        drop(page);
        let stats = pool.stats();
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.spare, 0);
        assert_eq!(stats.outstanding(), 0);
    }

    #[test]
    fn test_duplicate_copies_contents() {
        let pool = MemoryPool::new(4096);
        let r = pool.reference();
        let mut page = r.acquire();
        page[10] = 7;
        let copy = page.duplicate();
        assert_eq!(copy[10], 7);
        assert_eq!(pool.stats().refs, 1);
        drop((page, copy));
        drop(r);
        let stats = pool.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.freed, 2);
    }
}
