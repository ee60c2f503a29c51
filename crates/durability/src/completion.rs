//! Completion handles for asynchronous snapshot writes.
//!
//! A [`WriteHandle`] is the caller-visible side of one accepted write; the
//! pipeline stage that finishes the physical write holds the matching
//! [`Completion`] and fulfills it exactly once. Handles are cheap to clone and
//! can be combined with [`WriteHandle::all`] so the table streamer can hand
//! the scheduler one future per chunk regardless of fan-out.
//!
//! [`Deferred`] is the same one-shot cell carrying a value, used to pass
//! compressed blocks from the compression pool to the ordered write stages.

use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tablesnap_core::{Result, SnapshotError};

struct Cell<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Cell<T> {
    fn new(value: Option<T>) -> Arc<Self> {
        Arc::new(Cell {
            value: Mutex::new(value),
            ready: Condvar::new(),
        })
    }

    fn set(&self, v: T) -> bool {
        let mut slot = self.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(v);
        self.ready.notify_all();
        true
    }
}

fn abandoned() -> SnapshotError {
    io::Error::new(io::ErrorKind::Other, "write abandoned before completion").into()
}

// ============================================================================
// WriteHandle / Completion
// ============================================================================

/// Caller-visible completion handle for one or more snapshot writes
#[derive(Clone)]
pub struct WriteHandle {
    inner: HandleInner,
}

#[derive(Clone)]
enum HandleInner {
    Single(Arc<Cell<Result<()>>>),
    All(Vec<WriteHandle>),
}

impl WriteHandle {
    /// Create a pending handle and the completion that fulfills it.
    pub fn pending() -> (WriteHandle, Completion) {
        let cell = Cell::new(None);
        (
            WriteHandle {
                inner: HandleInner::Single(Arc::clone(&cell)),
            },
            Completion { cell: Some(cell) },
        )
    }

    /// Create a handle that is already complete.
    pub fn completed(result: Result<()>) -> WriteHandle {
        WriteHandle {
            inner: HandleInner::Single(Cell::new(Some(result))),
        }
    }

    /// Conjunction of several handles: succeeds when all succeed, fails with
    /// the first failure in submission order.
    pub fn all(handles: Vec<WriteHandle>) -> WriteHandle {
        WriteHandle {
            inner: HandleInner::All(handles),
        }
    }

    /// Block until the write has completed and return its outcome.
    pub fn wait(&self) -> Result<()> {
        match &self.inner {
            HandleInner::Single(cell) => {
                let mut slot = cell.value.lock();
                while slot.is_none() {
                    cell.ready.wait(&mut slot);
                }
                slot.clone().unwrap_or_else(|| Err(abandoned()))
            }
            HandleInner::All(handles) => {
                let mut first_err = None;
                for h in handles {
                    if let Err(e) = h.wait() {
                        first_err.get_or_insert(e);
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    /// Wait at most `timeout`; `None` if the write is still in flight.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now() + timeout;
        match &self.inner {
            HandleInner::Single(cell) => {
                let mut slot = cell.value.lock();
                while slot.is_none() {
                    if cell.ready.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
                slot.clone()
            }
            HandleInner::All(handles) => {
                let mut first_err = None;
                for h in handles {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match h.wait_timeout(remaining) {
                        None => return None,
                        Some(Err(e)) => {
                            first_err.get_or_insert(e);
                        }
                        Some(Ok(())) => {}
                    }
                }
                Some(match first_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                })
            }
        }
    }

    /// Returns `true` once every underlying write has completed.
    pub fn is_done(&self) -> bool {
        match &self.inner {
            HandleInner::Single(cell) => cell.value.lock().is_some(),
            HandleInner::All(handles) => handles.iter().all(WriteHandle::is_done),
        }
    }
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Write side of a [`WriteHandle`]
///
/// Dropping an unfulfilled completion fails the handle so waiters never hang.
pub struct Completion {
    cell: Option<Arc<Cell<Result<()>>>>,
}

impl Completion {
    /// Fulfill the handle.
    pub fn complete(mut self, result: Result<()>) {
        if let Some(cell) = self.cell.take() {
            cell.set(result);
        }
    }

    /// Fulfill the handle with success.
    pub fn succeed(self) {
        self.complete(Ok(()))
    }

    /// Fulfill the handle with a failure.
    pub fn fail(self, err: SnapshotError) {
        self.complete(Err(err))
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.set(Err(abandoned()));
        }
    }
}

// ============================================================================
// Deferred
// ============================================================================

/// One-shot value produced on one thread and consumed on another
pub struct Deferred<T> {
    cell: Arc<Cell<Option<T>>>,
}

/// Producer side of a [`Deferred`]
pub struct Promise<T> {
    cell: Option<Arc<Cell<Option<T>>>>,
}

/// Create a connected promise/deferred pair.
pub fn deferred<T>() -> (Promise<T>, Deferred<T>) {
    let cell = Cell::new(None);
    (
        Promise {
            cell: Some(Arc::clone(&cell)),
        },
        Deferred { cell },
    )
}

impl<T> Promise<T> {
    /// Publish the value.
    pub fn fulfill(mut self, value: T) {
        if let Some(cell) = self.cell.take() {
            cell.set(Some(value));
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.set(None);
        }
    }
}

impl<T> Deferred<T> {
    /// Block until the value is available. `None` if the producer was
    /// dropped without publishing.
    pub fn wait(self) -> Option<T> {
        let mut slot = self.cell.value.lock();
        while slot.is_none() {
            self.cell.ready.wait(&mut slot);
        }
        slot.take().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pending_then_complete() {
        let (handle, completion) = WriteHandle::pending();
        assert!(!handle.is_done());
        let waiter = {
            let h = handle.clone();
            thread::spawn(move || h.wait())
        };
        completion.succeed();
        assert!(waiter.join().unwrap().is_ok());
        assert!(handle.is_done());
    }

    #[test]
    fn test_dropped_completion_fails_handle() {
        let (handle, completion) = WriteHandle::pending();
        drop(completion);
        let err = handle.wait().unwrap_err();
        assert!(err.to_string().contains("abandoned"));
    }

    #[test]
    fn test_all_reports_first_failure() {
        let (h1, c1) = WriteHandle::pending();
        let (h2, c2) = WriteHandle::pending();
        let all = WriteHandle::all(vec![h1, h2, WriteHandle::completed(Ok(()))]);
        assert!(!all.is_done());
        c2.fail(SnapshotError::serialization("second"));
        c1.fail(SnapshotError::serialization("first"));
        let err = all.wait().unwrap_err();
        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn test_wait_timeout_in_flight() {
        let (handle, _completion) = WriteHandle::pending();
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_empty_all_is_done() {
        let all = WriteHandle::all(Vec::new());
        assert!(all.is_done());
        assert!(all.wait().is_ok());
    }

    #[test]
    fn test_deferred_value_crosses_threads() {
        let (promise, deferred) = deferred::<Vec<u8>>();
        thread::spawn(move || promise.fulfill(vec![1, 2, 3]));
        assert_eq!(deferred.wait(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_deferred_dropped_promise() {
        let (promise, deferred) = deferred::<u32>();
        drop(promise);
        assert_eq!(deferred.wait(), None);
    }
}
