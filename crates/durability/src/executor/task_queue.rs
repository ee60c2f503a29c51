//! Single-threaded FIFO task queue.
//!
//! Every snapshot target owns one of these per pipeline stage. Tasks run on
//! a dedicated named thread strictly in submission order, which is what keeps
//! blocks of one target contiguous and ordered on disk.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::error;

type Task = Box<dyn FnOnce() + Send>;

/// Error returned when submitting to a queue that has been shut down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task queue {0} is shut down")]
pub struct QueueClosed(pub String);

struct QueueInner {
    tasks: Mutex<VecDeque<Task>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    queue_depth: AtomicUsize,
    active: AtomicBool,
    tasks_completed: AtomicU64,
}

/// A FIFO task queue backed by exactly one worker thread
pub struct TaskQueue {
    name: String,
    inner: Arc<QueueInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Start a queue whose worker thread is named `name`.
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let inner = Arc::new(QueueInner {
            tasks: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            tasks_completed: AtomicU64::new(0),
        });

        let inner_clone = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&inner_clone))?;

        Ok(TaskQueue {
            name,
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue a task behind everything already submitted.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Result<(), QueueClosed> {
        let mut tasks = self.inner.tasks.lock();
        // Checked under the lock so no task slips in after the worker exits
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(QueueClosed(self.name.clone()));
        }
        tasks.push_back(Box::new(work));
        self.inner.queue_depth.fetch_add(1, Ordering::Release);
        drop(tasks);

        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Block until all queued and in-flight tasks have completed.
    pub fn drain(&self) {
        let mut tasks = self.inner.tasks.lock();
        while !tasks.is_empty() || self.inner.active.load(Ordering::Acquire) {
            self.inner.drain_cond.wait(&mut tasks);
        }
    }

    /// Run remaining tasks, then stop and join the worker.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        {
            let _tasks = self.inner.tasks.lock();
            self.inner.shutdown.store(true, Ordering::Release);
            self.inner.work_ready.notify_all();
        }

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if std::thread::current().id() == handle.thread().id() {
                // Shutdown from one of our own tasks; the worker exits on its own
                return;
            }
            let _ = handle.join();
        }
    }

    /// Number of tasks waiting to run.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth.load(Ordering::Relaxed)
    }

    /// Total tasks run since the queue started.
    pub fn tasks_completed(&self) -> u64 {
        self.inner.tasks_completed.load(Ordering::Relaxed)
    }

    /// Worker thread name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clears the active flag and wakes drain waiters even if a task panics.
struct ActiveTaskGuard<'a> {
    inner: &'a QueueInner,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        self.inner.tasks_completed.fetch_add(1, Ordering::Relaxed);
        let tasks = self.inner.tasks.lock();
        self.inner.active.store(false, Ordering::Release);
        if tasks.is_empty() {
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &QueueInner) {
    loop {
        let task = {
            let mut tasks = inner.tasks.lock();
            loop {
                if let Some(task) = tasks.pop_front() {
                    inner.queue_depth.fetch_sub(1, Ordering::Release);
                    inner.active.store(true, Ordering::Release);
                    break task;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut tasks);
            }
        };

        let _guard = ActiveTaskGuard { inner };

        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
            let msg = e
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| e.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "(non-string panic)".to_string());
            error!(panic = %msg, "snapshot task panicked");
        }
    }
}
