//! Shared periodic scheduler for snapshot housekeeping.
//!
//! One thread runs every registered periodic task (sync-file-range and
//! fadvise passes for buffered targets). Cancellation is cooperative:
//! [`PeriodicHandle::cancel_and_wait`] returns only after any in-progress run
//! of the task has finished, so the caller can issue a final fsync knowing
//! no sync pass is still touching the file.

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

type PeriodicTask = Box<dyn FnMut() + Send>;

struct Entry {
    id: u64,
    period: Duration,
    next_run: Instant,
    /// `None` while the task is running on the scheduler thread
    task: Option<PeriodicTask>,
    cancelled: bool,
}

struct SchedulerState {
    entries: Vec<Entry>,
    next_id: u64,
    shutdown: bool,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    changed: Condvar,
}

/// Runs periodic tasks on a single background thread
pub struct PeriodicScheduler {
    inner: Arc<SchedulerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

static GLOBAL_SCHEDULER: Lazy<PeriodicScheduler> = Lazy::new(|| {
    PeriodicScheduler::new("tablesnap-sync")
        .unwrap_or_else(|e| tablesnap_core::fatal_invariant(format!("cannot start sync scheduler: {}", e)))
});

impl PeriodicScheduler {
    /// Start a scheduler whose thread is named `name`.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(SchedulerState {
                entries: Vec::new(),
                next_id: 0,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });
        let inner_clone = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || scheduler_loop(&inner_clone))?;
        Ok(PeriodicScheduler {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Process-wide scheduler shared by all snapshot targets.
    pub fn global() -> &'static PeriodicScheduler {
        &GLOBAL_SCHEDULER
    }

    /// Run `task` every `period`, first run one period from now.
    pub fn schedule(
        &self,
        period: Duration,
        task: impl FnMut() + Send + 'static,
    ) -> PeriodicHandle {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(Entry {
            id,
            period,
            next_run: Instant::now() + period,
            task: Some(Box::new(task)),
            cancelled: false,
        });
        self.inner.changed.notify_all();
        PeriodicHandle {
            id,
            inner: Arc::clone(&self.inner),
            cancelled: false,
        }
    }

    /// Number of registered, uncancelled tasks.
    pub fn task_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .filter(|e| !e.cancelled)
            .count()
    }

    /// Stop the scheduler thread. Registered tasks never run again.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.changed.notify_all();
        }
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cancellation handle for a periodic task
pub struct PeriodicHandle {
    id: u64,
    inner: Arc<SchedulerInner>,
    cancelled: bool,
}

impl PeriodicHandle {
    /// Cancel the task and wait until no run of it is in progress.
    pub fn cancel_and_wait(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        let mut state = self.inner.state.lock();
        loop {
            let running = match state.entries.iter_mut().find(|e| e.id == self.id) {
                Some(entry) => {
                    entry.cancelled = true;
                    entry.task.is_none()
                }
                None => false,
            };
            if !running {
                break;
            }
            self.inner.changed.wait(&mut state);
        }
        state.entries.retain(|e| e.id != self.id);
        self.inner.changed.notify_all();
        debug!(task_id = self.id, "Periodic task cancelled");
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.cancel_and_wait();
    }
}

fn scheduler_loop(inner: &SchedulerInner) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        let due = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.cancelled && e.task.is_some())
            .min_by_key(|(_, e)| e.next_run)
            .map(|(i, e)| (i, e.next_run));

        match due {
            None => inner.changed.wait(&mut state),
            Some((_, next_run)) if next_run > now => {
                inner.changed.wait_until(&mut state, next_run);
            }
            Some((idx, _)) => {
                let id = state.entries[idx].id;
                let mut task = match state.entries[idx].task.take() {
                    Some(t) => t,
                    None => continue,
                };

                drop(state);
                if let Err(e) =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task()))
                {
                    error!(
                        task_id = id,
                        panic = e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)"),
                        "periodic snapshot task panicked"
                    );
                }
                state = inner.state.lock();

                if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
                    entry.task = Some(task);
                    entry.next_run = Instant::now() + entry.period;
                }
                inner.changed.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_task_runs_periodically() {
        let scheduler = PeriodicScheduler::new("test-periodic").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut handle = scheduler.schedule(Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::Relaxed);
        });

        std::thread::sleep(Duration::from_millis(100));
        handle.cancel_and_wait();
        assert!(count.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn test_cancel_waits_for_running_task() {
        let scheduler = PeriodicScheduler::new("test-cancel").unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let mut handle = scheduler.schedule(Duration::from_millis(1), move || {
            s.store(true, Ordering::Release);
            std::thread::sleep(Duration::from_millis(50));
            f.store(true, Ordering::Release);
        });

        while !started.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.cancel_and_wait();
        assert!(finished.load(Ordering::Acquire));
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_cancelled_task_never_runs_again() {
        let scheduler = PeriodicScheduler::new("test-stop").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut handle = scheduler.schedule(Duration::from_millis(2), move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        std::thread::sleep(Duration::from_millis(20));
        handle.cancel_and_wait();
        let after_cancel = count.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::Relaxed), after_cancel);
    }

    #[test]
    fn test_independent_tasks() {
        let scheduler = PeriodicScheduler::new("test-multi").unwrap();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let (ac, bc) = (Arc::clone(&a), Arc::clone(&b));
        let mut ha = scheduler.schedule(Duration::from_millis(3), move || {
            ac.fetch_add(1, Ordering::Relaxed);
        });
        let mut hb = scheduler.schedule(Duration::from_millis(3), move || {
            bc.fetch_add(1, Ordering::Relaxed);
        });
        std::thread::sleep(Duration::from_millis(60));
        ha.cancel_and_wait();
        hb.cancel_and_wait();
        assert!(a.load(Ordering::Relaxed) > 0);
        assert!(b.load(Ordering::Relaxed) > 0);
    }
}
