//! Task-completion barrier

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{Handle, ThreadId, Threads};

struct TaskInner {
    live: AtomicI32,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Barrier over a group of enqueued jobs.
///
/// Every handle created through `get_handle` decrements the live count when
/// its job finishes; `wait` blocks until the count returns to zero.
/// Dropping a task waits.
pub struct Task {
    inner: Arc<TaskInner>,
    threads: Arc<Threads>,
}

impl Task {
    pub fn new(threads: Arc<Threads>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                live: AtomicI32::new(0),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
            threads,
        }
    }

    /// Wrap `f` so that its completion is tracked by this barrier.
    pub fn get_handle(&self, thread: ThreadId, mut f: impl FnMut() + Send + 'static) -> Handle {
        let inner = Arc::clone(&self.inner);
        self.threads.get_handle(thread, move || {
            f();
            if inner.live.fetch_sub(1, Ordering::AcqRel) == 1 {
                // Take the lock so a concurrent `wait` cannot miss the wakeup
                // between its count check and its sleep.
                let _guard = inner.lock.lock();
                inner.cond.notify_all();
            }
        })
    }

    /// Post a handle's job and account for it.
    pub fn enqueue(&self, handle: &Handle) {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        self.threads.enqueue(handle);
    }

    /// Block until every enqueued job has finished.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock();
        while self.inner.live.load(Ordering::Acquire) != 0 {
            self.inner.cond.wait(&mut guard);
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.wait();
    }
}
