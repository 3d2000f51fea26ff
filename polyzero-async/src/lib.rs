//! POLYZERO Async - Lock-free worker pool for rollout batches
//!
//! This crate provides the scheduler under the search engine:
//! - Fixed set of long-lived worker threads, round-robin dispatch
//! - Lock-free per-thread intake queues with a semaphore wakeup
//! - Per-worker priority re-ordering (lowest priority value first)
//! - A task-completion barrier (`Task`) for sweep synchronisation
//!
//! Ordering guarantees are deliberately weak: enqueue order is not
//! preserved, priority is a per-worker fairness hint, and there is no
//! fairness across workers.

mod task;

pub use task::Task;

use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};

thread_local! {
    static THREAD_INDEX: Cell<i32> = const { Cell::new(-1) };
}

/// Index of the pool worker running the current thread, or -1 outside the
/// pool. Used by callers as a scheduling priority hint.
pub fn current_thread_index() -> i32 {
    THREAD_INDEX.with(|c| c.get())
}

// ============================================================================
// JOB SLOTS AND HANDLES
// ============================================================================

/// Reusable job slot: a closure plus its scheduling priority.
///
/// The slot is shared between the owning `Handle` and the worker queues, so
/// re-enqueueing a handle never allocates.
pub(crate) struct JobSlot {
    priority: AtomicI32,
    func: Mutex<Box<dyn FnMut() + Send>>,
}

impl JobSlot {
    fn run(&self) {
        (self.func.lock())();
    }
}

type Job = Arc<JobSlot>;

/// Owner of a job slot bound to one worker thread.
///
/// A handle may be enqueued repeatedly; each enqueue re-runs the closure.
pub struct Handle {
    slot: Job,
    thread: ThreadId,
}

impl Handle {
    /// Scheduling priority hint; lower values run earlier on the worker.
    pub fn set_priority(&self, value: i32) {
        self.slot.priority.store(value, Ordering::Relaxed);
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

// ============================================================================
// WORKERS
// ============================================================================

/// Identifier of one worker in a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadId(pub(crate) usize);

struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }
}

struct WorkerShared {
    intake: SegQueue<Job>,
    sem: Semaphore,
    dead: AtomicBool,
}

struct Worker {
    shared: Arc<WorkerShared>,
    join: Option<JoinHandle<()>>,
}

/// Heap entry; ordered so that `BinaryHeap::pop` yields the lowest priority
/// first, FIFO among equals.
struct QueuedJob {
    priority: i32,
    seq: u64,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedJob {}
impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

fn worker_loop(shared: Arc<WorkerShared>, index: usize) {
    THREAD_INDEX.with(|c| c.set(index as i32));

    let mut internal: BinaryHeap<QueuedJob> = BinaryHeap::new();
    let mut seq: u64 = 0;

    let mut push = |heap: &mut BinaryHeap<QueuedJob>, seq: &mut u64, job: Job| {
        heap.push(QueuedJob {
            priority: job.priority.load(Ordering::Relaxed),
            seq: *seq,
            job,
        });
        *seq += 1;
    };

    loop {
        // Block until there is at least one job or the pool is shutting down.
        let job = loop {
            if let Some(job) = shared.intake.pop() {
                break job;
            }
            if shared.dead.load(Ordering::Acquire) {
                return;
            }
            shared.sem.wait();
        };

        // Fast path: nothing else pending, run directly.
        if internal.is_empty() && shared.intake.is_empty() {
            job.run();
            continue;
        }

        // Merge everything available and run in ascending priority order
        // until both queues are empty.
        push(&mut internal, &mut seq, job);
        loop {
            while let Some(job) = shared.intake.pop() {
                push(&mut internal, &mut seq, job);
            }
            match internal.pop() {
                Some(entry) => entry.job.run(),
                None => break,
            }
        }
    }
}

// ============================================================================
// POOL
// ============================================================================

/// Fixed pool of long-lived worker threads.
pub struct Threads {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl Threads {
    /// Spawn `n` workers (at least one).
    pub fn new(n: usize) -> Self {
        let n = n.max(1);
        tracing::debug!("starting {} async workers", n);
        let workers = (0..n)
            .map(|i| {
                let shared = Arc::new(WorkerShared {
                    intake: SegQueue::new(),
                    sem: Semaphore::new(),
                    dead: AtomicBool::new(false),
                });
                let entry = Arc::clone(&shared);
                let join = std::thread::Builder::new()
                    .name(format!("async-{i}"))
                    .spawn(move || worker_loop(entry, i))
                    .unwrap();
                Worker {
                    shared,
                    join: Some(join),
                }
            })
            .collect();
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Pick a worker round-robin.
    pub fn get_thread(&self) -> ThreadId {
        ThreadId(self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len())
    }

    /// Wrap a closure in a reusable handle bound to `thread`.
    pub fn get_handle(&self, thread: ThreadId, f: impl FnMut() + Send + 'static) -> Handle {
        Handle {
            slot: Arc::new(JobSlot {
                priority: AtomicI32::new(0),
                func: Mutex::new(Box::new(f)),
            }),
            thread,
        }
    }

    /// Post a handle's job to its worker.
    pub fn enqueue(&self, handle: &Handle) {
        let worker = &self.workers[handle.thread.0];
        worker.shared.intake.push(Arc::clone(&handle.slot));
        worker.shared.sem.post();
    }
}

impl Drop for Threads {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.shared.dead.store(true, Ordering::Release);
            worker.shared.sem.post();
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}

static GLOBAL: OnceLock<Arc<Threads>> = OnceLock::new();

/// Process-wide pool, sized to the machine, created on first use.
pub fn global() -> &'static Arc<Threads> {
    GLOBAL.get_or_init(|| Arc::new(Threads::new(num_cpus::get())))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_round_robin_dispatch() {
        let pool = Threads::new(3);
        let a = pool.get_thread();
        let b = pool.get_thread();
        let c = pool.get_thread();
        let d = pool.get_thread();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, d);
    }

    #[test]
    fn test_handle_runs_on_pool_thread() {
        let pool = Arc::new(Threads::new(2));
        let task = Task::new(Arc::clone(&pool));
        let seen = Arc::new(Mutex::new(-2i32));

        let seen2 = Arc::clone(&seen);
        let handle = task.get_handle(pool.get_thread(), move || {
            *seen2.lock() = current_thread_index();
        });
        task.enqueue(&handle);
        task.wait();

        assert!(*seen.lock() >= 0);
        assert_eq!(current_thread_index(), -1);
    }

    #[test]
    fn test_reenqueue_reuses_closure_state() {
        let pool = Arc::new(Threads::new(1));
        let task = Task::new(Arc::clone(&pool));
        let count = Arc::new(AtomicUsize::new(0));

        let count2 = Arc::clone(&count);
        let mut local = 0usize;
        let handle = task.get_handle(pool.get_thread(), move || {
            local += 1;
            count2.store(local, Ordering::SeqCst);
        });

        for _ in 0..5 {
            task.enqueue(&handle);
            task.wait();
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_priority_order_on_one_worker() {
        let pool = Arc::new(Threads::new(1));
        let task = Task::new(Arc::clone(&pool));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the worker so the remaining jobs pile up in the intake.
        let gate = Arc::new(AtomicBool::new(false));
        let gate2 = Arc::clone(&gate);
        let blocker = task.get_handle(pool.get_thread(), move || {
            while !gate2.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        task.enqueue(&blocker);

        let mut handles = Vec::new();
        for priority in [3, 1, 2] {
            let order2 = Arc::clone(&order);
            let handle = task.get_handle(ThreadId(0), move || {
                order2.lock().push(priority);
            });
            handle.set_priority(priority);
            task.enqueue(&handle);
            handles.push(handle);
        }

        gate.store(true, Ordering::Release);
        task.wait();

        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_many_tasks_barrier() {
        let pool = Arc::new(Threads::new(4));
        let task = Task::new(Arc::clone(&pool));
        let count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let count2 = Arc::clone(&count);
            let handle = task.get_handle(pool.get_thread(), move || {
                count2.fetch_add(1, Ordering::SeqCst);
            });
            task.enqueue(&handle);
            handles.push(handle);
        }
        task.wait();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_global_pool() {
        assert!(!global().is_empty());
    }
}
