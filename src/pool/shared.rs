//! Pool with a single shared task queue.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::Sender;
use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::crash::CrashExecutor;
use crate::event::Subscription;
use crate::Action;

/// A pool of workers pulling from one shared FIFO.
///
/// Tasks submitted with [`submit`] are executed by the first worker to get
/// to them, in submission order; there is no ordering between workers.
/// [`interrupt`] is soft: the workers finish the queued work, then stop.
///
/// A crashed worker publishes its crash (logged by the pool) and exits; the
/// pool does not replace it. If every worker dies the pool goes idle with
/// the queue preserved.
///
/// [`submit`]: SharedPool::submit
/// [`interrupt`]: SharedPool::interrupt
pub struct SharedPool {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
    max_workers: usize,
}

struct Inner {
    queue: Mutex<VecDeque<Action>>,
    task_available: Condvar,
    running: AtomicBool,
    alive_workers: AtomicUsize,
    crash_subscriptions: Mutex<HashMap<ThreadId, Subscription>>,
}

impl SharedPool {
    /// Create a new pool with `workers` worker threads.
    ///
    /// No threads are spawned until [`run`] is called.
    ///
    /// [`run`]: SharedPool::run
    pub fn new(workers: usize) -> SharedPool {
        SharedPool {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                task_available: Condvar::new(),
                running: AtomicBool::new(false),
                alive_workers: AtomicUsize::new(0),
                crash_subscriptions: Mutex::new(HashMap::new()),
            }),
            workers: Vec::new(),
            max_workers: workers,
        }
    }

    /// Start the workers, returning once all of them are live.
    ///
    /// Does nothing if the pool is already running.
    pub fn run(&mut self) -> io::Result<()> {
        if self.inner.running.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.running.store(true, Ordering::Release);

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(self.max_workers);
        for i in 0..self.max_workers {
            let inner = self.inner.clone();
            let ready = ready_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("stoker-pool{i}"))
                .spawn(move || worker_main(&inner, &ready))?;
            self.workers.push(handle);
        }
        drop(ready_tx);

        for _ in 0..self.max_workers {
            if ready_rx.recv().is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Queue `task` for execution.
    ///
    /// Tasks may be queued before [`run`]; they are executed once the
    /// workers start. Tasks queued after the workers have drained and
    /// stopped stay in the queue unexecuted.
    ///
    /// [`run`]: SharedPool::run
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.queue.lock().push_back(Box::new(task));
        let _ = self.inner.task_available.notify_one();
    }

    /// Returns the number of tasks waiting in the queue.
    pub fn workload(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Returns `true` if the pool accepts and processes work.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stop the pool: the workers finish the queued work, then exit.
    ///
    /// Blocks until every worker has stopped.
    pub fn interrupt(&mut self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            // Taking the queue lock keeps the store from slipping between a
            // worker's predicate check and its park, which would miss the
            // broadcast.
            drop(self.inner.queue.lock());
            let _ = self.inner.task_available.notify_all();
        }
        self.join();
    }

    /// Wait for the workers to exit.
    ///
    /// The workers only exit after [`interrupt`], so a bare `join` on a
    /// running pool blocks until another caller interrupts it.
    ///
    /// [`interrupt`]: SharedPool::interrupt
    pub fn join(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                // Worker bodies run under a CrashExecutor and don't unwind.
                error!("pool worker panicked");
            }
        }
    }
}

impl Drop for SharedPool {
    fn drop(&mut self) {
        self.interrupt();
    }
}

impl fmt::Debug for SharedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPool")
            .field("workers", &self.max_workers)
            .field("running", &self.is_running())
            .field("workload", &self.workload())
            .finish()
    }
}

/// Entry point of the worker threads.
fn worker_main(inner: &Arc<Inner>, ready: &Sender<()>) {
    let thread_id = thread::current().id();
    debug!("starting pool worker");

    let mut executor = CrashExecutor::new();
    let subscription = executor
        .crash_event()
        .subscribe(|(error, stacktrace): &(String, String)| {
            error!("crash in pool worker: {error}");
            error!("{stacktrace}");
        });
    let _ = inner
        .crash_subscriptions
        .lock()
        .insert(thread_id, subscription);

    executor.invoke(|| {
        let _ = inner.alive_workers.fetch_add(1, Ordering::AcqRel);
        let _ = ready.send(());

        while inner.running.load(Ordering::Acquire) {
            pull_and_run(inner);
        }
        // Stopped: finish the work that was already queued, accepting no new
        // work.
        while !inner.queue.lock().is_empty() {
            pull_and_run(inner);
        }
    });

    let _ = inner.crash_subscriptions.lock().remove(&thread_id);
    let _ = inner.alive_workers.fetch_sub(1, Ordering::AcqRel);
    debug!("pool worker stopped");
}

/// Wait for a task and run it.
///
/// Returns without running anything on shutdown or a spurious wake-up. The
/// task runs with the queue unlocked.
fn pull_and_run(inner: &Inner) {
    let mut queue = inner.queue.lock();
    inner.task_available.wait_while(&mut queue, |queue| {
        queue.is_empty() && inner.running.load(Ordering::Acquire)
    });

    let Some(task) = queue.pop_front() else {
        return;
    };
    drop(queue);

    task();
}
