//! Pool with a task queue per worker.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use crate::crash::CrashExecutor;
use crate::Action;

/// A pool dealing tasks out round-robin over per-worker FIFOs.
///
/// [`submit`] assigns each task to the next shard in round-robin order,
/// skipping shards that are no longer running; within a shard tasks run in
/// submission order. When a shard's worker crashes, the tasks still queued on
/// it are re-submitted to the pool, so work queued to a dead shard is
/// redistributed, not lost. Only when every shard has stopped are submissions
/// dropped.
///
/// [`interrupt`] is soft (each shard drains its queue, then stops),
/// [`interrupt_now`] additionally discards work that hasn't started.
///
/// # Notes
///
/// A submission racing with `interrupt` may land on a shard that is about to
/// stop; the shard still drains it. This window is inherent to the protocol
/// and accepted.
///
/// [`submit`]: ShardedPool::submit
/// [`interrupt`]: ShardedPool::interrupt
/// [`interrupt_now`]: ShardedPool::interrupt_now
pub struct ShardedPool {
    shared: Arc<PoolShared>,
    workers: Vec<Option<JoinHandle<()>>>,
}

struct PoolShared {
    shards: Box<[Shard]>,
    /// Round-robin cursor for `submit`.
    cursor: AtomicUsize,
    alive_workers: AtomicUsize,
}

/// A single worker's share of the pool: its queue and its flags.
struct Shard {
    queue: Mutex<VecDeque<Action>>,
    task_available: Condvar,
    running: AtomicBool,
    interrupt_now: AtomicBool,
}

impl Shard {
    fn new() -> Shard {
        Shard {
            queue: Mutex::new(VecDeque::new()),
            task_available: Condvar::new(),
            running: AtomicBool::new(false),
            interrupt_now: AtomicBool::new(false),
        }
    }
}

impl ShardedPool {
    /// Create a new pool with `workers` shards.
    ///
    /// No threads are spawned until [`run`] is called.
    ///
    /// [`run`]: ShardedPool::run
    pub fn new(workers: usize) -> ShardedPool {
        ShardedPool {
            shared: Arc::new(PoolShared {
                shards: (0..workers).map(|_| Shard::new()).collect(),
                cursor: AtomicUsize::new(0),
                alive_workers: AtomicUsize::new(0),
            }),
            workers: Vec::new(),
        }
    }

    /// Start a worker per shard, returning once all of them are live.
    ///
    /// Does nothing if the pool is already running.
    pub fn run(&mut self) -> io::Result<()> {
        if self.is_running() {
            return Ok(());
        }
        for shard in self.shared.shards.iter() {
            shard.interrupt_now.store(false, Ordering::Release);
            shard.running.store(true, Ordering::Release);
        }
        self.workers.clear();

        let shard_count = self.shared.shards.len();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(shard_count);
        for index in 0..shard_count {
            let shared = self.shared.clone();
            let ready = ready_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("stoker-shard{index}"))
                .spawn(move || worker_main(&shared, index, &ready))?;
            self.workers.push(Some(handle));
        }
        drop(ready_tx);

        for _ in 0..shard_count {
            if ready_rx.recv().is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Queue `task` on the next shard in round-robin order.
    ///
    /// Shards that are not running are skipped; if no shard is running the
    /// task is dropped.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        submit_task(&self.shared, Box::new(task));
    }

    /// Returns the total number of tasks waiting across all shards.
    pub fn workload(&self) -> usize {
        self.shared
            .shards
            .iter()
            .map(|shard| shard.queue.lock().len())
            .sum()
    }

    /// Returns `true` if any shard is still running.
    pub fn is_running(&self) -> bool {
        self.shared
            .shards
            .iter()
            .any(|shard| shard.running.load(Ordering::Acquire))
    }

    /// Stop the shards one by one: each drains its queue, then its worker
    /// exits and is joined before the next shard is stopped.
    pub fn interrupt(&mut self) {
        for (index, shard) in self.shared.shards.iter().enumerate() {
            if shard.running.swap(false, Ordering::AcqRel) {
                // Lock before broadcasting so the store can't slip between
                // the worker's predicate check and its park.
                drop(shard.queue.lock());
                let _ = shard.task_available.notify_all();
            }
            if let Some(worker) = self.workers.get_mut(index).and_then(Option::take) {
                if worker.join().is_err() {
                    error!("sharded pool worker {index} panicked");
                }
            }
        }
    }

    /// As [`interrupt`], but work that hasn't started is discarded instead
    /// of drained. Discarded tasks stay in the shard queues.
    ///
    /// [`interrupt`]: ShardedPool::interrupt
    pub fn interrupt_now(&mut self) {
        for shard in self.shared.shards.iter() {
            shard.interrupt_now.store(true, Ordering::Release);
        }
        self.interrupt();
    }

    /// Wait for the workers to exit.
    ///
    /// The workers only exit after an interrupt, so a bare `join` on a
    /// running pool blocks until another caller interrupts it.
    pub fn join(&mut self) {
        for (index, worker) in self.workers.iter_mut().enumerate() {
            if let Some(worker) = worker.take() {
                if worker.join().is_err() {
                    error!("sharded pool worker {index} panicked");
                }
            }
        }
    }
}

impl Drop for ShardedPool {
    fn drop(&mut self) {
        self.interrupt();
    }
}

impl fmt::Debug for ShardedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedPool")
            .field("shards", &self.shared.shards.len())
            .field("running", &self.is_running())
            .field("workload", &self.workload())
            .finish()
    }
}

/// Queue `task` on the next running shard after the round-robin cursor.
///
/// Advances the cursor one shard per attempt; after one full round over
/// stopped shards the task is dropped. Also called by the crash handler to
/// redistribute a dead shard's backlog, so it must not assume the submitting
/// thread is outside the pool.
fn submit_task(shared: &PoolShared, task: Action) {
    let shard_count = shared.shards.len();
    for _ in 0..shard_count {
        let index = shared.cursor.fetch_add(1, Ordering::Relaxed) % shard_count;
        let shard = &shared.shards[index];
        if !shard.running.load(Ordering::Acquire) {
            continue;
        }
        shard.queue.lock().push_back(task);
        let _ = shard.task_available.notify_one();
        return;
    }
    trace!("no running shard, dropping task");
}

/// Entry point of the shard workers.
fn worker_main(shared: &Arc<PoolShared>, index: usize, ready: &Sender<()>) {
    debug!(shard = index; "starting sharded pool worker");

    let crashed = Arc::new(AtomicBool::new(false));
    let mut executor = CrashExecutor::new();
    let listener = executor.crash_event().listener();
    {
        let shared = shared.clone();
        let crashed = crashed.clone();
        listener.set(move |(error, stacktrace): &(String, String)| {
            crashed.store(true, Ordering::Release);
            error!("crash in sharded pool worker {index}: {error}");
            error!("{stacktrace}");
            redistribute(&shared, index);
        });
    }

    executor.invoke(|| {
        let _ = shared.alive_workers.fetch_add(1, Ordering::AcqRel);
        let _ = ready.send(());

        let shard = &shared.shards[index];
        while shard.running.load(Ordering::Acquire) {
            pull_and_run(shard);
        }
        if !shard.interrupt_now.load(Ordering::Acquire) {
            while !shard.queue.lock().is_empty() {
                pull_and_run(shard);
            }
        }
    });

    shared.shards[index].running.store(false, Ordering::Release);
    if !crashed.load(Ordering::Acquire) {
        let _ = shared.alive_workers.fetch_sub(1, Ordering::AcqRel);
    }
    drop(listener);
    debug!(shard = index; "sharded pool worker stopped");
}

/// Wait for a task on the shard's queue and run it.
///
/// Returns without running anything on shutdown or a spurious wake-up. The
/// task runs with the queue unlocked.
fn pull_and_run(shard: &Shard) {
    let mut queue = shard.queue.lock();
    shard.task_available.wait_while(&mut queue, |queue| {
        queue.is_empty() && shard.running.load(Ordering::Acquire)
    });

    let Some(task) = queue.pop_front() else {
        return;
    };
    drop(queue);

    task();
}

/// Crash handling: mark the shard dead and hand its backlog back to the
/// pool, task by task, through the round-robin `submit`.
fn redistribute(shared: &PoolShared, index: usize) {
    let shard = &shared.shards[index];
    shard.running.store(false, Ordering::Release);

    let alive = shared.alive_workers.fetch_sub(1, Ordering::AcqRel) - 1;
    if alive == 0 {
        let abandoned = shard.queue.lock().len();
        error!("last sharded pool worker crashed, {abandoned} queued task(s) will not run");
        return;
    }

    // Swap the backlog out under the shard's lock and re-submit with the
    // lock released: `submit_task` takes other shards' locks and only one
    // may be held at a time.
    let backlog = mem::take(&mut *shard.queue.lock());
    if !backlog.is_empty() {
        debug!(shard = index, tasks = backlog.len(); "redistributing backlog of crashed worker");
        for task in backlog {
            submit_task(shared, task);
        }
    }
}
