//! A loop running actions at absolute deadlines.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use crate::crash::CrashExecutor;
use crate::Action;

/// A single dispatcher thread invoking queued actions at absolute deadlines.
///
/// Actions queued for distinct deadlines run earliest first; actions queued
/// for the same deadline run in submission order. Actions run on the
/// dispatcher thread, one at a time; a blocking action delays everything
/// behind it.
pub struct DeadlineLoop {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
    running: AtomicBool,
}

struct State {
    /// Queued actions by deadline, ties in submission order.
    queue: BTreeMap<Instant, Vec<Action>>,
    /// Deadline the dispatcher is (or will be) parked on. `None` while the
    /// queue is empty.
    next_run: Option<Instant>,
}

impl DeadlineLoop {
    /// Create a new loop, spawning its dispatcher thread.
    pub fn new() -> io::Result<DeadlineLoop> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: BTreeMap::new(),
                next_run: None,
            }),
            wakeup: Condvar::new(),
            running: AtomicBool::new(true),
        });
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("stoker-deadline".to_owned())
                .spawn(move || worker_main(&shared))?
        };
        Ok(DeadlineLoop {
            shared,
            worker: Some(worker),
        })
    }

    /// Queue `action` to run at `deadline`.
    ///
    /// Ignored if the loop was interrupted. A deadline in the past runs the
    /// action as soon as the dispatcher gets to it.
    pub fn invoke<F>(&self, action: F, deadline: Instant)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_running() {
            trace!("invoke on stopped deadline loop, dropping action");
            return;
        }

        let mut state = self.shared.state.lock();
        if state.queue.is_empty() || state.next_run.is_none_or(|next_run| deadline < next_run) {
            state.next_run = Some(deadline);
            let _ = self.shared.wakeup.notify_one();
        }
        state.queue.entry(deadline).or_default().push(Box::new(action));
    }

    /// Returns `true` until the loop is interrupted (or its dispatcher
    /// crashed).
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop the dispatcher and wait for it to exit.
    ///
    /// Actions still queued are dropped without running.
    pub fn interrupt(&mut self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            // Lock before broadcasting so the store can't slip between the
            // dispatcher's predicate check and its park.
            drop(self.shared.state.lock());
            let _ = self.shared.wakeup.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("deadline loop dispatcher panicked");
            }
        }
    }
}

impl Drop for DeadlineLoop {
    fn drop(&mut self) {
        self.interrupt();
    }
}

impl fmt::Debug for DeadlineLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineLoop")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Entry point of the dispatcher thread.
fn worker_main(shared: &Arc<Shared>) {
    debug!("starting deadline loop");

    let mut executor = CrashExecutor::new();
    let subscription = executor
        .crash_event()
        .subscribe(|(error, stacktrace): &(String, String)| {
            error!("crash in deadline loop: {error}");
            error!("{stacktrace}");
        });

    executor.invoke(|| {
        while shared.running.load(Ordering::Acquire) {
            trigger(shared);
        }
    });

    shared.running.store(false, Ordering::Release);
    drop(subscription);
    debug!("deadline loop stopped");
}

/// One dispatcher step: wait for the earliest deadline, then run everything
/// queued for it.
///
/// Returns without running anything on shutdown and on spurious or early
/// wake-ups; the surrounding loop re-arms with the updated deadline.
fn trigger(shared: &Shared) {
    let mut state = shared.state.lock();
    if state.queue.is_empty() {
        shared.wakeup.wait_while(&mut state, |state| {
            state.queue.is_empty() && shared.running.load(Ordering::Acquire)
        });
    } else if let Some(deadline) = state.next_run {
        let _ = shared.wakeup.wait_while_until(
            &mut state,
            |state| {
                let next_run = state.next_run.unwrap_or(deadline);
                Instant::now() <= next_run && shared.running.load(Ordering::Acquire)
            },
            deadline,
        );
    }

    if state.queue.is_empty() {
        return;
    }
    let Some(next_run) = state.next_run else {
        return;
    };
    if Instant::now() < next_run {
        return;
    }

    let Some((_, actions)) = state.queue.pop_first() else {
        return;
    };
    state.next_run = state.queue.keys().next().copied();
    drop(state);

    for action in actions {
        action();
    }
}
