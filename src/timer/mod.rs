//! Named, restartable timers on a single dispatcher thread.
//!
//! A [`TimerLoop`] owns the dispatcher; [`Timer`]s are shared entities
//! created with [`TimerLoop::timer`] and scheduled on it. Timers can be
//! one-shot or periodic, restarted while scheduled (pushing their deadline
//! out by their full duration) and stopped. The loop keeps a side index from
//! timer id to scheduled deadline so restart and remove never scan the
//! queue.
//!
//! # Notes
//!
//! Stopping a timer races with its expiry: if the dispatcher already
//! dequeued the timer when [`stop`] takes the loop's lock, the callback may
//! still run once. This race is inherent and accepted.
//!
//! [`stop`]: Timer::stop

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use crate::crash::CrashExecutor;


/// Callback of a timer.
///
/// Shared so the dispatcher can run it without holding the timer's own
/// state, letting the callback stop or restart its own timer.
type TimerFn = Arc<Mutex<Box<dyn FnMut() + Send>>>;

/// The dispatcher for [`Timer`]s.
///
/// Expired timers fire earliest deadline first; timers expiring at the same
/// instant fire in registration order. Callbacks run on the dispatcher
/// thread, one at a time.
pub struct TimerLoop {
    shared: Arc<LoopShared>,
    worker: Option<JoinHandle<()>>,
    timer_ids: AtomicU64,
}

struct LoopShared {
    state: Mutex<LoopState>,
    wakeup: Condvar,
    running: AtomicBool,
}

struct LoopState {
    /// Scheduled timers by deadline, ties in registration order. Holds a
    /// strong reference to every scheduled timer.
    queue: BTreeMap<Instant, Vec<Arc<Timer>>>,
    /// Side index locating each scheduled timer's deadline in `queue`.
    plan: HashMap<u64, Instant>,
    /// Deadline the dispatcher is (or will be) parked on. `None` while the
    /// queue is empty.
    next_run: Option<Instant>,
    /// Set (with a signal) by mutations that change the earliest deadline;
    /// the parked dispatcher re-reads the minimum key and re-arms. This is
    /// how a mutator steers the dispatcher to an earlier wake-up without
    /// knowing whether it is currently parked.
    replanned: bool,
}

impl TimerLoop {
    /// Create a new loop, spawning its dispatcher thread.
    pub fn new() -> io::Result<TimerLoop> {
        let shared = Arc::new(LoopShared {
            state: Mutex::new(LoopState {
                queue: BTreeMap::new(),
                plan: HashMap::new(),
                next_run: None,
                replanned: false,
            }),
            wakeup: Condvar::new(),
            running: AtomicBool::new(true),
        });
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("stoker-timer".to_owned())
                .spawn(move || worker_main(&shared))?
        };
        Ok(TimerLoop {
            shared,
            worker: Some(worker),
            timer_ids: AtomicU64::new(0),
        })
    }

    /// Create a new, idle timer driven by this loop.
    pub fn timer(&self) -> Arc<Timer> {
        let id = self.timer_ids.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(Timer {
            id,
            shared: self.shared.clone(),
            active: AtomicBool::new(false),
            periodic: AtomicBool::new(false),
            duration_ms: AtomicU64::new(0),
            function: Mutex::new(None),
        })
    }

    /// Returns `true` until the loop is interrupted (or its dispatcher
    /// crashed).
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop the dispatcher and wait for it to exit.
    ///
    /// All scheduled timers are unscheduled without firing.
    pub fn interrupt(&mut self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            let (queue, plan) = {
                let mut state = self.shared.state.lock();
                (mem::take(&mut state.queue), mem::take(&mut state.plan))
            };
            let _ = self.shared.wakeup.notify_all();
            // Dropped outside the lock: dropping the last handle to a timer
            // runs its `stop`, which takes the lock again.
            drop(queue);
            drop(plan);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("timer loop dispatcher panicked");
            }
        }
    }
}

impl Drop for TimerLoop {
    fn drop(&mut self) {
        self.interrupt();
    }
}

impl fmt::Debug for TimerLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerLoop")
            .field("running", &self.is_running())
            .finish()
    }
}

impl LoopShared {
    /// Schedule `timer` to expire `timeout` from now.
    fn add(&self, timer: &Arc<Timer>, timeout: Duration) {
        let mut state = self.state.lock();
        let deadline = Instant::now() + timeout;
        let was_empty = state.queue.is_empty();
        let old_min = state.queue.keys().next().copied();

        state.queue.entry(deadline).or_default().push(timer.clone());
        let _ = state.plan.insert(timer.id, deadline);

        if was_empty {
            state.next_run = Some(deadline);
            state.replanned = false;
            let _ = self.wakeup.notify_one();
        } else if old_min.is_some_and(|min| deadline < min) {
            state.replanned = true;
            let _ = self.wakeup.notify_one();
        }
    }

    /// Move the scheduled `id` to a fresh deadline, a full duration from
    /// now. Logged and ignored for timers that aren't scheduled.
    fn restart(&self, id: u64) {
        let mut state = self.state.lock();
        let Some(&deadline) = state.plan.get(&id) else {
            debug!(timer = id; "restart of unknown timer");
            return;
        };
        let Some(scheduled) = state.queue.get_mut(&deadline) else {
            debug!(timer = id; "restart of timer without a scheduled deadline");
            let _ = state.plan.remove(&id);
            return;
        };
        let Some(position) = scheduled.iter().position(|timer| timer.id == id) else {
            debug!(timer = id; "restart of timer missing from its deadline bucket");
            return;
        };

        let timer = scheduled.remove(position);
        let bucket_empty = scheduled.is_empty();
        if bucket_empty {
            let _ = state.queue.remove(&deadline);
        }

        let duration = Duration::from_millis(timer.duration_ms.load(Ordering::Acquire));
        let new_deadline = Instant::now() + duration;
        state.queue.entry(new_deadline).or_default().push(timer);
        let _ = state.plan.insert(id, new_deadline);

        if state.next_run == Some(deadline) {
            state.replanned = true;
            let _ = self.wakeup.notify_one();
        }
    }

    /// Unschedule `id`. Quietly ignored for timers that aren't scheduled.
    fn remove(&self, id: u64) {
        let mut state = self.state.lock();
        let Some(deadline) = state.plan.remove(&id) else {
            trace!(timer = id; "remove of unknown timer");
            return;
        };
        let Some(scheduled) = state.queue.get_mut(&deadline) else {
            return;
        };
        let Some(position) = scheduled.iter().position(|timer| timer.id == id) else {
            debug!(timer = id; "remove of timer missing from its deadline bucket");
            return;
        };

        let removed = scheduled.remove(position);
        if scheduled.is_empty() {
            let _ = state.queue.remove(&deadline);
        }

        if state.queue.is_empty() || state.next_run == Some(deadline) {
            state.replanned = true;
            let _ = self.wakeup.notify_one();
        }

        drop(state);
        // May be the last handle; its drop re-takes the lock (see above).
        drop(removed);
    }
}

/// Entry point of the dispatcher thread.
fn worker_main(shared: &Arc<LoopShared>) {
    debug!("starting timer loop");

    let mut executor = CrashExecutor::new();
    let subscription = executor
        .crash_event()
        .subscribe(|(error, stacktrace): &(String, String)| {
            error!("crash in timer loop: {error}");
            error!("{stacktrace}");
        });

    executor.invoke(|| {
        while shared.running.load(Ordering::Acquire) {
            trigger(shared);
        }
    });

    shared.running.store(false, Ordering::Release);
    drop(subscription);
    debug!("timer loop stopped");
}

/// One dispatcher step: wait for the earliest deadline, then fire every
/// timer scheduled for it.
fn trigger(shared: &LoopShared) {
    let mut state = shared.state.lock();
    if state.queue.is_empty() {
        shared.wakeup.wait_while(&mut state, |state| {
            state.queue.is_empty() && shared.running.load(Ordering::Acquire)
        });
    } else if let Some(deadline) = state.next_run {
        let _ = shared.wakeup.wait_while_until(
            &mut state,
            |state| !state.replanned && shared.running.load(Ordering::Acquire),
            deadline,
        );
        if state.replanned {
            state.next_run = state.queue.keys().next().copied();
            state.replanned = false;
        }
    }

    if state.queue.is_empty() {
        return;
    }
    let Some(next_run) = state.next_run else {
        return;
    };
    if Instant::now() < next_run {
        // Steered to an earlier deadline, re-arm.
        return;
    }

    let Some((_, timers)) = state.queue.pop_first() else {
        return;
    };
    trace!(timers = timers.len(); "dispatching expired timers");
    state.next_run = state.queue.keys().next().copied();
    drop(state);

    for timer in timers {
        timer.invoke();
    }
}

/// A single named timer, shared between its owner and the [`TimerLoop`].
///
/// Created with [`TimerLoop::timer`]. While scheduled the loop holds a
/// strong reference; dropping the last handle outside the loop stops the
/// timer.
pub struct Timer {
    id: u64,
    shared: Arc<LoopShared>,
    active: AtomicBool,
    periodic: AtomicBool,
    /// Mirror of the started duration, so the loop can read it for a
    /// restart under its own lock only.
    duration_ms: AtomicU64,
    function: Mutex<Option<TimerFn>>,
}

impl Timer {
    /// Returns the timer's id, unique within its loop.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` while the timer is scheduled to fire.
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Start the timer: `function` fires once, `timeout` from now.
    ///
    /// Starting an already scheduled timer restarts it instead, keeping its
    /// original callback and duration.
    pub fn start<F>(self: &Arc<Self>, timeout: Duration, function: F)
    where
        F: FnMut() + Send + 'static,
    {
        if self.active.load(Ordering::Acquire) {
            self.restart();
            return;
        }

        let mut stored = self.function.lock();
        *stored = Some(Arc::new(Mutex::new(
            Box::new(function) as Box<dyn FnMut() + Send>
        )));
        self.duration_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
        self.shared.add(self, timeout);
        self.active.store(true, Ordering::Release);
    }

    /// As [`start`], but the timer re-schedules itself every time it fires,
    /// until stopped.
    ///
    /// [`start`]: Timer::start
    pub fn start_periodic<F>(self: &Arc<Self>, timeout: Duration, function: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.periodic.store(true, Ordering::Release);
        self.start(timeout, function);
    }

    /// Restart the timer.
    ///
    /// A scheduled timer's deadline is pushed out to a full duration from
    /// now. A timer that already fired (and so kept its callback) is
    /// scheduled again. A stopped timer has no callback and this does
    /// nothing.
    pub fn restart(self: &Arc<Self>) {
        let stored = self.function.lock();
        if stored.is_none() {
            return;
        }

        if !self.active.load(Ordering::Acquire) {
            let timeout = Duration::from_millis(self.duration_ms.load(Ordering::Acquire));
            self.shared.add(self, timeout);
            self.active.store(true, Ordering::Release);
            return;
        }

        self.shared.restart(self.id);
    }

    /// Stop the timer, clearing its callback and duration.
    ///
    /// See the module notes for the race with an expiry already being
    /// dispatched.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.shared.remove(self.id);

        let mut stored = self.function.lock();
        *stored = None;
        self.duration_ms.store(0, Ordering::Release);
    }

    /// Fire the timer: called by the dispatcher when its deadline expires.
    ///
    /// A periodic timer re-registers *before* the callback runs, so a
    /// callback stopping its own timer also cancels the instance registered
    /// here.
    fn invoke(self: &Arc<Self>) {
        let function = {
            let stored = self.function.lock();
            if !self.active.load(Ordering::Acquire) {
                return;
            }
            let Some(function) = stored.as_ref() else {
                return;
            };

            if self.periodic.load(Ordering::Acquire) {
                let timeout = Duration::from_millis(self.duration_ms.load(Ordering::Acquire));
                self.shared.add(self, timeout);
            } else {
                self.active.store(false, Ordering::Release);
            }
            function.clone()
        };

        // Run the callback with the timer's state unlocked, so it can stop
        // or restart this very timer.
        let mut callback = function.lock();
        (*callback)();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("periodic", &self.periodic.load(Ordering::Relaxed))
            .finish()
    }
}
