//! Crash isolation for worker threads.
//!
//! A [`CrashExecutor`] runs a closure and converts a crash inside it into a
//! single notification carrying an error string and a stack trace, after
//! which it returns normally. Every worker thread in this crate runs its body
//! under one, so no failure of user-supplied work can take a worker down
//! unobserved.
//!
//! # Notes
//!
//! The recoverable failure of a Rust thread is the panic. The first executor
//! created in a process installs a panic hook (shared by all executors) that
//! records the panicking thread's stack trace in a thread-local. The hook
//! only takes over for panics raised under [`invoke`] — reporting those is
//! the job of the crash event's subscribers — and forwards everything else
//! to the hook that was installed before it. Faults that do not unwind
//! (aborts, hardware faults) terminate the process as they would in any
//! Rust program.
//!
//! [`invoke`]: CrashExecutor::invoke

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use backtrace::Backtrace;

use crate::event::Event;

/// Event published when a crash is captured, carrying the error message and
/// a stack trace of the crash site.
pub type CrashEvent = Event<(String, String)>;

/// Installation guard for the process-wide panic hook.
static INSTALL_HOOK: Once = Once::new();

thread_local! {
    /// Whether this thread is currently inside [`CrashExecutor::invoke`].
    static IN_EXECUTOR: Cell<bool> = const { Cell::new(false) };

    /// Stack trace recorded by the panic hook for the most recent panic on
    /// this thread.
    static LAST_STACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn install_panic_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !IN_EXECUTOR.with(Cell::get) {
                previous(info);
                return;
            }
            let mut stacktrace = String::new();
            if let Some(location) = info.location() {
                let _ = writeln!(stacktrace, "panicked at {location}");
            }
            let backtrace = Backtrace::new();
            let _ = write!(stacktrace, "{backtrace:?}");
            LAST_STACKTRACE.with(|last| *last.borrow_mut() = Some(stacktrace));
        }));
    });
}

/// Returns the panic message in `payload`, if it carries one.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    match payload.downcast_ref::<&'static str>() {
        Some(message) => (*message).to_owned(),
        None => match payload.downcast_ref::<String>() {
            Some(message) => message.clone(),
            None => "unknown panic payload".to_owned(),
        },
    }
}

/// Runs closures, capturing crashes.
///
/// See [`invoke`].
///
/// [`invoke`]: CrashExecutor::invoke
pub struct CrashExecutor {
    crash_event: CrashEvent,
}

impl CrashExecutor {
    /// Create a new executor.
    pub fn new() -> CrashExecutor {
        install_panic_hook();
        CrashExecutor {
            crash_event: Event::new(),
        }
    }

    /// Returns the event fired when an invoked action crashes.
    pub fn crash_event(&mut self) -> &mut CrashEvent {
        &mut self.crash_event
    }

    /// Run `action` to completion.
    ///
    /// If the action crashes the crash event is notified exactly once with
    /// `(error, stacktrace)` and `invoke` returns normally; the calling
    /// thread is not terminated. If the action completes nothing is
    /// published.
    pub fn invoke<F: FnOnce()>(&mut self, action: F) {
        // Scope the hook to the call; `invoke` may nest.
        let was_inside = IN_EXECUTOR.with(|inside| inside.replace(true));
        let result = panic::catch_unwind(AssertUnwindSafe(action));
        IN_EXECUTOR.with(|inside| inside.set(was_inside));

        if let Err(payload) = result {
            let error = panic_message(&*payload);
            let stacktrace = LAST_STACKTRACE
                .with(|last| last.borrow_mut().take())
                .unwrap_or_else(|| "no stack trace captured".to_owned());
            self.crash_event.notify(&(error, stacktrace));
        }
    }
}

impl Default for CrashExecutor {
    fn default() -> CrashExecutor {
        CrashExecutor::new()
    }
}

impl fmt::Debug for CrashExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashExecutor")
            .field("crash_event", &self.crash_event)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::CrashExecutor;

    #[test]
    fn invoke_runs_the_action() {
        let mut executor = CrashExecutor::new();
        let mut ran = false;
        executor.invoke(|| ran = true);
        assert!(ran);
    }

    #[test]
    fn completed_action_publishes_nothing() {
        let mut executor = CrashExecutor::new();
        let crashes = Arc::new(AtomicUsize::new(0));
        let crashes2 = crashes.clone();
        let _sub = executor.crash_event().subscribe(move |_: &(String, String)| {
            let _ = crashes2.fetch_add(1, Ordering::SeqCst);
        });

        executor.invoke(|| {});
        assert_eq!(crashes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn crashed_action_publishes_exactly_once() {
        let mut executor = CrashExecutor::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = executor
            .crash_event()
            .subscribe(move |(error, stacktrace): &(String, String)| {
                seen2.lock().push((error.clone(), stacktrace.clone()));
            });

        executor.invoke(|| panic!("boom"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "boom");
        assert!(!seen[0].1.is_empty());
    }

    #[test]
    fn invoke_returns_normally_after_a_crash() {
        let mut executor = CrashExecutor::new();
        executor.invoke(|| panic!("first"));

        // The executor must be reusable after a crash.
        let mut ran = false;
        executor.invoke(|| ran = true);
        assert!(ran);
    }

    #[test]
    fn formatted_panic_message_is_captured() {
        let mut executor = CrashExecutor::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = executor
            .crash_event()
            .subscribe(move |(error, _): &(String, String)| {
                seen2.lock().push(error.clone());
            });

        let value = 123;
        executor.invoke(|| panic!("bad value: {value}"));
        assert_eq!(*seen.lock(), vec!["bad value: 123".to_owned()]);
    }
}
