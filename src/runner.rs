//! A named thread running a callback under crash isolation.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error};
use parking_lot::Mutex;

use crate::crash::CrashExecutor;

/// A named thread that runs a stored callback under a [`CrashExecutor`].
///
/// Every call to [`run`] spawns a fresh thread executing the callback; a
/// crash inside it is logged and reported to the `on_crash` reaction passed
/// to `run`, and the thread exits normally. Dropping the runner joins the
/// thread.
///
/// [`run`]: ThreadRunner::run
pub struct ThreadRunner {
    name: String,
    run_fn: Arc<Mutex<Box<dyn FnMut() + Send>>>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadRunner {
    /// Create a new runner for a thread named `name` running `run_fn`.
    ///
    /// The thread is not started until [`run`] is called.
    ///
    /// [`run`]: ThreadRunner::run
    pub fn new<F>(name: &str, run_fn: F) -> ThreadRunner
    where
        F: FnMut() + Send + 'static,
    {
        ThreadRunner {
            name: name.to_owned(),
            run_fn: Arc::new(Mutex::new(Box::new(run_fn))),
            handle: None,
        }
    }

    /// Spawn the thread.
    ///
    /// `on_crash` is subscribed to the thread's crash event before the
    /// callback runs and released once it returns. If a previous `run` is
    /// still joinable it is joined first.
    pub fn run<F>(&mut self, on_crash: F) -> io::Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("runner thread '{}' panicked", self.name);
            }
        }

        let name = self.name.clone();
        let run_fn = self.run_fn.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut on_crash = on_crash;
                let mut executor = CrashExecutor::new();
                let subscription = {
                    let name = name.clone();
                    executor
                        .crash_event()
                        .subscribe(move |(error, stacktrace): &(String, String)| {
                            error!("crash in thread '{name}': {error}");
                            error!("{stacktrace}");
                            on_crash();
                        })
                };

                executor.invoke(|| {
                    debug!("running '{name}'");
                    let mut run_fn = run_fn.lock();
                    (*run_fn)();
                });

                drop(subscription);
            })?;
        self.handle = Some(handle);
        Ok(())
    }
}

impl Drop for ThreadRunner {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("runner thread '{}' panicked", self.name);
            }
        }
    }
}

impl fmt::Debug for ThreadRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRunner")
            .field("name", &self.name)
            .field("spawned", &self.handle.is_some())
            .finish()
    }
}
