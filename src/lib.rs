//! Stoker is a small toolkit for running work on plain OS threads: worker
//! pools, deadline and timer loops, and the crash isolation and
//! event-subscription pieces they are built from.
//!
//! There is no async runtime and no hidden scheduler in here, every
//! component owns one or more threads and nothing else. Tasks may block;
//! a blocking task blocks exactly one worker.
//!
//! The components:
//!
//! * [`SharedPool`]: workers pulling from one shared FIFO.
//! * [`ShardedPool`]: a FIFO per worker, filled round-robin, with crash-time
//!   redistribution of a dead worker's backlog.
//! * [`DeadlineLoop`]: one dispatcher running actions at absolute deadlines.
//! * [`TimerLoop`] and [`Timer`]: named, restartable one-shot and periodic
//!   timers on one dispatcher.
//! * [`ThreadRunner`]: a single named thread running a callback under crash
//!   isolation.
//! * [`CrashExecutor`]: turns a crash in a worker body into an
//!   `(error, stacktrace)` notification instead of a dead silent thread.
//! * [`Event`], [`Attribute`] and [`Subscription`]: the multi-listener
//!   notification used to publish crashes and value changes.
//!
//! # Examples
//!
//! Running work on a pool:
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use stoker::SharedPool;
//!
//! # fn main() -> std::io::Result<()> {
//! let mut pool = SharedPool::new(4);
//! pool.run()?;
//!
//! let count = Arc::new(AtomicUsize::new(0));
//! for _ in 0..100 {
//!     let count = count.clone();
//!     pool.submit(move || {
//!         let _ = count.fetch_add(1, Ordering::Relaxed);
//!     });
//! }
//!
//! // Soft interrupt: drains the queue, then stops the workers.
//! pool.interrupt();
//! assert_eq!(count.load(Ordering::Relaxed), 100);
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_debug_implementations,
    missing_docs,
    unused_results,
    variant_size_differences
)]

pub mod crash;
pub mod deadline;
pub mod event;
pub mod pool;
pub mod runner;
pub mod timer;

pub use crash::CrashExecutor;
pub use deadline::DeadlineLoop;
pub use event::{Attribute, Event, Subscription};
pub use pool::{SharedPool, ShardedPool};
pub use runner::ThreadRunner;
pub use timer::{Timer, TimerLoop};

/// A unit of work: a movable, no-argument, no-return closure, called at most
/// once.
pub(crate) type Action = Box<dyn FnOnce() + Send>;
