//! Worker pools.
//!
//! Two pools with the same surface but different queueing:
//!
//! * [`SharedPool`]: one FIFO task queue shared by all workers, any worker
//!   may pull the next task.
//! * [`ShardedPool`]: one FIFO per worker, tasks are dealt out round-robin.
//!   Work queued to a crashed worker is redistributed over the live ones,
//!   and [`interrupt_now`] can discard work that hasn't started.
//!
//! Both run every worker body under a [`CrashExecutor`], so a panicking task
//! never unwinds out of a worker unobserved.
//!
//! [`interrupt_now`]: ShardedPool::interrupt_now
//! [`CrashExecutor`]: crate::crash::CrashExecutor

mod shared;
mod sharded;

pub use shared::SharedPool;
pub use sharded::ShardedPool;

#[cfg(test)]
mod tests;
