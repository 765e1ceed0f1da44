//! Tests for the worker pools.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, sleep};
use std::time::Duration;

use crate::pool::{SharedPool, ShardedPool};

#[test]
fn shared_pool_runs_submitted_tasks() {
    let mut pool = SharedPool::new(2);
    pool.run().unwrap();
    assert!(pool.is_running());

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let count = count.clone();
        pool.submit(move || {
            let _ = count.fetch_add(1, Ordering::SeqCst);
        });
    }

    pool.interrupt();
    assert!(!pool.is_running());
    assert_eq!(count.load(Ordering::SeqCst), 10);
    assert_eq!(pool.workload(), 0);
}

#[test]
fn shared_pool_runs_tasks_submitted_before_run() {
    let mut pool = SharedPool::new(2);

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let count = count.clone();
        pool.submit(move || {
            let _ = count.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(pool.workload(), 5);

    pool.run().unwrap();
    pool.interrupt();
    assert_eq!(count.load(Ordering::SeqCst), 5);
}

#[test]
fn shared_pool_executes_each_task_exactly_once() {
    let mut pool = SharedPool::new(4);
    pool.run().unwrap();

    let value = Arc::new(AtomicUsize::new(1_000_000));
    for _ in 0..100 {
        let value2 = value.clone();
        pool.submit(move || {
            let _ = value2.fetch_add(1000, Ordering::SeqCst);
        });
        let value2 = value.clone();
        pool.submit(move || {
            let _ = value2.fetch_sub(1000, Ordering::SeqCst);
        });
    }

    pool.interrupt();
    assert_eq!(value.load(Ordering::SeqCst), 1_000_000);
    assert_eq!(pool.workload(), 0);
}

#[test]
fn shared_pool_drains_the_queue_on_interrupt() {
    let mut pool = SharedPool::new(1);
    pool.run().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let count = count.clone();
        pool.submit(move || {
            sleep(Duration::from_millis(1));
            let _ = count.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Soft interrupt: everything already queued still runs.
    pool.interrupt();
    assert_eq!(count.load(Ordering::SeqCst), 20);
}

#[test]
fn shared_pool_run_twice_is_a_no_op() {
    let mut pool = SharedPool::new(2);
    pool.run().unwrap();
    pool.run().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    pool.submit(move || {
        let _ = count2.fetch_add(1, Ordering::SeqCst);
    });

    pool.interrupt();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn shared_pool_survives_a_crashing_task() {
    let mut pool = SharedPool::new(2);
    pool.run().unwrap();

    pool.submit(|| panic!("task crashed"));

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let count = count.clone();
        pool.submit(move || {
            let _ = count.fetch_add(1, Ordering::SeqCst);
        });
    }

    // The crashed worker is gone, the remaining one picks up the rest.
    sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), 10);
    assert!(pool.is_running());
    pool.interrupt();
}

#[test]
fn shared_pool_preserves_queue_when_all_workers_died() {
    let mut pool = SharedPool::new(1);
    pool.run().unwrap();

    pool.submit(|| panic!("task crashed"));
    sleep(Duration::from_millis(100));

    // The only worker is dead: new work is queued but never picked up.
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let count = count.clone();
        pool.submit(move || {
            let _ = count.fetch_add(1, Ordering::SeqCst);
        });
    }

    sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(pool.workload(), 3);
}

#[test]
fn sharded_pool_deals_tasks_round_robin() {
    let mut pool = ShardedPool::new(2);
    pool.run().unwrap();

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for i in 0..6 {
        let seen = seen.clone();
        pool.submit(move || {
            let name = thread::current().name().unwrap_or("").to_owned();
            seen.lock().push((i, name));
        });
    }

    pool.interrupt();
    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen.len(), 6);
    // Even submissions on one shard, odd ones on the other.
    let even: Vec<_> = seen.iter().filter(|(i, _)| i % 2 == 0).collect();
    let odd: Vec<_> = seen.iter().filter(|(i, _)| i % 2 == 1).collect();
    assert!(even.iter().all(|(_, name)| name == &even[0].1));
    assert!(odd.iter().all(|(_, name)| name == &odd[0].1));
    assert_ne!(even[0].1, odd[0].1);
}

#[test]
fn sharded_pool_counts_workload_across_shards() {
    let mut pool = ShardedPool::new(2);
    pool.run().unwrap();

    // Block both shards so the queues fill up.
    for _ in 0..2 {
        pool.submit(|| sleep(Duration::from_millis(100)));
    }
    sleep(Duration::from_millis(20));

    for _ in 0..6 {
        pool.submit(|| {});
    }
    assert_eq!(pool.workload(), 6);

    pool.interrupt();
    assert_eq!(pool.workload(), 0);
}

#[test]
fn sharded_pool_drops_submits_when_stopped() {
    let mut pool = ShardedPool::new(2);
    pool.run().unwrap();
    pool.interrupt();

    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    pool.submit(move || {
        let _ = count2.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(pool.workload(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn sharded_pool_interrupt_now_discards_pending_work() {
    let mut pool = ShardedPool::new(1);
    pool.run().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    pool.submit(move || {
        let _ = count2.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(100));
    });
    // Queued behind the sleeping task, discarded by the hard interrupt.
    for _ in 0..10 {
        let count2 = count.clone();
        pool.submit(move || {
            let _ = count2.fetch_add(1, Ordering::SeqCst);
        });
    }

    sleep(Duration::from_millis(20));
    pool.interrupt_now();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(pool.workload(), 10);
}

#[test]
fn sharded_pool_redistributes_backlog_of_crashed_worker() {
    let mut pool = ShardedPool::new(2);
    pool.run().unwrap();

    // Shard 0 gets a task that crashes after a moment, leaving time to queue
    // work behind it.
    pool.submit(|| {
        sleep(Duration::from_millis(50));
        panic!("worker crashed");
    });

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let count = count.clone();
        pool.submit(move || {
            let _ = count.fetch_add(1, Ordering::SeqCst);
        });
    }

    // The crash redistributes shard 0's backlog to the surviving shard.
    sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::SeqCst), 8);
    assert!(pool.is_running());
    assert_eq!(pool.workload(), 0);

    pool.interrupt();
    assert!(!pool.is_running());
}

#[test]
fn sharded_pool_drops_tasks_when_every_worker_died() {
    let mut pool = ShardedPool::new(1);
    pool.run().unwrap();

    pool.submit(|| panic!("worker crashed"));
    sleep(Duration::from_millis(100));
    assert!(!pool.is_running());

    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    pool.submit(move || {
        let _ = count2.fetch_add(1, Ordering::SeqCst);
    });

    sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(pool.workload(), 0);
}
