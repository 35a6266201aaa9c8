// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker parking.
//!
//! [`ParkingLot`] fuses the executor's global "tasks-in-queue" counter with
//! the condvar that idle workers sleep on: an enqueue that moves the counter
//! from zero wakes exactly one parked worker, stopping poisons the counter so
//! every worker wakes and observes its closed flag.
//!
//! [`WaitGroup`] is the thread-blocking wait group behind
//! [`ThreadPool::wait_idle`](crate::executor::ThreadPool::wait_idle):
//! every submitted task adds one, every completed task takes one down, and
//! `wait` blocks the *calling thread* (not a fiber) until the count drains.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

/// Added to the task counter on shutdown so that no parked worker can ever
/// see it at zero again.
const POISON: i64 = 1 << 40;

/// The tasks-in-queue counter plus the place idle workers sleep.
#[derive(Debug, Default)]
pub(crate) struct ParkingLot {
    /// Tasks currently sitting in some executor queue.
    ///
    /// Signed: a stolen task can be taken (and counted down) before the
    /// submitting thread gets to count it up, so the value may dip below
    /// zero transiently.
    queued: AtomicI64,
    lock: Mutex<()>,
    condvar: Condvar,
}

// === impl ParkingLot ===

impl ParkingLot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Counts a newly enqueued task, waking one parked worker on the
    /// zero-to-one transition.
    pub(crate) fn task_enqueued(&self) {
        if self.queued.fetch_add(1, Ordering::Release) == 0 {
            // Taking the lock orders this notify after any in-flight
            // check-then-wait in `park_while_empty`.
            let _guard = self.lock.lock().unwrap();
            self.condvar.notify_one();
        }
    }

    /// Counts a task taken out of a queue.
    pub(crate) fn task_taken(&self) {
        self.queued.fetch_sub(1, Ordering::Release);
    }

    /// Parks the calling worker until the counter says there may be work.
    pub(crate) fn park_while_empty(&self) {
        let mut guard = self.lock.lock().unwrap();
        while self.queued.load(Ordering::Acquire) <= 0 {
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    /// Makes the counter permanently non-zero and wakes every parked worker.
    pub(crate) fn poison(&self) {
        self.queued.fetch_add(POISON, Ordering::Release);
        let _guard = self.lock.lock().unwrap();
        self.condvar.notify_all();
    }
}

/// Counts outstanding tasks and blocks threads waiting for the count to
/// reach zero.
#[derive(Debug, Default)]
pub(crate) struct WaitGroup {
    count: AtomicU64,
    lock: Mutex<()>,
    condvar: Condvar,
}

// === impl WaitGroup ===

impl WaitGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Release);
    }

    pub(crate) fn done(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "wait group count went negative");
        if prev == 1 {
            let _guard = self.lock.lock().unwrap();
            self.condvar.notify_all();
        }
    }

    /// Blocks until the count reaches zero.
    pub(crate) fn wait(&self) {
        if self.count.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut guard = self.lock.lock().unwrap();
        while self.count.load(Ordering::Acquire) != 0 {
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    /// Zeroes the count and releases every waiter, regardless of how many
    /// `done` calls are still owed. Used on executor shutdown.
    pub(crate) fn all_done(&self) {
        self.count.store(0, Ordering::Release);
        let _guard = self.lock.lock().unwrap();
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn enqueue_wakes_a_parked_thread() {
        let lot = Arc::new(ParkingLot::new());
        let woke = Arc::new(AtomicBool::new(false));

        let handle = {
            let lot = lot.clone();
            let woke = woke.clone();
            thread::spawn(move || {
                lot.park_while_empty();
                woke.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!woke.load(Ordering::Acquire));

        lot.task_enqueued();
        handle.join().unwrap();
        assert!(woke.load(Ordering::Acquire));
    }

    #[test]
    fn poison_wakes_everyone() {
        let lot = Arc::new(ParkingLot::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lot = lot.clone();
                thread::spawn(move || lot.park_while_empty())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        lot.poison();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn wait_group_blocks_until_drained() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(8);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let wg = wg.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    wg.done();
                })
            })
            .collect();

        wg.wait();
        for handle in handles {
            handle.join().unwrap();
        }
        // a fresh wait returns immediately
        wg.wait();
    }

    #[test]
    fn all_done_releases_waiters() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(1);

        let handle = {
            let wg = wg.clone();
            thread::spawn(move || wg.wait())
        };

        thread::sleep(Duration::from_millis(20));
        wg.all_done();
        handle.join().unwrap();
    }
}
