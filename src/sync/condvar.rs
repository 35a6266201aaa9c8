// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A condition variable for fibers.

use crate::fiber;
use crate::fiber::awaiter::UnlockAwaiter;
use crate::spin::{QueueSpinLock, SpinNode};
use crate::sync::{Mutex, MutexWaiter};
use cordyceps::List;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

/// A condition variable that suspends fibers.
///
/// As with any Mesa-style condition variable, a wakeup is permission to
/// *re-check* the predicate, not proof of it — always wait in a loop.
/// `wait` releases the mutex before it enqueues on the condvar, so a
/// notification can slip between the two; notifiers that must not lose
/// waiters should notify until the predicate is observed.
pub struct Condvar {
    spin: QueueSpinLock,
    waiters: UnsafeCell<List<MutexWaiter>>,
}

// Safety: `waiters` is only touched under `spin`.
unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl core::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Condvar ===

impl Condvar {
    #[must_use]
    pub fn new() -> Self {
        Self {
            spin: QueueSpinLock::new(),
            waiters: UnsafeCell::new(List::new()),
        }
    }

    /// Releases `mutex`, suspends until notified, then re-acquires `mutex`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a fiber or if `mutex` is not locked.
    pub fn wait(&self, mutex: &Mutex) {
        mutex.unlock();

        let node = SpinNode::new();
        let guard = self.spin.lock(&node);

        let fiber = fiber::current().expect("condvar waited on outside a fiber");
        let waiter = MutexWaiter::new(fiber);
        {
            // Safety: under the spinlock.
            let waiters = unsafe { &mut *self.waiters.get() };
            waiters.push_back(NonNull::from(&waiter));
        }

        // The spinlock releases only after the fiber has yielded.
        let awaiter = UnlockAwaiter::new(&guard);
        fiber::suspend(&awaiter);

        mutex.lock();
    }

    /// Wakes the longest-waiting fiber, if any.
    pub fn notify_one(&self) {
        let node = SpinNode::new();
        let guard = self.spin.lock(&node);

        let next = {
            // Safety: under the spinlock.
            let waiters = unsafe { &mut *self.waiters.get() };
            // Safety: popped waiters stay alive until their fiber runs.
            waiters.pop_front().map(|w| unsafe { w.as_ref() }.fiber())
        };

        drop(guard);
        if let Some(next) = next {
            next.schedule();
        }
    }

    /// Wakes every waiting fiber.
    pub fn notify_all(&self) {
        let node = SpinNode::new();
        let guard = self.spin.lock(&node);

        let mut batch = Vec::new();
        {
            // Safety: under the spinlock.
            let waiters = unsafe { &mut *self.waiters.get() };
            while let Some(waiter) = waiters.pop_front() {
                // Safety: as in `notify_one`.
                batch.push(unsafe { waiter.as_ref() }.fiber());
            }
        }

        // Schedule outside the spinlock.
        drop(guard);
        for fiber in batch {
            fiber.schedule();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPool;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Queue {
        mutex: Mutex,
        not_empty: Condvar,
        items: UnsafeCell<Vec<u32>>,
    }
    // Safety: `items` is only touched under `mutex`.
    unsafe impl Sync for Queue {}
    unsafe impl Send for Queue {}

    impl Queue {
        fn new() -> Self {
            Self {
                mutex: Mutex::new(),
                not_empty: Condvar::new(),
                items: UnsafeCell::new(Vec::new()),
            }
        }

        fn push(&self, item: u32) {
            self.mutex.lock();
            // Safety: under the mutex.
            unsafe { (*self.items.get()).push(item) };
            self.mutex.unlock();
            self.not_empty.notify_one();
        }

        fn pop(&self) -> u32 {
            self.mutex.lock();
            loop {
                // Safety: under the mutex.
                if let Some(item) = unsafe { (*self.items.get()).pop() } {
                    self.mutex.unlock();
                    return item;
                }
                self.not_empty.wait(&self.mutex);
            }
        }
    }

    #[test]
    fn producers_and_consumers_rendezvous() {
        const ITEMS: usize = 400;
        const CONSUMERS: usize = 4;

        let pool = ThreadPool::new(4);
        let queue = Arc::new(Queue::new());
        let sum = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..CONSUMERS {
            let queue = queue.clone();
            let sum = sum.clone();
            let finished = finished.clone();
            fiber::go(pool.clone(), move || {
                for _ in 0..(ITEMS / CONSUMERS) {
                    sum.fetch_add(queue.pop() as usize, Ordering::Relaxed);
                }
                finished.fetch_add(1, Ordering::Release);
            });
        }

        let q = queue.clone();
        fiber::go(pool.clone(), move || {
            for i in 0..ITEMS {
                q.push(i as u32);
            }
        });

        // A notification can land in the window between a waiter releasing
        // the queue mutex and enqueueing on the condvar; this pump re-issues
        // notifies until every consumer is through.
        let f = finished.clone();
        let q = queue.clone();
        fiber::go(pool.clone(), move || {
            while f.load(Ordering::Acquire) < CONSUMERS {
                q.not_empty.notify_all();
                fiber::yield_now();
            }
        });

        pool.wait_idle();
        assert_eq!(sum.load(Ordering::Relaxed), ITEMS * (ITEMS - 1) / 2);
        pool.stop();
    }

    #[test]
    fn notify_all_releases_every_waiter() {
        const WAITERS: usize = 16;

        struct Gate {
            mutex: Mutex,
            opened: UnsafeCell<bool>,
            cv: Condvar,
        }
        // Safety: `opened` is only touched under `mutex`.
        unsafe impl Sync for Gate {}
        unsafe impl Send for Gate {}

        let pool = ThreadPool::new(4);
        let gate = Arc::new(Gate {
            mutex: Mutex::new(),
            opened: UnsafeCell::new(false),
            cv: Condvar::new(),
        });
        let released = Arc::new(AtomicUsize::new(0));

        for _ in 0..WAITERS {
            let gate = gate.clone();
            let released = released.clone();
            fiber::go(pool.clone(), move || {
                gate.mutex.lock();
                // Safety: under the mutex.
                while !unsafe { *gate.opened.get() } {
                    gate.cv.wait(&gate.mutex);
                }
                gate.mutex.unlock();
                released.fetch_add(1, Ordering::Release);
            });
        }

        let g = gate.clone();
        let r = released.clone();
        fiber::go(pool.clone(), move || {
            g.mutex.lock();
            // Safety: under the mutex.
            unsafe { *g.opened.get() = true };
            g.mutex.unlock();
            // notify until every waiter has observed the open gate
            while r.load(Ordering::Acquire) < WAITERS {
                g.cv.notify_all();
                fiber::yield_now();
            }
        });

        pool.wait_idle();
        assert_eq!(released.load(Ordering::Relaxed), WAITERS);
        pool.stop();
    }
}
