// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A mutual-exclusion lock for fibers.

use crate::fiber;
use crate::fiber::awaiter::UnlockAwaiter;
use crate::spin::{QueueSpinLock, SpinNode};
use crate::sync::MutexWaiter;
use cordyceps::List;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

/// A fiber mutex.
///
/// Contended [`lock`](Mutex::lock)s suspend the calling fiber instead of
/// blocking the worker thread. [`unlock`](Mutex::unlock) hands the lock
/// directly to the longest-waiting fiber — ownership transfers without an
/// intermediate unlocked state, so a late arrival cannot barge in front of a
/// fiber that was already waiting.
pub struct Mutex {
    spin: QueueSpinLock,
    state: UnsafeCell<State>,
}

struct State {
    locked: bool,
    waiters: List<MutexWaiter>,
}

// Safety: `state` is only touched under `spin`.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl core::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Mutex ===

impl Mutex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            spin: QueueSpinLock::new(),
            state: UnsafeCell::new(State {
                locked: false,
                waiters: List::new(),
            }),
        }
    }

    /// Acquires the mutex, suspending the calling fiber while it is held
    /// elsewhere.
    ///
    /// # Panics
    ///
    /// Panics if it must suspend while called outside a fiber.
    pub fn lock(&self) {
        let node = SpinNode::new();
        let guard = self.spin.lock(&node);

        {
            // Safety: under the spinlock.
            let state = unsafe { &mut *self.state.get() };
            if !state.locked {
                state.locked = true;
                return; // guard releases on drop
            }
        }

        let fiber = fiber::current().expect("fiber mutex contended outside a fiber");
        let waiter = MutexWaiter::new(fiber);
        {
            // Safety: under the spinlock.
            let state = unsafe { &mut *self.state.get() };
            state.waiters.push_back(NonNull::from(&waiter));
        }

        // The spinlock is released only after this fiber has fully yielded,
        // so the waiter cannot be popped (nor the fiber resumed) early.
        let awaiter = UnlockAwaiter::new(&guard);
        fiber::suspend(&awaiter);
        // Resumed: the unlocking fiber handed ownership straight to us.
    }

    /// Releases the mutex, waking the longest-waiting fiber if any.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not locked.
    pub fn unlock(&self) {
        let node = SpinNode::new();
        let guard = self.spin.lock(&node);

        let next = {
            // Safety: under the spinlock.
            let state = unsafe { &mut *self.state.get() };
            assert!(state.locked, "fiber mutex unlocked while unlocked");
            match state.waiters.pop_front() {
                // Hand-off: `locked` stays set for the new owner.
                // Safety: popped waiters stay alive until their fiber is
                // scheduled, which only we can do now.
                Some(waiter) => Some(unsafe { waiter.as_ref() }.fiber()),
                None => {
                    state.locked = false;
                    None
                }
            }
        };

        drop(guard);
        if let Some(next) = next {
            next.schedule();
        }
    }

    /// Acquires the mutex and returns a guard that unlocks on drop.
    ///
    /// # Panics
    ///
    /// As for [`lock`](Self::lock).
    pub fn lock_scoped(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }
}

/// Releases a [`Mutex`] on drop.
#[derive(Debug)]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPool;
    use crate::sync::WaitGroup;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn uncontended_lock_needs_no_fiber() {
        // the fast path never suspends, so it also works from plain threads
        let mutex = Mutex::new();
        mutex.lock();
        mutex.unlock();
    }

    #[test]
    #[should_panic(expected = "unlocked while unlocked")]
    fn unlocking_an_unheld_mutex_panics() {
        let mutex = Mutex::new();
        mutex.unlock();
    }

    #[test]
    fn mutual_exclusion_over_a_plain_counter() {
        const FIBERS: usize = 100;
        const ITERS: usize = 100;

        struct Shared {
            mutex: Mutex,
            counter: UnsafeCell<usize>,
        }
        // Safety: `counter` is only touched under `mutex`.
        unsafe impl Sync for Shared {}
        unsafe impl Send for Shared {}

        let pool = ThreadPool::new(4);
        let shared = Arc::new(Shared {
            mutex: Mutex::new(),
            counter: UnsafeCell::new(0),
        });
        let wg = Arc::new(WaitGroup::new());

        wg.add(FIBERS as u64);
        for _ in 0..FIBERS {
            let shared = shared.clone();
            let wg = wg.clone();
            fiber::go(pool.clone(), move || {
                for _ in 0..ITERS {
                    shared.mutex.lock();
                    // Safety: under the mutex.
                    unsafe { *shared.counter.get() += 1 };
                    shared.mutex.unlock();
                }
                wg.done();
            });
        }

        pool.wait_idle();
        // Safety: all fibers completed.
        assert_eq!(unsafe { *shared.counter.get() }, FIBERS * ITERS);
        pool.stop();
    }

    #[test]
    fn unlock_hands_off_without_barging() {
        // One fiber holds the lock and a second parks on it. After the
        // holder unlocks, its own immediate re-lock must queue *behind* the
        // waiter: ownership was handed over, not released. A manual
        // executor makes the interleaving exact.
        let exec = Arc::new(crate::executor::ManualExecutor::new());
        let mutex = Arc::new(Mutex::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let m = mutex.clone();
        let o = order.clone();
        let exec2 = exec.clone();
        fiber::go(exec.clone(), move || {
            m.lock();

            let m2 = m.clone();
            let o2 = o.clone();
            fiber::go(exec2.clone(), move || {
                m2.lock();
                o2.lock().unwrap().push("waiter");
                m2.unlock();
            });

            // one yield puts us behind the waiter, which parks on the mutex
            fiber::yield_now();

            m.unlock();

            m.lock();
            o.lock().unwrap().push("late");
            m.unlock();
        });

        exec.drain();
        assert_eq!(*order.lock().unwrap(), vec!["waiter", "late"]);
    }

    #[test]
    fn guard_unlocks_on_drop() {
        let pool = ThreadPool::new(2);
        let mutex = Arc::new(Mutex::new());
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let mutex = mutex.clone();
            let hits = hits.clone();
            fiber::go(pool.clone(), move || {
                let _guard = mutex.lock_scoped();
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.wait_idle();
        assert_eq!(hits.load(Ordering::Relaxed), 10);
        pool.stop();
    }
}
