// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A scalable queued spinlock.
//!
//! This is an MCS-style lock: each acquirer spins on a flag in its *own*
//! queue node instead of hammering a shared location, which avoids cache-line
//! ping-pong under contention and gives FIFO fairness. The channel layer
//! leans on that fairness — lock acquisition order is wake-up order.
//!
//! The queue node lives in the caller's frame and is passed in explicitly:
//!
//! ```
//! use weft::spin::{QueueSpinLock, SpinNode};
//!
//! let lock = QueueSpinLock::new();
//! let node = SpinNode::new();
//! {
//!     let guard = lock.lock(&node);
//!     // critical section
//!     drop(guard); // or `guard.unlock()` to release early
//! }
//! ```
//!
//! The explicit node keeps the lock allocation-free and lets borrowck pin the
//! node in place for as long as the guard — and therefore the queue — can
//! reference it.

use core::hint;
use core::marker::PhantomPinned;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// An [exponential backoff] for spin loops.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone, Default)]
pub struct Backoff {
    exp: u8,
}

// === impl Backoff ===

impl Backoff {
    /// The maximum exponent: at most `2^6` spin hints per call.
    const MAX_EXPONENT: u8 = 6;

    #[must_use]
    pub const fn new() -> Self {
        Self { exp: 0 }
    }

    /// Backs off in a spin loop, issuing `2^exp` spin-loop hints and growing
    /// the exponent up to [`Self::MAX_EXPONENT`].
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..(1_u32 << self.exp) {
            hint::spin_loop();
        }
        if self.exp < Self::MAX_EXPONENT {
            self.exp += 1;
        }
    }
}

/// A queue node for [`QueueSpinLock`].
///
/// One node supports one acquisition at a time; it can be reused once the
/// guard from the previous acquisition is gone.
#[derive(Debug, Default)]
pub struct SpinNode {
    /// Successor in the wait queue, written by the thread that enqueues
    /// behind us.
    next: AtomicPtr<SpinNode>,
    /// Set by our predecessor when it hands the lock to us.
    owner: AtomicBool,
    _pin: PhantomPinned,
}

impl SpinNode {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicBool::new(false),
            _pin: PhantomPinned,
        }
    }
}

/// A scalable MCS-style queued spinlock with FIFO fairness.
#[derive(Debug, Default)]
pub struct QueueSpinLock {
    tail: AtomicPtr<SpinNode>,
}

// === impl QueueSpinLock ===

impl QueueSpinLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Acquires the lock, spinning until it is ours.
    ///
    /// `node` is this acquisition's entry in the wait queue. The returned
    /// guard borrows it, so the node cannot move or be reused until the
    /// guard releases the lock.
    pub fn lock<'a>(&'a self, node: &'a SpinNode) -> Guard<'a> {
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        node.owner.store(false, Ordering::Relaxed);

        let node_ptr = NonNull::from(node).as_ptr();
        let prev = self.tail.swap(node_ptr, Ordering::AcqRel);

        if let Some(prev) = NonNull::new(prev) {
            // Link behind the previous tail, then wait for it to pass us
            // ownership.
            //
            // Safety: a linked node stays live until its owner flag has been
            // set (see `release`), so `prev` cannot have been reused yet.
            unsafe { prev.as_ref().next.store(node_ptr, Ordering::Release) };

            let mut backoff = Backoff::new();
            while !node.owner.load(Ordering::Acquire) {
                backoff.spin();
            }
        }

        Guard {
            lock: self,
            node,
            locked: AtomicBool::new(true),
        }
    }

    fn release(&self, node: &SpinNode) {
        let node_ptr = NonNull::from(node).as_ptr();

        // No successor: swing the tail back to empty.
        if self
            .tail
            .compare_exchange(node_ptr, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        // A successor swapped itself in but may not have linked yet; wait for
        // the link, then hand over ownership.
        let mut backoff = Backoff::new();
        loop {
            let next = node.next.load(Ordering::Acquire);
            if let Some(next) = NonNull::new(next) {
                // Safety: the successor spins on its own node until `owner`
                // is set; it is live.
                unsafe { next.as_ref().owner.store(true, Ordering::Release) };
                return;
            }
            backoff.spin();
        }
    }
}

/// Holds [`QueueSpinLock`] locked; releases on drop.
///
/// `unlock` takes `&self` so that an awaiter holding a reference to the
/// guard can release the lock *after* its fiber has yielded — the contract
/// that makes channel and mutex suspension race-free.
#[derive(Debug)]
pub struct Guard<'a> {
    lock: &'a QueueSpinLock,
    node: &'a SpinNode,
    locked: AtomicBool,
}

// === impl Guard ===

impl Guard<'_> {
    /// Releases the lock before the guard goes out of scope.
    ///
    /// # Panics
    ///
    /// Panics if the guard was already unlocked.
    pub fn unlock(&self) {
        assert!(
            self.locked.swap(false, Ordering::AcqRel),
            "queue spinlock guard unlocked twice"
        );
        self.lock.release(self.node);
    }

    #[cfg(test)]
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        if self.locked.swap(false, Ordering::AcqRel) {
            self.lock.release(self.node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guard_releases_on_drop() {
        let lock = QueueSpinLock::new();
        let node = SpinNode::new();
        drop(lock.lock(&node));

        // the lock is free again
        let node2 = SpinNode::new();
        drop(lock.lock(&node2));
    }

    #[test]
    fn early_unlock_disarms_drop() {
        let lock = QueueSpinLock::new();
        let node = SpinNode::new();
        let guard = lock.lock(&node);
        guard.unlock();
        assert!(!guard.is_locked());
        drop(guard);

        let node2 = SpinNode::new();
        drop(lock.lock(&node2));
    }

    #[test]
    #[should_panic(expected = "unlocked twice")]
    fn double_unlock_panics() {
        let lock = QueueSpinLock::new();
        let node = SpinNode::new();
        let guard = lock.lock(&node);
        guard.unlock();
        guard.unlock();
    }

    #[test]
    fn mutual_exclusion() {
        const THREADS: usize = 8;
        const ITERS: usize = 10_000;

        struct Shared {
            lock: QueueSpinLock,
            counter: core::cell::UnsafeCell<usize>,
        }
        // Safety: `counter` is only touched under `lock`.
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: QueueSpinLock::new(),
            counter: core::cell::UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        let node = SpinNode::new();
                        let _guard = shared.lock.lock(&node);
                        // Safety: under the lock.
                        unsafe { *shared.counter.get() += 1 };
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Safety: all writers joined.
        assert_eq!(unsafe { *shared.counter.get() }, THREADS * ITERS);
    }

    #[test]
    fn node_reuse_after_release() {
        let lock = QueueSpinLock::new();
        let node = SpinNode::new();
        for _ in 0..100 {
            let guard = lock.lock(&node);
            guard.unlock();
        }
    }
}
