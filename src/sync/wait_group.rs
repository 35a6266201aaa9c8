// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A wait group for fibers: structured fan-in.

use crate::fiber;
use crate::fiber::awaiter::Awaiter;
use crate::fiber::FiberHandle;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, Ordering};

/// Waits for a collection of fibers (or any counted work) to finish.
///
/// [`add`](WaitGroup::add) before the work starts, [`done`](WaitGroup::done)
/// as each unit finishes, [`wait`](WaitGroup::wait) to suspend until the
/// count drains to zero.
///
/// Waiters park on a lock-free stack of nodes that live in their own
/// suspended stack frames; the `done` call that drops the count to zero
/// steals the whole stack, reverses it, and wakes everyone in FIFO order.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: AtomicI64,
    head: AtomicPtr<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    next: AtomicPtr<Waiter>,
    fiber: FiberHandle,
    /// The two-party wake handshake: whichever of {the waking `done`, the
    /// fiber's own `await_suspend`} flips this second does the scheduling.
    /// This closes the race where the count drains between the stack push
    /// and the coroutine actually yielding.
    woke: AtomicBool,
}

struct WaitGroupAwaiter<'a> {
    waiter: &'a Waiter,
}

impl Awaiter for WaitGroupAwaiter<'_> {
    fn await_suspend(&self) {
        if self.waiter.woke.swap(true, Ordering::AcqRel) {
            self.waiter.fiber.schedule();
        }
    }
}

// === impl WaitGroup ===

impl WaitGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `n` more units of work.
    pub fn add(&self, n: u64) {
        self.count.fetch_add(n as i64, Ordering::Release);
    }

    /// Marks one unit of work finished; the final `done` wakes all waiters.
    pub fn done(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "wait group done() without a matching add()");
        if prev == 1 {
            self.wake_all();
        }
    }

    /// Zeroes the count and wakes every waiter, regardless of outstanding
    /// `done` calls.
    pub fn all_done(&self) {
        self.count.store(0, Ordering::Release);
        self.wake_all();
    }

    /// Suspends the calling fiber until the count reaches zero. Returns
    /// immediately if it already is.
    ///
    /// # Panics
    ///
    /// Panics if it must suspend while called outside a fiber.
    pub fn wait(&self) {
        if self.count.load(Ordering::Acquire) == 0 {
            return;
        }

        let fiber = fiber::current().expect("wait group waited on outside a fiber");
        let waiter = Waiter {
            next: AtomicPtr::new(ptr::null_mut()),
            fiber,
            woke: AtomicBool::new(false),
        };
        self.push(&waiter);

        // The final `done` may have stolen the stack between the count check
        // and our push; flush it ourselves so the wakeup cannot be lost. Our
        // own node just bounces straight back through the handshake.
        if self.count.load(Ordering::Acquire) == 0 {
            self.wake_all();
        }

        let awaiter = WaitGroupAwaiter { waiter: &waiter };
        fiber::suspend(&awaiter);
    }

    fn push(&self, waiter: &Waiter) {
        let waiter_ptr = NonNull::from(waiter).as_ptr();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            waiter.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                waiter_ptr,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Steals the waiter stack, reverses it into FIFO order, and completes
    /// each waiter's wake handshake.
    fn wake_all(&self) {
        let mut stack = self.head.swap(ptr::null_mut(), Ordering::AcqRel);

        // reverse the LIFO chain
        let mut queue: *mut Waiter = ptr::null_mut();
        while let Some(waiter) = NonNull::new(stack) {
            // Safety: linked waiters are alive until their handshake
            // completes, and we have exclusive ownership of this chain.
            let waiter = unsafe { waiter.as_ref() };
            stack = waiter.next.load(Ordering::Relaxed);
            waiter.next.store(queue, Ordering::Relaxed);
            queue = NonNull::from(waiter).as_ptr();
        }

        while let Some(waiter) = NonNull::new(queue) {
            // Safety: as above. Everything is read out of the node *before*
            // the handshake: the moment `woke` flips, the waiting fiber may
            // resume (or be scheduled) and the node's frame may die.
            let waiter = unsafe { waiter.as_ref() };
            queue = waiter.next.load(Ordering::Relaxed);
            let fiber = waiter.fiber;
            if waiter.woke.swap(true, Ordering::AcqRel) {
                fiber.schedule();
            }
        }
    }
}
