// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-worker bounded SPMC ring.
//!
//! One producer — the owning worker — pushes and pops at full speed; any
//! other worker may steal, either one task at a time or a whole batch.
//! `head` and `tail` are monotonically increasing operation counters, not
//! indices; the slot for counter `c` is `c % CAPACITY`, and `tail - head` is
//! the queue length.

use crate::task::{Header, TaskRef};
use arrayvec::ArrayVec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Capacity of each worker's local ring.
pub(crate) const LOCAL_QUEUE_CAPACITY: usize = 1024;

/// A bounded single-producer multi-consumer ring of tasks.
#[derive(Debug)]
pub(crate) struct Ring {
    slots: Box<[AtomicPtr<Header>]>,
    /// Count of completed pops (owner pops and steals).
    head: AtomicU64,
    /// Count of completed pushes. Written only by the owning worker.
    tail: AtomicU64,
}

// === impl Ring ===

impl Ring {
    pub(crate) fn new() -> Self {
        let slots = (0..LOCAL_QUEUE_CAPACITY)
            .map(|_| AtomicPtr::new(core::ptr::null_mut()))
            .collect();
        Self {
            slots,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    fn slot(&self, counter: u64) -> &AtomicPtr<Header> {
        &self.slots[(counter % LOCAL_QUEUE_CAPACITY as u64) as usize]
    }

    /// Pushes a task. Only the owning worker may call this. Fails when the
    /// ring is full; the caller is expected to spill half the ring into the
    /// global queue and retry.
    pub(crate) fn try_push(&self, task: TaskRef) -> Result<(), TaskRef> {
        // A stale head can only under-report free space, which at worst makes
        // us spill early.
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);

        if tail - head == LOCAL_QUEUE_CAPACITY as u64 {
            return Err(task);
        }

        self.slot(tail).store(task.into_raw().as_ptr(), Ordering::Relaxed);
        // Publish the slot write to stealers.
        self.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    /// Pops one task from the front. Called by the owning worker; contends
    /// with stealers on `head`.
    pub(crate) fn try_pop(&self) -> Option<TaskRef> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }

            let ptr = self.slot(head).load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, head + 1, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => {
                    let ptr = NonNull::new(ptr).expect("ring slot was null");
                    // Safety: the successful head CAS makes us the unique
                    // owner of this slot's task.
                    return Some(unsafe { TaskRef::from_raw(ptr) });
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Steals up to `N` tasks into `out`.
    ///
    /// The copy is optimistic: the slots are read first and the head is
    /// advanced afterwards with a single compare-exchange, so a lost race
    /// restarts the whole copy and the published batch is exactly the set of
    /// tasks actually claimed. Nothing is ever written to a task that was
    /// not claimed.
    pub(crate) fn grab<const N: usize>(&self, out: &mut ArrayVec<TaskRef, N>) -> usize {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            out.clear();

            let tail = self.tail.load(Ordering::Acquire);
            let grabbed = (tail - head).min(N as u64);
            if grabbed == 0 {
                return 0;
            }

            for i in 0..grabbed {
                let ptr = self.slot(head + i).load(Ordering::Relaxed);
                let ptr = NonNull::new(ptr).expect("ring slot was null");
                // Safety: ownership is only real once the CAS below
                // succeeds; on failure `out` is cleared without touching the
                // tasks.
                out.push(unsafe { TaskRef::from_raw(ptr) });
            }

            // SeqCst so the slot reads above cannot be ordered past the
            // claim; once the head moves, the producer may reuse the slots.
            match self.head.compare_exchange(
                head,
                head + grabbed,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return grabbed as usize,
                Err(actual) => head = actual,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }
}
