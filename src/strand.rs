// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Strands: serial execution on top of any executor.
//!
//! A [`Strand`] is an asynchronous mutex over tasks. Submissions go onto a
//! lock-free LIFO stack; whoever pushes onto an *empty* stack becomes
//! responsible for dispatching: it captures the chain, reverses it into
//! submission order, and hands the whole batch to the backing executor as a
//! single task. The stack head is parked on a sentinel pointer while the
//! batch is in flight, so at most one batch ever runs — tasks on one strand
//! never overlap, and they run in submission order.

use crate::executor::Schedule;
use crate::task::{Header, TaskQueue, TaskRef, Vtable, discard_task, run_task};
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

/// Marks the submission stack as "a batch is in flight". Never dereferenced;
/// only compared by address.
fn locked_sentinel() -> *mut Header {
    static SENTINEL: u8 = 0;
    (&raw const SENTINEL).cast_mut().cast()
}

/// The reusable batch task. Lives inline in the strand: submitting to a
/// strand never allocates beyond the task itself.
#[repr(C)]
struct Batch {
    header: Header,
    /// The tasks of the in-flight batch, in submission order. Only the
    /// dispatcher (there is at most one at a time) touches this.
    tasks: UnsafeCell<TaskQueue>,
    /// Keeps the strand alive while the batch sits in an executor queue:
    /// the batch points back into the strand, so the strand must not drop
    /// first even if the caller lets go of every handle.
    keep_alive: UnsafeCell<Option<Arc<Strand>>>,
}

static BATCH_VTABLE: Vtable = Vtable {
    run: batch_run,
    discard: batch_discard,
};

impl Batch {
    fn new() -> Self {
        Self {
            header: Header::new(&BATCH_VTABLE, false),
            tasks: UnsafeCell::new(TaskQueue::new()),
            keep_alive: UnsafeCell::new(None),
        }
    }
}

unsafe fn batch_run(ptr: NonNull<Header>) {
    // Safety: the header is the first field of `Batch`, the batch is a
    // field of its strand, and `keep_alive` pins the strand while the batch
    // is in flight.
    let batch = ptr.cast::<Batch>();
    let strand = unsafe {
        batch
            .byte_sub(core::mem::offset_of!(Strand, batch))
            .cast::<Strand>()
    };
    let strand = unsafe { strand.as_ref() };

    // Hold the strand across the whole batch; `unlock` may re-dispatch and
    // store a fresh pin before we let go of this one.
    // Safety: the single-dispatcher discipline makes us the sole accessor.
    let strand_pin = unsafe { &mut *strand.batch.keep_alive.get() }
        .take()
        .expect("strand batch ran without a keep-alive pin");

    // Safety: as above.
    let mut tasks = core::mem::take(unsafe { &mut *strand.batch.tasks.get() });
    while let Some(task) = tasks.try_pop() {
        run_task(task);
    }

    strand.unlock();
    drop(strand_pin);
}

unsafe fn batch_discard(_: NonNull<Header>) {
    // The batch is not heap-owned, and executors only discard heap tasks. A
    // drained batch leaks its strand pin instead — a leak, never a dangling
    // batch.
    unreachable!("a strand batch task must never be discarded");
}

/// A serial sub-executor over a backing [`Schedule`].
pub struct Strand {
    exec: Arc<dyn Schedule>,
    /// LIFO submission stack: null = empty and idle, [`locked_sentinel`] =
    /// batch in flight with nothing queued behind it, anything else = chain
    /// of pending tasks.
    head: AtomicPtr<Header>,
    batch: Batch,
    self_weak: Weak<Strand>,
}

// Safety: the submission stack is published with release/acquire CAS pairs,
// and the batch state is touched only by the single dispatcher.
unsafe impl Send for Strand {}
unsafe impl Sync for Strand {}

impl core::fmt::Debug for Strand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Strand").finish_non_exhaustive()
    }
}

// === impl Strand ===

impl Strand {
    /// Creates a strand over `exec`.
    ///
    /// Returned in an [`Arc`]: the in-flight batch refers back into the
    /// strand, so the strand needs a stable address (and pins itself alive
    /// while a batch is queued).
    pub fn new(exec: Arc<dyn Schedule>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            exec,
            head: AtomicPtr::new(ptr::null_mut()),
            batch: Batch::new(),
            self_weak: self_weak.clone(),
        })
    }

    /// Captures the pending chain, marks the strand locked, and submits the
    /// batch to the backing executor.
    fn dispatch(&self) {
        let mut head = self.head.swap(locked_sentinel(), Ordering::AcqRel);

        // Reverse the captured LIFO chain in place. The oldest node's link
        // is null (pushed onto an empty stack) or the sentinel (pushed
        // while a batch was in flight).
        let sentinel = locked_sentinel();
        let mut reversed: *mut Header = ptr::null_mut();
        while !head.is_null() && head != sentinel {
            // Safety: chained nodes are live tasks this dispatcher owns.
            let next = unsafe { (*head).next.get() };
            unsafe { (*head).next.set(reversed) };
            reversed = head;
            head = next;
        }

        let mut queue = TaskQueue::new();
        let mut cursor = reversed;
        while let Some(node) = NonNull::new(cursor) {
            // Safety: as above; read the link before the queue relinks it.
            cursor = unsafe { node.as_ref().next.get() };
            queue.push(unsafe { TaskRef::from_raw(node) });
        }

        debug_assert!(!queue.is_empty(), "dispatched an empty strand batch");
        tracing::trace!(tasks = queue.len(), "dispatching strand batch");

        let pin = self
            .self_weak
            .upgrade()
            .expect("strand dispatched during teardown");
        // Safety: we are the sole dispatcher until the batch finishes.
        unsafe {
            *self.batch.tasks.get() = queue;
            *self.batch.keep_alive.get() = Some(pin);
        }
        let batch = unsafe { TaskRef::from_raw(NonNull::from(&self.batch.header)) };
        self.exec.execute(batch);
    }

    /// Called by the batch after it drained its tasks: either the stack is
    /// still just the sentinel (swing it back to empty), or new work
    /// arrived while the batch ran and a fresh batch must be dispatched.
    fn unlock(&self) {
        if self
            .head
            .compare_exchange(
                locked_sentinel(),
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return;
        }
        self.dispatch();
    }
}

impl Schedule for Strand {
    fn execute(&self, task: TaskRef) {
        let node = task.into_raw();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: we own the task until the CAS publishes it.
            unsafe { node.as_ref().next.set(head) };
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(prev) => {
                    // Pushing onto an empty, idle stack makes us the
                    // dispatcher.
                    if prev.is_null() {
                        self.dispatch();
                    }
                    return;
                }
                Err(actual) => head = actual,
            }
        }
    }
}

impl Drop for Strand {
    fn drop(&mut self) {
        // A live batch pins the strand, so at this point no batch is queued
        // and the chain can only hold tasks that never got dispatched.
        let sentinel = locked_sentinel();
        let mut head = *self.head.get_mut();
        while !head.is_null() && head != sentinel {
            // Safety: sole owner at drop time.
            let next = unsafe { (*head).next.get() };
            discard_task(unsafe { TaskRef::from_raw(NonNull::new_unchecked(head)) });
            head = next;
        }
    }
}
