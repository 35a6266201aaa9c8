// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives that suspend fibers, not threads.
//!
//! Waiting never blocks a worker: a fiber that cannot make progress parks
//! itself on an intrusive waiter node (living in its own suspended stack
//! frame) and yields the worker to other work.

mod condvar;
mod mutex;
mod wait_group;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
pub use wait_group::WaitGroup;

use crate::fiber::FiberHandle;
use cordyceps::{Linked, list};
use core::marker::PhantomPinned;
use core::ptr::NonNull;

/// A waiter node for [`Mutex`] and [`Condvar`] queues.
///
/// Lives in the suspended fiber's stack frame; the queue that links it is
/// protected by the owning primitive's spinlock, and the node stays valid
/// until the fiber is resumed — which only the party that popped it can do.
pub(crate) struct MutexWaiter {
    links: list::Links<MutexWaiter>,
    fiber: FiberHandle,
    _pin: PhantomPinned,
}

impl MutexWaiter {
    pub(crate) fn new(fiber: FiberHandle) -> Self {
        Self {
            links: list::Links::new(),
            fiber,
            _pin: PhantomPinned,
        }
    }

    pub(crate) fn fiber(&self) -> FiberHandle {
        self.fiber
    }
}

// Safety: `MutexWaiter` is only ever linked into one list at a time, the
// links field is only touched through the list (under the owning
// primitive's spinlock), and handles are plain pointers.
unsafe impl Linked<list::Links<MutexWaiter>> for MutexWaiter {
    type Handle = NonNull<MutexWaiter>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        handle
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        // Safety: projecting to a field of a live node.
        unsafe { NonNull::new_unchecked(&raw mut (*ptr.as_ptr()).links) }
    }
}
