// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The stackful coroutine a fiber runs on.
//!
//! A thin layer over [`corosensei`]: `resume` and `suspend` switch between
//! the scheduler context and the coroutine's own stack, panics from the body
//! propagate out of `resume`, and dropping a suspended coroutine unwinds its
//! stack so live frames run their destructors.

use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;
use corosensei::Yielder;

pub(crate) struct Coroutine {
    inner: UnsafeCell<corosensei::Coroutine<(), (), ()>>,
    /// Set by the body on first entry; lets `suspend` reach the yielder from
    /// arbitrarily deep frames.
    yielder: Cell<Option<NonNull<Yielder<(), ()>>>>,
}

impl core::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Coroutine").finish_non_exhaustive()
    }
}

// === impl Coroutine ===

impl Coroutine {
    /// Creates a coroutine that runs `body` on its own stack.
    ///
    /// The body does not start until the first [`resume`](Self::resume), and
    /// that resume must come through a fiber step so the thread-local
    /// current fiber is set.
    pub(crate) fn new(body: Box<dyn FnOnce() + Send + 'static>) -> Self {
        let inner = corosensei::Coroutine::new(move |yielder, ()| {
            let fiber = super::current_ptr().expect("fiber body started outside a fiber step");
            // Safety: the step that resumed us keeps the fiber alive.
            let coro = &unsafe { fiber.as_ref() }.coro;
            coro.yielder.set(Some(NonNull::from(yielder)));
            body();
        });
        Self {
            inner: UnsafeCell::new(inner),
            yielder: Cell::new(None),
        }
    }

    /// Runs the coroutine until it suspends or completes.
    ///
    /// Panics thrown by the body unwind out of this call; afterwards the
    /// coroutine reports completed.
    pub(crate) fn resume(&self) {
        // Safety: only the fiber's step calls `resume`, and a step is
        // enqueued at most once at a time, so this exclusive borrow is
        // unique. Code running *inside* the coroutine touches only the
        // `yielder` cell, never `inner`.
        let inner = unsafe { &mut *self.inner.get() };
        let _ = inner.resume(());
    }

    /// Switches from the coroutine's stack back to its resumer.
    ///
    /// Must be called from within the coroutine.
    pub(crate) fn suspend(&self) {
        let yielder = self
            .yielder
            .get()
            .expect("suspend called outside the coroutine body");
        // Safety: the yielder lives on the coroutine stack for the whole
        // life of the coroutine.
        unsafe { yielder.as_ref() }.suspend(());
    }

    pub(crate) fn is_completed(&self) -> bool {
        // Safety: only read from the scheduler side, between resumes.
        unsafe { &*self.inner.get() }.done()
    }
}
