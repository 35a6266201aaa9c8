// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackful fibers.
//!
//! A fiber is a suspendable computation scheduled on an executor. It owns a
//! stackful coroutine and an inline *step* task — the thing the executor
//! actually queues. Running the step resumes the coroutine; when
//! the coroutine yields, the step invokes the [`Awaiter`] the fiber
//! published just before yielding, and that awaiter is the only party that
//! can make the fiber runnable again. When the coroutine completes, the
//! worker's normal discard pass frees the fiber.
//!
//! ```
//! use weft::executor::ThreadPool;
//! use weft::fiber;
//!
//! let pool = ThreadPool::new(2);
//! fiber::go(pool.clone(), || {
//!     fiber::yield_now(); // give other fibers a turn
//! });
//! pool.wait_idle();
//! pool.stop();
//! ```

pub(crate) mod awaiter;
mod coroutine;
mod future;

pub use awaiter::Awaiter;
pub use future::block_on;

use crate::executor::Schedule;
use crate::task::{Header, TaskRef, Vtable};
use awaiter::{RescheduleAwaiter, YieldAwaiter};
use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use coroutine::Coroutine;
use std::sync::Arc;

std::thread_local! {
    /// The fiber currently running on this thread, if any.
    static CURRENT: Cell<Option<NonNull<Fiber>>> = const { Cell::new(None) };
}

/// The task an executor schedules on behalf of a fiber.
///
/// Embedded inline in the fiber so that rescheduling never allocates. The
/// heap flag is set: the worker's discard-after-run pass is what eventually
/// frees the fiber, steered by `skip_discards`.
#[repr(C)]
#[derive(Debug)]
struct Step {
    /// Must be the first field: a `NonNull<Header>` to this step is also a
    /// pointer to the owning [`Fiber`].
    header: Header,
    /// Discards to swallow instead of freeing the fiber.
    ///
    /// `suspend` adds one before yielding; each discard consumes one, and a
    /// discard that finds zero frees the fiber. A fiber's life sees exactly
    /// one discard per run plus one per shutdown drain, which is one more
    /// than its suspension count — so precisely the last discard frees.
    /// (A plain re-armed boolean would race: the resumed step can suspend
    /// again on another worker before the first worker's post-run discard
    /// runs.)
    skip_discards: AtomicUsize,
}

static STEP_VTABLE: Vtable = Vtable {
    run: step_run,
    discard: step_discard,
};

impl Step {
    fn new() -> Self {
        Self {
            header: Header::new(&STEP_VTABLE, true),
            skip_discards: AtomicUsize::new(0),
        }
    }
}

/// A stackful user-space thread, scheduled on an executor.
#[repr(C)]
pub struct Fiber {
    /// Must be the first field; see [`Step::header`].
    step: Step,
    coro: Coroutine,
    sched: Arc<dyn Schedule>,
    /// The awaiter published by the most recent `suspend`, consumed by the
    /// step right after the coroutine yields.
    awaiter: Cell<Option<NonNull<dyn Awaiter>>>,
}

// === impl Fiber ===

impl Fiber {
    /// Enqueues this fiber's step on its executor.
    fn schedule(&self) {
        // Clone first: once the step is enqueued the fiber may complete on
        // another worker and drop its executor reference mid-call.
        let sched = self.sched.clone();
        let step = self.step_task();
        sched.execute(step);
    }

    fn yield_schedule(&self) {
        let sched = self.sched.clone();
        let step = self.step_task();
        sched.yield_execute(step);
    }

    fn step_task(&self) -> TaskRef {
        // Safety: the step is enqueued at most once at a time; whoever holds
        // this `TaskRef` is the unique scheduler of the fiber.
        unsafe { TaskRef::from_raw(NonNull::from(&self.step.header)) }
    }

    /// Publishes `awaiter` and yields the worker thread back to the
    /// executor. Returns when some party resumes the fiber.
    fn suspend(&self, awaiter: &dyn Awaiter) {
        // Safety: only the lifetime is erased. The awaiter lives in the
        // frame that is about to yield, and `suspend` does not return until
        // the fiber is resumed — after which the pointer is never read
        // again.
        let awaiter: NonNull<dyn Awaiter> = unsafe { core::mem::transmute(NonNull::from(awaiter)) };
        self.awaiter.set(Some(awaiter));

        // Arm the step against a racing shutdown drain freeing us while we
        // are still live on this path.
        self.step.skip_discards.fetch_add(1, Ordering::Release);

        self.coro.suspend();
    }
}

unsafe fn step_run(ptr: NonNull<Header>) {
    // Safety: the header is the first field of `Step`, which is the first
    // field of `Fiber`; both are `#[repr(C)]`.
    let fiber = ptr.cast::<Fiber>();

    // Restore the previous fiber even if the body panics out of `resume`.
    struct ResetCurrent(Option<NonNull<Fiber>>);
    impl Drop for ResetCurrent {
        fn drop(&mut self) {
            CURRENT.set(self.0);
        }
    }
    let _reset = ResetCurrent(CURRENT.replace(Some(fiber)));

    // Safety: the fiber is alive for the whole step: if the coroutine
    // completes it is freed only by the *caller's* discard pass, after we
    // return.
    let fiber = unsafe { fiber.as_ref() };
    fiber.coro.resume();

    if !fiber.coro.is_completed() {
        let awaiter = fiber
            .awaiter
            .take()
            .expect("fiber yielded without publishing an awaiter");
        // Safety: the awaiter lives on the (now suspended) coroutine stack.
        // After this call the fiber may run or be freed elsewhere; we touch
        // neither it nor the awaiter again.
        unsafe { awaiter.as_ref().await_suspend() };
    }
}

unsafe fn step_discard(ptr: NonNull<Header>) {
    let fiber = ptr.cast::<Fiber>();
    // Safety: as in `step_run`.
    let skips = unsafe { &fiber.as_ref().step.skip_discards };

    let mut pending = skips.load(Ordering::Acquire);
    loop {
        if pending == 0 {
            // The final discard: the coroutine completed (or a shutdown
            // drain owns the last reference). Dropping a still-suspended
            // coroutine unwinds its stack.
            drop(unsafe { Box::from_raw(fiber.as_ptr()) });
            return;
        }
        match skips.compare_exchange(pending, pending - 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(actual) => pending = actual,
        }
    }
}

/// A copyable reference to a fiber, valid while the fiber is alive.
///
/// This is the hand-off token carried by awaiters and wait-queue nodes: the
/// party that decides a suspended fiber may run again calls
/// [`schedule`](Self::schedule) on it.
#[derive(Debug, Clone, Copy)]
pub struct FiberHandle {
    fiber: NonNull<Fiber>,
}

// Safety: a handle is just a pointer; the scheduling protocol guarantees the
// fiber is alive whenever a handle is used (a suspended fiber cannot be
// freed before the party holding its handle resumes it).
unsafe impl Send for FiberHandle {}
unsafe impl Sync for FiberHandle {}

// === impl FiberHandle ===

impl FiberHandle {
    pub(crate) fn new(fiber: NonNull<Fiber>) -> Self {
        Self { fiber }
    }

    /// Makes the fiber runnable by enqueueing its step.
    pub fn schedule(&self) {
        // Safety: see the `Send` justification above.
        unsafe { self.fiber.as_ref() }.schedule();
    }

    /// Makes the fiber runnable through the yield path (global queue).
    pub fn yield_schedule(&self) {
        // Safety: as in `schedule`.
        unsafe { self.fiber.as_ref() }.yield_schedule();
    }

    /// The executor this fiber is scheduled on.
    pub fn scheduler(&self) -> Arc<dyn Schedule> {
        // Safety: as in `schedule`.
        unsafe { self.fiber.as_ref() }.sched.clone()
    }
}

/// Spawns a fiber running `f` on `sched`.
pub fn go<F>(sched: Arc<dyn Schedule>, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let fiber = Box::new(Fiber {
        step: Step::new(),
        coro: Coroutine::new(Box::new(f)),
        sched,
        awaiter: Cell::new(None),
    });
    let fiber = NonNull::from(Box::leak(fiber));
    FiberHandle::new(fiber).schedule();
}

/// The currently running fiber, if the calling thread is inside one.
pub fn current() -> Option<FiberHandle> {
    current_ptr().map(FiberHandle::new)
}

pub(crate) fn current_ptr() -> Option<NonNull<Fiber>> {
    CURRENT.get()
}

/// Suspends the current fiber on `awaiter`.
///
/// `awaiter.await_suspend()` runs on the worker thread right after the
/// coroutine yields; see [`Awaiter`] for the contract. Returns once another
/// party has resumed the fiber.
///
/// # Panics
///
/// Panics if called outside a fiber.
pub fn suspend(awaiter: &dyn Awaiter) {
    let fiber = current_ptr().expect("suspend called outside a fiber");
    // Safety: we are running on this fiber right now, so it is alive.
    unsafe { fiber.as_ref() }.suspend(awaiter);
}

/// Yields the current fiber to the back of the executor's global queue.
///
/// # Panics
///
/// Panics if called outside a fiber.
pub fn yield_now() {
    let handle = current().expect("yield_now called outside a fiber");
    let awaiter = YieldAwaiter::new(handle);
    suspend(&awaiter);
}

/// Suspends and immediately re-enqueues the current fiber through the
/// regular submission path. Unlike [`yield_now`] this may come straight back
/// via the worker-local fast paths; it is a scheduling point, not a fairness
/// point.
///
/// # Panics
///
/// Panics if called outside a fiber.
pub fn reschedule() {
    let handle = current().expect("reschedule called outside a fiber");
    let awaiter = RescheduleAwaiter::new(handle);
    suspend(&awaiter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ManualExecutor, ThreadPool};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn init_tracing() -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .finish(),
        )
    }

    #[test]
    fn fiber_runs_to_completion() {
        let _trace = init_tracing();
        let pool = ThreadPool::new(2);
        let done = Arc::new(AtomicBool::new(false));

        let flag = done.clone();
        go(pool.clone(), move || {
            flag.store(true, Ordering::Release);
        });

        pool.wait_idle();
        assert!(done.load(Ordering::Acquire));
        pool.stop();
    }

    #[test]
    fn yield_interleaves_fibers() {
        let _trace = init_tracing();
        // deterministic: a manual executor runs one step at a time
        let exec = Arc::new(ManualExecutor::new());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for name in ["a", "b"] {
            let log = log.clone();
            go(exec.clone(), move || {
                log.lock().unwrap().push(format!("{name}:1"));
                yield_now();
                log.lock().unwrap().push(format!("{name}:2"));
            });
        }

        exec.drain();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:1", "b:1", "a:2", "b:2"],
            "yield must push a fiber behind its peers"
        );
    }

    #[test]
    fn reschedule_is_a_scheduling_point() {
        let _trace = init_tracing();
        let exec = Arc::new(ManualExecutor::new());
        let steps = Arc::new(AtomicUsize::new(0));

        let counter = steps.clone();
        go(exec.clone(), move || {
            counter.fetch_add(1, Ordering::Relaxed);
            reschedule();
            counter.fetch_add(1, Ordering::Relaxed);
        });

        assert!(exec.run_next());
        assert_eq!(steps.load(Ordering::Relaxed), 1);
        exec.drain();
        assert_eq!(steps.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn current_is_scoped_to_the_fiber() {
        let _trace = init_tracing();
        let pool = ThreadPool::new(2);
        let checked = Arc::new(AtomicBool::new(false));

        assert!(current().is_none());

        let flag = checked.clone();
        go(pool.clone(), move || {
            assert!(current().is_some());
            flag.store(true, Ordering::Release);
        });

        pool.wait_idle();
        assert!(checked.load(Ordering::Acquire));
        assert!(current().is_none());
        pool.stop();
    }

    #[test]
    fn a_panicking_fiber_is_reaped_and_the_pool_survives() {
        let _trace = init_tracing();
        let pool = ThreadPool::new(2);

        go(pool.clone(), || panic!("fiber body failure"));
        pool.wait_idle();

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        go(pool.clone(), move || {
            flag.store(true, Ordering::Release);
        });
        pool.wait_idle();
        assert!(done.load(Ordering::Acquire));
        pool.stop();
    }

    #[test]
    fn thousands_of_fibers() {
        let _trace = init_tracing();
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..2_000 {
            let counter = counter.clone();
            go(pool.clone(), move || {
                yield_now();
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.wait_idle();
        assert_eq!(counter.load(Ordering::Relaxed), 2_000);
        pool.stop();
    }
}
