// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Awaiting a [`Future`] from a fiber.
//!
//! [`block_on`] polls the future on the fiber's own stack with a waker that
//! schedules the fiber's step. The only delicate part is the race between
//! the waker firing and the fiber actually finishing its suspension: a small
//! state machine arbitrates it, and whichever side arrives *second* is the
//! one that schedules the fiber.

use crate::fiber::awaiter::Awaiter;
use crate::fiber::{self, FiberHandle};
use core::future::Future;
use core::pin::pin;
use core::sync::atomic::{AtomicU8, Ordering};
use core::task::{Context, Poll, Waker};
use std::sync::Arc;
use std::task::Wake;

/// The fiber is awake (polling, or about to poll).
const EMPTY: u8 = 0;
/// The fiber has suspended; the next wake schedules it.
const WAITING: u8 = 1;
/// A wake arrived; if the fiber has not finished suspending, its
/// `await_suspend` schedules it itself.
const NOTIFIED: u8 = 2;
/// The future completed. Late wakes are no-ops.
const DONE: u8 = 3;

struct WakeState {
    state: AtomicU8,
    fiber: FiberHandle,
}

impl Wake for WakeState {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                // Wake during a poll: remember it, the fiber is running.
                EMPTY => NOTIFIED,
                // Wake of a suspended fiber: claim the right to schedule.
                WAITING => NOTIFIED,
                // Already notified or finished: nothing to do. This is also
                // what keeps stale wakers harmless after the fiber is gone —
                // the state lives in this `Arc`, not in the fiber.
                NOTIFIED | DONE => return,
                _ => unreachable!("invalid wake state"),
            };
            match self
                .state
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(WAITING) => {
                    self.fiber.schedule();
                    return;
                }
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }
}

/// Completes the suspension handshake on the fiber side.
struct FutureAwaiter<'a> {
    state: &'a WakeState,
}

impl Awaiter for FutureAwaiter<'_> {
    fn await_suspend(&self) {
        match self.state.state.compare_exchange(
            EMPTY,
            WAITING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // Suspended cleanly; the waker will schedule us.
            Ok(_) => {}
            // The wake already landed: schedule ourselves.
            Err(NOTIFIED) => self.state.fiber.schedule(),
            Err(state) => unreachable!("invalid await state {state}"),
        }
    }
}

/// Runs `future` to completion on the current fiber, suspending the fiber
/// whenever the future is pending.
///
/// The future is bounded to `Send` because a suspended fiber — the stack the
/// future lives on — may be resumed on a different worker thread.
///
/// # Panics
///
/// Panics if called outside a fiber.
pub fn block_on<F>(future: F) -> F::Output
where
    F: Future + Send,
{
    let handle = fiber::current().expect("block_on called outside a fiber");
    let state = Arc::new(WakeState {
        state: AtomicU8::new(EMPTY),
        fiber: handle,
    });
    let waker = Waker::from(state.clone());
    let mut cx = Context::from_waker(&waker);

    let mut future = pin!(future);
    loop {
        state.state.store(EMPTY, Ordering::Release);
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            state.state.store(DONE, Ordering::Release);
            return output;
        }

        let awaiter = FutureAwaiter { state: &state };
        fiber::suspend(&awaiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPool;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// Pending until another thread flips it and wakes the stored waker.
    #[derive(Default)]
    struct Flag {
        inner: Mutex<FlagInner>,
    }

    #[derive(Default)]
    struct FlagInner {
        set: bool,
        waker: Option<Waker>,
    }

    impl Flag {
        fn set(&self) {
            let waker = {
                let mut inner = self.inner.lock().unwrap();
                inner.set = true;
                inner.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    struct FlagFuture(Arc<Flag>);

    impl Future for FlagFuture {
        type Output = u32;

        fn poll(self: core::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u32> {
            let mut inner = self.0.inner.lock().unwrap();
            if inner.set {
                Poll::Ready(42)
            } else {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    #[test]
    fn ready_future_never_suspends() {
        let pool = ThreadPool::new(2);
        let done = Arc::new(AtomicBool::new(false));

        let flag = Arc::new(Flag::default());
        flag.set();

        let done2 = done.clone();
        fiber::go(pool.clone(), move || {
            assert_eq!(block_on(FlagFuture(flag)), 42);
            done2.store(true, Ordering::Release);
        });

        pool.wait_idle();
        assert!(done.load(Ordering::Acquire));
        pool.stop();
    }

    #[test]
    fn cross_thread_wake_resumes_the_fiber() {
        let pool = ThreadPool::new(2);
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::new(Flag::default());

        let flag2 = flag.clone();
        let done2 = done.clone();
        fiber::go(pool.clone(), move || {
            assert_eq!(block_on(FlagFuture(flag2)), 42);
            done2.store(true, Ordering::Release);
        });

        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.set();
        });

        setter.join().unwrap();
        pool.wait_idle();
        assert!(done.load(Ordering::Acquire));
        pool.stop();
    }

    /// A future that wakes itself during poll, exercising the
    /// notified-before-suspended branch of the handshake.
    struct EagerWake {
        polls: Arc<AtomicUsize>,
    }

    impl Future for EagerWake {
        type Output = ();

        fn poll(self: core::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.polls.fetch_add(1, Ordering::Relaxed) < 3 {
                cx.waker().wake_by_ref();
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        }
    }

    #[test]
    fn wake_during_poll_is_not_lost() {
        let pool = ThreadPool::new(2);
        let polls = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let polls2 = polls.clone();
        let done2 = done.clone();
        fiber::go(pool.clone(), move || {
            block_on(EagerWake { polls: polls2 });
            done2.store(true, Ordering::Release);
        });

        pool.wait_idle();
        assert!(done.load(Ordering::Acquire));
        assert_eq!(polls.load(Ordering::Relaxed), 4);
        pool.stop();
    }
}
