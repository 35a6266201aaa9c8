// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded channels for fibers.
//!
//! A [`Channel`] is a ring buffer plus two wait queues: a FIFO of producer
//! waiters (fibers suspended in [`send`](Channel::send) with their value in
//! hand) and a list of consumer waiters (fibers suspended in
//! [`recv`](Channel::recv), or select arms). One queued spinlock guards all
//! of it, and its FIFO fairness is what makes wake-up order match enqueue
//! order.
//!
//! The invariant to keep in mind: producers wait only while the buffer is
//! full, consumers only while it is empty, so at any quiescent point at most
//! one of the two queues is populated.
//!
//! Waiter nodes live in the suspended fibers' own stack frames — enqueueing
//! never allocates. A node can only be pushed while holding the channel
//! lock, and for plain send/recv that lock is released *after* the fiber
//! has yielded (by the awaiter), so a waiter can never be popped before its
//! fiber is fully suspended. Select arms are the exception: they are
//! enqueued with the fiber still running, and the wake handshake in
//! [`select`](crate::select) covers that window.

use crate::fiber;
use crate::fiber::FiberHandle;
use crate::fiber::awaiter::UnlockAwaiter;
use crate::spin::{QueueSpinLock, SpinNode};
use cordyceps::{Linked, List, list};
use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomPinned;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A bounded multi-producer multi-consumer channel for fibers.
///
/// Cloning shares the same underlying channel. Capacity must be positive;
/// rendezvous behavior falls out of capacity 1 plus a waiting consumer
/// (values are handed straight across without touching the buffer).
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> core::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

struct Shared<T> {
    lock: QueueSpinLock,
    state: UnsafeCell<State<T>>,
}

// Safety: `state` is only touched under `lock`; values are `Send`.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

struct State<T> {
    slots: Box<[MaybeUninit<T>]>,
    /// Completed receives; the front of the buffer is `head % capacity`.
    head: u64,
    /// Completed sends; the back of the buffer is `tail % capacity`.
    tail: u64,
    /// Fibers suspended in `send`, FIFO, each carrying its value.
    senders: List<TxWaiter<T>>,
    /// Fibers suspended in `recv`, plus enqueued select arms.
    receivers: List<RxWaiter<T>>,
}

// === impl State ===

impl<T> State<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        (self.tail - self.head) as usize
    }

    fn push_back(&mut self, value: T) {
        debug_assert!(self.len() < self.capacity());
        let index = (self.tail % self.capacity() as u64) as usize;
        self.slots[index].write(value);
        self.tail += 1;
    }

    fn pop_front(&mut self) -> T {
        debug_assert!(self.len() > 0);
        let index = (self.head % self.capacity() as u64) as usize;
        self.head += 1;
        // Safety: slots in [head, tail) are initialized.
        unsafe { self.slots[index].assume_init_read() }
    }

    /// After a receive freed a slot: move the longest-waiting producer's
    /// value into the buffer and make that producer runnable.
    fn refill_from_sender(&mut self) {
        if let Some(tx) = self.senders.pop_front() {
            // Safety: a popped sender waiter stays alive until its fiber is
            // scheduled, which only we can do.
            let tx = unsafe { tx.as_ref() };
            let value = tx.take_value();
            self.push_back(value);
            tx.fiber().schedule();
        }
    }
}

impl<T> Drop for State<T> {
    fn drop(&mut self) {
        while self.len() > 0 {
            drop(self.pop_front());
        }
    }
}

/// A producer waiter: a fiber suspended in `send`, value in hand.
pub(crate) struct TxWaiter<T> {
    links: list::Links<TxWaiter<T>>,
    value: UnsafeCell<Option<T>>,
    fiber: FiberHandle,
    _pin: PhantomPinned,
}

// === impl TxWaiter ===

impl<T> TxWaiter<T> {
    fn new(value: T, fiber: FiberHandle) -> Self {
        Self {
            links: list::Links::new(),
            value: UnsafeCell::new(Some(value)),
            fiber,
            _pin: PhantomPinned,
        }
    }

    fn fiber(&self) -> FiberHandle {
        self.fiber
    }

    /// Takes the carried value. Called once, by the receiver that popped
    /// this waiter, under the channel lock.
    fn take_value(&self) -> T {
        // Safety: only the popping receiver touches the value, and the node
        // is alive until its fiber is scheduled.
        unsafe { (*self.value.get()).take() }.expect("producer waiter resumed twice")
    }
}

// Safety: waiters are linked into exactly one list, the links are only
// touched under the channel lock, and handles are plain pointers.
unsafe impl<T> Linked<list::Links<TxWaiter<T>>> for TxWaiter<T> {
    type Handle = NonNull<Self>;

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

/// A consumer waiter: either a fiber suspended in `recv`, or one arm of a
/// `select`.
///
/// The channel does not care which: it pops the node and offers it the
/// value through the `deliver` callback. A plain receiver always accepts; a
/// select arm whose select already completed elsewhere *declines*, and the
/// channel moves on to the next consumer (or the buffer) so the value is
/// never dropped.
pub(crate) struct RxWaiter<T> {
    links: list::Links<RxWaiter<T>>,
    /// Whether the node is currently linked into the consumer list.
    /// Guarded by the channel lock.
    queued: Cell<bool>,
    deliver: unsafe fn(NonNull<()>, &mut Option<T>) -> bool,
    /// The enclosing frame handed to `deliver`; bound before enqueueing.
    frame: Cell<Option<NonNull<()>>>,
    _pin: PhantomPinned,
}

// === impl RxWaiter ===

impl<T> RxWaiter<T> {
    pub(crate) fn new(deliver: unsafe fn(NonNull<()>, &mut Option<T>) -> bool) -> Self {
        Self {
            links: list::Links::new(),
            queued: Cell::new(false),
            deliver,
            frame: Cell::new(None),
            _pin: PhantomPinned,
        }
    }

    /// Points the node at its enclosing frame. Must precede enqueueing.
    pub(crate) fn bind(&self, frame: NonNull<()>) {
        self.frame.set(Some(frame));
    }

    /// Offers `value` to this consumer. Returns whether it was accepted;
    /// on decline the value stays in `value`.
    ///
    /// # Safety
    ///
    /// The node must be alive and bound, and the caller must hold the
    /// channel lock of the channel it was queued on.
    unsafe fn resume(&self, value: &mut Option<T>) -> bool {
        let frame = self.frame.get().expect("consumer waiter never bound");
        // Safety: per the caller contract.
        unsafe { (self.deliver)(frame, value) }
    }
}

// Safety: as for `TxWaiter`.
unsafe impl<T> Linked<list::Links<RxWaiter<T>>> for RxWaiter<T> {
    type Handle = NonNull<Self>;

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

/// What a plain `recv` suspends on: the waiter node plus the slot the
/// sender delivers into.
struct RecvFrame<T> {
    waiter: RxWaiter<T>,
    slot: UnsafeCell<Option<T>>,
    fiber: FiberHandle,
}

impl<T> RecvFrame<T> {
    fn new(fiber: FiberHandle) -> Self {
        Self {
            waiter: RxWaiter::new(deliver_recv::<T>),
            slot: UnsafeCell::new(None),
            fiber,
        }
    }
}

unsafe fn deliver_recv<T>(frame: NonNull<()>, value: &mut Option<T>) -> bool {
    // Safety: the frame outlives the suspension, and only the (single)
    // delivering sender touches the slot before the fiber resumes.
    let frame = unsafe { frame.cast::<RecvFrame<T>>().as_ref() };
    // Safety: as above.
    unsafe { *frame.slot.get() = value.take() };
    frame.fiber.schedule();
    true
}

/// Outcome of offering a select arm to a channel.
pub(crate) enum SelectorPoll<T> {
    /// The arm claimed this channel's buffered value.
    Value(T),
    /// The select was already completed by another arm.
    Lost,
    /// Nothing buffered; the arm is now queued as a consumer.
    Pending,
}

// === impl Channel ===

impl<T: Send> Channel<T> {
    /// Creates a channel holding up to `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be positive");
        Self {
            shared: Arc::new(Shared {
                lock: QueueSpinLock::new(),
                state: UnsafeCell::new(State {
                    slots: (0..capacity).map(|_| MaybeUninit::uninit()).collect(),
                    head: 0,
                    tail: 0,
                    senders: List::new(),
                    receivers: List::new(),
                }),
            }),
        }
    }

    /// Sends a value, suspending the calling fiber while the channel is
    /// full.
    ///
    /// # Panics
    ///
    /// Panics if it must suspend while called outside a fiber.
    pub fn send(&self, value: T) {
        let mut value = Some(value);
        let node = SpinNode::new();
        let guard = self.shared.lock.lock(&node);

        {
            // Safety: under the channel lock.
            let state = unsafe { &mut *self.shared.state.get() };

            // deliver straight to the longest-waiting consumer
            while let Some(rx) = state.receivers.pop_front() {
                // Safety: popped consumer waiters stay alive until their
                // fiber is resumed.
                let rx = unsafe { rx.as_ref() };
                rx.queued.set(false);
                // Safety: we hold this channel's lock.
                if unsafe { rx.resume(&mut value) } {
                    return; // guard releases on drop
                }
                // a select arm that lost declines; offer the next consumer
            }

            if state.len() < state.capacity() {
                state.push_back(value.take().expect("value already delivered"));
                return;
            }
        }

        // full: park as a producer, value in hand
        let fiber = fiber::current().expect("channel send outside a fiber");
        let waiter = TxWaiter::new(value.take().expect("value already delivered"), fiber);
        {
            // Safety: under the channel lock.
            let state = unsafe { &mut *self.shared.state.get() };
            state.senders.push_back(NonNull::from(&waiter));
        }

        // The lock is released only once this fiber has yielded; a receiver
        // popping the waiter therefore cannot resume us too early.
        let awaiter = UnlockAwaiter::new(&guard);
        fiber::suspend(&awaiter);
        // resumed: a receiver moved the value on
    }

    /// Sends without suspending. On a full channel the value is handed
    /// back.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        let mut value = Some(value);
        let node = SpinNode::new();
        let _guard = self.shared.lock.lock(&node);

        // Safety: under the channel lock.
        let state = unsafe { &mut *self.shared.state.get() };

        while let Some(rx) = state.receivers.pop_front() {
            // Safety: as in `send`.
            let rx = unsafe { rx.as_ref() };
            rx.queued.set(false);
            // Safety: we hold this channel's lock.
            if unsafe { rx.resume(&mut value) } {
                return Ok(());
            }
        }

        if state.len() < state.capacity() {
            state.push_back(value.take().expect("value already delivered"));
            return Ok(());
        }

        Err(value.take().expect("value already delivered"))
    }

    /// Receives a value, suspending the calling fiber while the channel is
    /// empty.
    ///
    /// # Panics
    ///
    /// Panics if it must suspend while called outside a fiber.
    pub fn recv(&self) -> T {
        let node = SpinNode::new();
        let guard = self.shared.lock.lock(&node);

        {
            // Safety: under the channel lock.
            let state = unsafe { &mut *self.shared.state.get() };
            if state.len() > 0 {
                let value = state.pop_front();
                state.refill_from_sender();
                return value; // guard releases on drop
            }
        }

        // empty: park as a consumer
        let fiber = fiber::current().expect("channel recv outside a fiber");
        let frame = RecvFrame::new(fiber);
        frame.waiter.bind(NonNull::from(&frame).cast());
        {
            // Safety: under the channel lock.
            let state = unsafe { &mut *self.shared.state.get() };
            state.receivers.push_back(NonNull::from(&frame.waiter));
            frame.waiter.queued.set(true);
        }

        let awaiter = UnlockAwaiter::new(&guard);
        fiber::suspend(&awaiter);

        // resumed: a sender delivered into our slot
        // Safety: the delivering sender is done with the frame.
        unsafe { (*frame.slot.get()).take() }.expect("receiver resumed without a value")
    }

    /// Receives without suspending.
    pub fn try_recv(&self) -> Option<T> {
        let node = SpinNode::new();
        let _guard = self.shared.lock.lock(&node);

        // Safety: under the channel lock.
        let state = unsafe { &mut *self.shared.state.get() };
        if state.len() > 0 {
            let value = state.pop_front();
            state.refill_from_sender();
            return Some(value);
        }
        None
    }

    /// Offers a select arm to this channel: claim a buffered value, or
    /// enqueue the arm as a consumer.
    ///
    /// Unlike `recv`, the channel lock is released *before* the selecting
    /// fiber suspends; the select wake handshake covers that window.
    pub(crate) fn selector_poll(
        &self,
        waiter: NonNull<RxWaiter<T>>,
        claimed: &AtomicBool,
    ) -> SelectorPoll<T> {
        let node = SpinNode::new();
        let _guard = self.shared.lock.lock(&node);

        // Safety: under the channel lock.
        let state = unsafe { &mut *self.shared.state.get() };

        if state.len() > 0 {
            if claimed.swap(true, Ordering::AcqRel) {
                // another arm was delivered to while we were enqueueing
                return SelectorPoll::Lost;
            }
            let value = state.pop_front();
            state.refill_from_sender();
            return SelectorPoll::Value(value);
        }

        state.receivers.push_back(waiter);
        // Safety: the arm is alive for the whole select call.
        unsafe { waiter.as_ref() }.queued.set(true);
        SelectorPoll::Pending
    }

    /// Removes a select arm from the consumer list if it is still queued.
    ///
    /// Taking the lock unconditionally is what fences this against an
    /// in-flight delivery: a sender that popped the arm finishes with it
    /// before releasing the lock, so after this returns no sender can touch
    /// the arm again.
    pub(crate) fn selector_unlink(&self, waiter: NonNull<RxWaiter<T>>) {
        let node = SpinNode::new();
        let _guard = self.shared.lock.lock(&node);

        // Safety: under the channel lock.
        let state = unsafe { &mut *self.shared.state.get() };
        // Safety: the arm is alive for the whole select call.
        if unsafe { waiter.as_ref() }.queued.replace(false) {
            // Safety: `queued` says the node is linked in this list.
            unsafe { state.receivers.remove(waiter) };
        }
    }
}
