// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Randomized multi-way receive.
//!
//! [`select2`]/[`select3`]/[`select4`] wait on several channels of possibly
//! distinct element types and return exactly one value from exactly one of
//! them. When more than one channel is ready, the winner is chosen uniformly
//! at random (the arms are walked in a fresh Fisher–Yates permutation per
//! call), which is the standard fairness contract for multi-way receive.
//!
//! How a blocking select runs:
//!
//! 1. Build one arm per channel. All arms share one result slot, one
//!    `claimed` flag, and one wake handshake.
//! 2. Walk the arms in random order. An arm whose channel has a buffered
//!    value claims the flag and takes it — done, no suspension. Otherwise
//!    the arm is enqueued on that channel's consumer list and the walk
//!    continues.
//! 3. If every arm was enqueued, suspend. A sender that pops an arm claims
//!    the flag, writes the slot, and completes the handshake; arms popped
//!    after the claim *decline* so their channel delivers the value to
//!    someone else instead of dropping it.
//! 4. After resuming (or claiming synchronously), unlink every arm that is
//!    still queued — one channel lock at a time, never nested, so two
//!    overlapping selects cannot deadlock on each other's channels.
//!
//! [`try_select2`]/[`try_select3`]/[`try_select4`] are the non-blocking
//! variants: a random permutation of plain `try_recv`s.

use crate::channel::{Channel, RxWaiter, SelectorPoll};
use crate::fiber;
use crate::fiber::FiberHandle;
use crate::fiber::awaiter::Awaiter;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

/// The value returned by a two-channel select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Select2<A, B> {
    First(A),
    Second(B),
}

/// The value returned by a three-channel select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Select3<A, B, C> {
    First(A),
    Second(B),
    Third(C),
}

/// The value returned by a four-channel select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Select4<A, B, C, D> {
    First(A),
    Second(B),
    Third(C),
    Fourth(D),
}

/// State shared by every arm of one select call.
struct SelectShared {
    /// Exactly one arm (or one delivering sender) wins this flag; the
    /// winner is the only writer of the result slot.
    claimed: AtomicBool,
    /// Wake handshake between the delivering sender and the suspending
    /// fiber: whichever flips it second schedules the fiber.
    woke: AtomicBool,
    fiber: FiberHandle,
}

impl SelectShared {
    fn new(fiber: FiberHandle) -> Self {
        Self {
            claimed: AtomicBool::new(false),
            woke: AtomicBool::new(false),
            fiber,
        }
    }
}

struct SelectAwaiter<'a> {
    shared: &'a SelectShared,
}

impl Awaiter for SelectAwaiter<'_> {
    fn await_suspend(&self) {
        // If the delivery already happened, nobody else will schedule us.
        if self.shared.woke.swap(true, Ordering::AcqRel) {
            self.shared.fiber.schedule();
        }
    }
}

/// The lifetime-free part of an arm, pointed to by its waiter node and
/// handed back to [`deliver_select`] by the channel.
struct ArmFrame<T, R> {
    shared: NonNull<SelectShared>,
    slot: NonNull<UnsafeCell<Option<R>>>,
    wrap: fn(T) -> R,
    waiter: RxWaiter<T>,
}

/// One channel's arm of a select call.
struct Arm<'a, T: Send, R> {
    channel: &'a Channel<T>,
    frame: ArmFrame<T, R>,
}

// === impl Arm ===

impl<'a, T: Send, R> Arm<'a, T, R> {
    fn new(
        channel: &'a Channel<T>,
        shared: &'a SelectShared,
        slot: &'a UnsafeCell<Option<R>>,
        wrap: fn(T) -> R,
    ) -> Self {
        Self {
            channel,
            frame: ArmFrame {
                shared: NonNull::from(shared),
                slot: NonNull::from(slot),
                wrap,
                waiter: RxWaiter::new(deliver_select::<T, R>),
            },
        }
    }
}

unsafe fn deliver_select<T, R>(frame: NonNull<()>, value: &mut Option<T>) -> bool {
    // Safety: the frame (and everything it points to) lives in the
    // selecting fiber's stack and stays valid until the select returns,
    // which cannot happen before this delivery finishes (the unlink pass
    // serializes on the channel lock the caller is holding).
    let frame = unsafe { frame.cast::<ArmFrame<T, R>>().as_ref() };
    // Safety: as above.
    let shared = unsafe { frame.shared.as_ref() };

    if shared.claimed.swap(true, Ordering::AcqRel) {
        // another arm already won; decline so the value goes elsewhere
        return false;
    }

    let value = value.take().expect("delivery without a value");
    // Safety: winning `claimed` makes us the sole writer of the slot.
    unsafe { *frame.slot.as_ref().get() = Some((frame.wrap)(value)) };

    // Complete the handshake. Read the handle first: the moment `woke`
    // flips, the fiber may resume and tear the frame down.
    let fiber = shared.fiber;
    if shared.woke.swap(true, Ordering::AcqRel) {
        fiber.schedule();
    }
    true
}

/// What `select_core` needs from an arm, with the element type erased.
trait SelectOp {
    fn poll(&self) -> ArmPoll;
    fn unlink(&self);
}

enum ArmPoll {
    /// This arm claimed a buffered value; the slot is filled.
    Ready,
    /// The select completed through some other arm.
    Lost,
    /// The arm is enqueued on its channel.
    Pending,
}

impl<T: Send, R> SelectOp for Arm<'_, T, R> {
    fn poll(&self) -> ArmPoll {
        self.frame.waiter.bind(NonNull::from(&self.frame).cast());
        // Safety: `shared` lives in the select call's frame, which outlives
        // every arm.
        let shared = unsafe { self.frame.shared.as_ref() };
        match self
            .channel
            .selector_poll(NonNull::from(&self.frame.waiter), &shared.claimed)
        {
            SelectorPoll::Value(value) => {
                // Safety: we hold `claimed`; nobody else writes the slot.
                unsafe { *self.frame.slot.as_ref().get() = Some((self.frame.wrap)(value)) };
                ArmPoll::Ready
            }
            SelectorPoll::Lost => ArmPoll::Lost,
            SelectorPoll::Pending => ArmPoll::Pending,
        }
    }

    fn unlink(&self) {
        self.channel.selector_unlink(NonNull::from(&self.frame.waiter));
    }
}

/// Shared engine for the blocking selects.
fn select_core(shared: &SelectShared, ops: &mut [&dyn SelectOp]) {
    // Fresh permutation per call: every ready channel is equally likely to
    // be picked. Uses the thread-local generator.
    fastrand::shuffle(ops);

    let mut claimed_here = false;
    for op in ops.iter() {
        match op.poll() {
            ArmPoll::Ready => {
                claimed_here = true;
                break;
            }
            // a sender beat us to it; the value is on its way
            ArmPoll::Lost => break,
            ArmPoll::Pending => {}
        }
    }

    if !claimed_here {
        // Suspend; the delivering sender and our awaiter handshake over
        // `woke`, so the wake cannot be lost even if the delivery happened
        // while we were still enqueueing.
        let awaiter = SelectAwaiter { shared };
        fiber::suspend(&awaiter);
    }

    // Retire every arm that is still queued before the frames go away.
    // One channel lock at a time; never nested.
    for op in ops.iter() {
        op.unlink();
    }
}

macro_rules! take_slot {
    ($slot:expr) => {{
        // Safety: the select is over; all arms are unlinked and the winner
        // has written the slot.
        unsafe { (*$slot.get()).take() }.expect("select finished without a value")
    }};
}

/// Receives from whichever of two channels is ready first.
///
/// # Panics
///
/// Panics if called outside a fiber.
pub fn select2<A, B>(a: &Channel<A>, b: &Channel<B>) -> Select2<A, B>
where
    A: Send,
    B: Send,
{
    let fiber = fiber::current().expect("select called outside a fiber");
    let shared = SelectShared::new(fiber);
    let slot = UnsafeCell::new(None);

    let arm_a = Arm::new(a, &shared, &slot, Select2::First);
    let arm_b = Arm::new(b, &shared, &slot, Select2::Second);
    let mut ops: [&dyn SelectOp; 2] = [&arm_a, &arm_b];
    select_core(&shared, &mut ops);

    take_slot!(slot)
}

/// Receives from whichever of three channels is ready first.
///
/// # Panics
///
/// Panics if called outside a fiber.
pub fn select3<A, B, C>(a: &Channel<A>, b: &Channel<B>, c: &Channel<C>) -> Select3<A, B, C>
where
    A: Send,
    B: Send,
    C: Send,
{
    let fiber = fiber::current().expect("select called outside a fiber");
    let shared = SelectShared::new(fiber);
    let slot = UnsafeCell::new(None);

    let arm_a = Arm::new(a, &shared, &slot, Select3::First);
    let arm_b = Arm::new(b, &shared, &slot, Select3::Second);
    let arm_c = Arm::new(c, &shared, &slot, Select3::Third);
    let mut ops: [&dyn SelectOp; 3] = [&arm_a, &arm_b, &arm_c];
    select_core(&shared, &mut ops);

    take_slot!(slot)
}

/// Receives from whichever of four channels is ready first.
///
/// # Panics
///
/// Panics if called outside a fiber.
pub fn select4<A, B, C, D>(
    a: &Channel<A>,
    b: &Channel<B>,
    c: &Channel<C>,
    d: &Channel<D>,
) -> Select4<A, B, C, D>
where
    A: Send,
    B: Send,
    C: Send,
    D: Send,
{
    let fiber = fiber::current().expect("select called outside a fiber");
    let shared = SelectShared::new(fiber);
    let slot = UnsafeCell::new(None);

    let arm_a = Arm::new(a, &shared, &slot, Select4::First);
    let arm_b = Arm::new(b, &shared, &slot, Select4::Second);
    let arm_c = Arm::new(c, &shared, &slot, Select4::Third);
    let arm_d = Arm::new(d, &shared, &slot, Select4::Fourth);
    let mut ops: [&dyn SelectOp; 4] = [&arm_a, &arm_b, &arm_c, &arm_d];
    select_core(&shared, &mut ops);

    take_slot!(slot)
}

/// Non-blocking [`select2`]: `None` when neither channel has a value.
pub fn try_select2<A, B>(a: &Channel<A>, b: &Channel<B>) -> Option<Select2<A, B>>
where
    A: Send,
    B: Send,
{
    let mut ops: [&dyn Fn() -> Option<Select2<A, B>>; 2] = [
        &|| a.try_recv().map(Select2::First),
        &|| b.try_recv().map(Select2::Second),
    ];
    fastrand::shuffle(&mut ops);
    ops.iter().find_map(|op| op())
}

/// Non-blocking [`select3`].
pub fn try_select3<A, B, C>(
    a: &Channel<A>,
    b: &Channel<B>,
    c: &Channel<C>,
) -> Option<Select3<A, B, C>>
where
    A: Send,
    B: Send,
    C: Send,
{
    let mut ops: [&dyn Fn() -> Option<Select3<A, B, C>>; 3] = [
        &|| a.try_recv().map(Select3::First),
        &|| b.try_recv().map(Select3::Second),
        &|| c.try_recv().map(Select3::Third),
    ];
    fastrand::shuffle(&mut ops);
    ops.iter().find_map(|op| op())
}

/// Non-blocking [`select4`].
pub fn try_select4<A, B, C, D>(
    a: &Channel<A>,
    b: &Channel<B>,
    c: &Channel<C>,
    d: &Channel<D>,
) -> Option<Select4<A, B, C, D>>
where
    A: Send,
    B: Send,
    C: Send,
    D: Send,
{
    let mut ops: [&dyn Fn() -> Option<Select4<A, B, C, D>>; 4] = [
        &|| a.try_recv().map(Select4::First),
        &|| b.try_recv().map(Select4::Second),
        &|| c.try_recv().map(Select4::Third),
        &|| d.try_recv().map(Select4::Fourth),
    ];
    fastrand::shuffle(&mut ops);
    ops.iter().find_map(|op| op())
}
