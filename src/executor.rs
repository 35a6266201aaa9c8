// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work-stealing executor.
//!
//! A [`ThreadPool`] owns a fixed set of worker threads. Work flows through
//! four places, tried in an order that trades locality against fairness:
//!
//! 1. a per-worker *LIFO slot* — a single-task cell giving producer/consumer
//!    pairs cache-warm hand-off,
//! 2. a per-worker bounded SPMC ring (the local queue),
//! 3. a mutex-protected global FIFO,
//! 4. stealing batches from a random victim's ring.
//!
//! Two dials keep the LIFO fast path honest: every 61st take (per worker,
//! randomized) starts at the global queue so globally submitted work makes
//! progress under local churn, and after 20 consecutive LIFO dispatches the
//! slot goes to the back of the order so a ping-ponging pair cannot starve
//! the rest of the worker's queue.

use crate::park::{ParkingLot, WaitGroup};
use crate::task::{TaskQueue, TaskRef, discard_task, run_task};
use arrayvec::ArrayVec;
use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

mod manual;
pub(crate) mod ring;

pub use manual::ManualExecutor;
use ring::{LOCAL_QUEUE_CAPACITY, Ring};

/// How many tasks a worker spills from its ring into the global queue when
/// the ring overflows, and the cap on the batch grabbed back out of the
/// global queue.
const SPILL_BATCH: usize = LOCAL_QUEUE_CAPACITY / 2;

/// How many tasks a steal attempt takes from the victim's ring at most.
const STEAL_BATCH: usize = LOCAL_QUEUE_CAPACITY / 4;

/// One take in this many starts at the global queue regardless of local
/// work.
const GLOBAL_QUEUE_DICE: usize = 61;

/// After this many consecutive LIFO-slot dispatches the slot is demoted to
/// the back of the take order.
const MAX_LIFO_STREAK: usize = 20;

std::thread_local! {
    /// Which pool and worker index the current thread belongs to, if any.
    static CURRENT_WORKER: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// Where an enqueue should place a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    /// The current worker's LIFO slot. Only valid on a worker thread.
    Lifo,
    /// The current worker's local ring. Only valid on a worker thread.
    Local,
    /// The shared global FIFO.
    Global,
}

/// The executor interface: anything tasks can be submitted to.
///
/// Implemented by [`ThreadPool`], [`Strand`](crate::strand::Strand), and
/// [`ManualExecutor`].
pub trait Schedule: Send + Sync {
    /// Submits a task for execution.
    fn execute(&self, task: TaskRef);

    /// Submits a task that just yielded.
    ///
    /// A yielding task must not come straight back through a fast path (the
    /// LIFO slot in particular), or `yield` stops meaning anything; the
    /// thread pool sends these to the global queue.
    fn yield_execute(&self, task: TaskRef) {
        self.execute(task);
    }
}

/// Closure-submission sugar over any [`Schedule`].
pub trait ScheduleExt: Schedule {
    /// Heap-allocates `f` as a task and submits it.
    fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(TaskRef::new_boxed(f));
    }
}

impl<S: Schedule + ?Sized> ScheduleExt for S {}

/// A single-task cell owned by one worker.
#[derive(Debug, Default)]
struct LifoSlot(UnsafeCell<Option<TaskRef>>);

// Safety: the slot is only touched by the owning worker thread, except for
// the shutdown drain which runs strictly after the workers have been joined.
unsafe impl Sync for LifoSlot {}

impl LifoSlot {
    /// # Safety
    ///
    /// Only the owning worker may call this while the pool is running.
    unsafe fn swap(&self, task: Option<TaskRef>) -> Option<TaskRef> {
        // Safety: per the function contract there are no concurrent
        // accesses.
        unsafe { core::mem::replace(&mut *self.0.get(), task) }
    }
}

#[derive(Debug)]
#[repr(align(64))]
struct WorkerState {
    closed: AtomicBool,
    lifo: LifoSlot,
    ring: Ring,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            lifo: LifoSlot::default(),
            ring: Ring::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TakeStep {
    Lifo,
    Local,
    Global,
    Steal,
}

/// The order a worker walks its task sources in.
#[derive(Debug, Clone, Copy)]
struct TakeStrategy {
    steps: [TakeStep; 4],
}

impl TakeStrategy {
    const DEFAULT: Self = Self {
        steps: [
            TakeStep::Lifo,
            TakeStep::Local,
            TakeStep::Global,
            TakeStep::Steal,
        ],
    };

    /// Guarantees forward progress for globally submitted tasks even under
    /// heavy local churn.
    const GLOBAL_FIRST: Self = Self {
        steps: [
            TakeStep::Global,
            TakeStep::Lifo,
            TakeStep::Local,
            TakeStep::Steal,
        ],
    };

    /// Bounds LIFO-induced starvation of the local ring.
    const WITHOUT_LIFO: Self = Self {
        steps: [
            TakeStep::Local,
            TakeStep::Global,
            TakeStep::Steal,
            TakeStep::Lifo,
        ],
    };
}

/// The work-stealing thread-pool executor.
#[derive(Debug)]
pub struct ThreadPool {
    id: u64,
    workers: Box<[WorkerState]>,
    global: Mutex<TaskQueue>,
    /// Tasks-in-queue counter and worker parking.
    parking: ParkingLot,
    /// Outstanding-task count behind [`wait_idle`](Self::wait_idle).
    idle: WaitGroup,
    /// Concurrent stealer count, capped at the worker count.
    robbers: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

// === impl ThreadPool ===

impl ThreadPool {
    /// Spawns a pool with `workers` worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `workers < 2`.
    pub fn new(workers: usize) -> Arc<Self> {
        assert!(workers > 1, "a thread pool needs at least two workers");

        static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

        let pool = Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            workers: (0..workers).map(|_| WorkerState::new()).collect(),
            global: Mutex::new(TaskQueue::new()),
            parking: ParkingLot::new(),
            idle: WaitGroup::new(),
            robbers: AtomicUsize::new(0),
            handles: Mutex::new(Vec::with_capacity(workers)),
            stopped: AtomicBool::new(false),
        });

        let mut handles = pool.handles.lock().unwrap();
        for index in 0..workers {
            let pool = Arc::clone(&pool);
            let handle = std::thread::Builder::new()
                .name(format!("weft-worker-{index}"))
                .spawn(move || pool.worker_main(index))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        drop(handles);

        pool
    }

    /// Submits a task to an explicitly chosen queue.
    ///
    /// # Panics
    ///
    /// Panics if `hint` is [`Hint::Lifo`] or [`Hint::Local`] and the calling
    /// thread is not a worker of this pool.
    pub fn execute_with_hint(&self, task: TaskRef, hint: Hint) {
        self.idle.add(1);

        match hint {
            Hint::Lifo => {
                let index = self
                    .current_worker()
                    .expect("Hint::Lifo used off a worker thread");
                self.push_lifo(task, index);
            }
            Hint::Local => {
                let index = self
                    .current_worker()
                    .expect("Hint::Local used off a worker thread");
                self.push_local(task, index);
            }
            Hint::Global => self.push_global(task),
        }

        self.parking.task_enqueued();
    }

    /// Blocks the calling thread until every task submitted so far has
    /// completed.
    ///
    /// Fibers parked on channels or locks hold no queued task and do not
    /// count; `wait_idle` can return while such fibers are still suspended.
    pub fn wait_idle(&self) {
        self.idle.wait();
    }

    /// Stops the pool: wakes every parked worker, signals them to exit, and
    /// joins them. Queued tasks that never ran are discarded when the pool
    /// is dropped.
    ///
    /// Must be called from outside the pool's own workers.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.parking.poison();
        for worker in self.workers.iter() {
            worker.closed.store(true, Ordering::Release);
        }

        let handles = core::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }

        self.idle.all_done();
    }

    /// The calling thread's worker index, if it is a worker of *this* pool.
    fn current_worker(&self) -> Option<usize> {
        CURRENT_WORKER
            .get()
            .and_then(|(pool, index)| (pool == self.id).then_some(index))
    }

    fn push_global(&self, task: TaskRef) {
        self.global.lock().unwrap().push(task);
    }

    fn push_local(&self, task: TaskRef, index: usize) {
        let mut task = task;
        loop {
            match self.workers[index].ring.try_push(task) {
                Ok(()) => return,
                Err(back) => {
                    task = back;
                    self.spill_to_global(index);
                }
            }
        }
    }

    fn push_lifo(&self, task: TaskRef, index: usize) {
        // Safety: `index` is the calling worker's own slot (checked by the
        // caller).
        let displaced = unsafe { self.workers[index].lifo.swap(Some(task)) };
        if let Some(displaced) = displaced {
            self.push_local(displaced, index);
        }
    }

    /// Moves half of worker `index`'s ring into the global queue.
    fn spill_to_global(&self, index: usize) {
        let mut batch = ArrayVec::<TaskRef, SPILL_BATCH>::new();
        let spilled = self.workers[index].ring.grab(&mut batch);
        if spilled == 0 {
            return;
        }

        let mut queue = TaskQueue::new();
        for task in batch.drain(..) {
            queue.push(task);
        }
        self.global.lock().unwrap().append(&mut queue);
        tracing::trace!(worker = index, spilled, "local ring overflowed into global queue");
    }

    fn worker_main(&self, index: usize) {
        CURRENT_WORKER.set(Some((self.id, index)));
        let _span = tracing::debug_span!("worker main loop", worker = index).entered();

        let mut rng = fastrand::Rng::new();
        let mut lifo_streak = 0_usize;
        let me = &self.workers[index];

        while !me.closed.load(Ordering::Acquire) {
            let strategy = if rng.usize(..GLOBAL_QUEUE_DICE) == 0 {
                TakeStrategy::GLOBAL_FIRST
            } else if lifo_streak >= MAX_LIFO_STREAK {
                TakeStrategy::WITHOUT_LIFO
            } else {
                TakeStrategy::DEFAULT
            };

            match self.try_take(index, strategy, &mut rng) {
                Some((task, from_lifo)) => {
                    self.parking.task_taken();
                    if from_lifo {
                        lifo_streak += 1;
                    } else {
                        lifo_streak = 0;
                    }

                    run_task(task);
                    self.idle.done();
                }
                None => self.parking.park_while_empty(),
            }
        }

        tracing::debug!(worker = index, "stop signal received, shutting down");
    }

    /// Walks the strategy's steps; the first task found wins. Also reports
    /// whether it came out of the LIFO slot.
    fn try_take(
        &self,
        index: usize,
        strategy: TakeStrategy,
        rng: &mut fastrand::Rng,
    ) -> Option<(TaskRef, bool)> {
        let mut saw_local = false;
        for step in strategy.steps {
            let task = match step {
                // Safety: this is our own slot.
                TakeStep::Lifo => unsafe { self.workers[index].lifo.swap(None) },
                TakeStep::Local => {
                    saw_local = true;
                    self.workers[index].ring.try_pop()
                }
                // If we already served the local ring this round it is
                // empty, so it is worth grabbing a global batch for it.
                TakeStep::Global => self.take_global(index, saw_local),
                TakeStep::Steal => self.try_steal(index, rng),
            };

            if let Some(task) = task {
                return Some((task, step == TakeStep::Lifo));
            }
        }
        None
    }

    fn take_global(&self, index: usize, grab_extra: bool) -> Option<TaskRef> {
        let mut batch = TaskQueue::new();
        let result = {
            let mut global = self.global.lock().unwrap();
            let result = global.try_pop()?;
            if grab_extra {
                let extra = SPILL_BATCH.min(global.len() / self.workers.len());
                if extra > 0 {
                    batch = global.split_off(extra);
                }
            }
            result
        };

        while let Some(task) = batch.try_pop() {
            self.push_local(task, index);
        }
        Some(result)
    }

    fn try_steal(&self, index: usize, rng: &mut fastrand::Rng) -> Option<TaskRef> {
        // Cap the number of concurrent stealers at the worker count.
        let mut robbers = self.robbers.load(Ordering::Relaxed);
        loop {
            if robbers >= self.workers.len() {
                return None;
            }
            match self.robbers.compare_exchange_weak(
                robbers,
                robbers + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => robbers = actual,
            }
        }

        let stolen = self.steal_once(index, rng);
        self.robbers.fetch_sub(1, Ordering::AcqRel);
        stolen
    }

    fn steal_once(&self, index: usize, rng: &mut fastrand::Rng) -> Option<TaskRef> {
        let mut victim = rng.usize(..self.workers.len());
        while victim == index {
            victim = rng.usize(..self.workers.len());
        }

        let mut batch = ArrayVec::<TaskRef, STEAL_BATCH>::new();
        let stolen = self.workers[victim].ring.grab(&mut batch);
        if stolen == 0 {
            return None;
        }
        tracing::trace!(worker = index, victim, stolen, "stole tasks");

        let mut tasks = batch.drain(..);
        let first = tasks.next();
        for task in tasks {
            self.push_local(task, index);
        }
        first
    }
}

impl Schedule for ThreadPool {
    fn execute(&self, task: TaskRef) {
        let hint = if self.current_worker().is_some() {
            Hint::Local
        } else {
            Hint::Global
        };
        self.execute_with_hint(task, hint);
    }

    fn yield_execute(&self, task: TaskRef) {
        self.execute_with_hint(task, Hint::Global);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        assert!(
            self.stopped.load(Ordering::Acquire),
            "thread pool dropped while running; call stop() first"
        );

        // Discard everything still queued: the global queue drains itself on
        // drop, the LIFO slots and rings are drained here. Workers have been
        // joined, so this thread is the sole accessor.
        for worker in self.workers.iter() {
            // Safety: workers are joined.
            if let Some(task) = unsafe { worker.lifo.swap(None) } {
                discard_task(task);
            }
            while let Some(task) = worker.ring.try_pop() {
                discard_task(task);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn init_tracing() -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .finish(),
        )
    }

    #[test]
    #[should_panic(expected = "at least two workers")]
    fn single_worker_pool_is_refused() {
        let _ = ThreadPool::new(1);
    }

    #[test]
    fn wait_idle_sees_all_tasks_complete() {
        let _trace = init_tracing();
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..1_000 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.wait_idle();
        assert_eq!(counter.load(Ordering::Relaxed), 1_000);
        pool.stop();
    }

    #[test]
    fn tasks_submitted_from_many_threads() {
        let _trace = init_tracing();
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let submitters: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let counter = counter.clone();
                        pool.submit(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }

        pool.wait_idle();
        assert_eq!(counter.load(Ordering::Relaxed), 8 * 500);
        pool.stop();
    }

    #[test]
    fn tasks_spawned_from_tasks_use_the_local_paths() {
        let _trace = init_tracing();
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        // a small fan-out tree: each task spawns children until the budget
        // is used up, exercising the LIFO slot, the ring, and stealing
        fn fan_out(pool: &Arc<ThreadPool>, counter: &Arc<AtomicUsize>, depth: usize) {
            counter.fetch_add(1, Ordering::Relaxed);
            if depth == 0 {
                return;
            }
            for _ in 0..2 {
                let pool2 = pool.clone();
                let counter = counter.clone();
                pool.submit(move || fan_out(&pool2, &counter, depth - 1));
            }
        }

        fan_out(&pool, &counter, 9);
        pool.wait_idle();
        // a complete binary tree of depth 9 has 2^10 - 1 nodes
        assert_eq!(counter.load(Ordering::Relaxed), (1 << 10) - 1);
        pool.stop();
    }

    #[test]
    fn explicit_hints_from_a_worker() {
        let _trace = init_tracing();
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let pool2 = pool.clone();
        let counter2 = counter.clone();
        pool.submit(move || {
            for hint in [Hint::Lifo, Hint::Local, Hint::Global] {
                let counter = counter2.clone();
                pool2.execute_with_hint(
                    TaskRef::new_boxed(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }),
                    hint,
                );
            }
        });

        pool.wait_idle();
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        pool.stop();
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let _trace = init_tracing();
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("task failure"));
        // both workers must still be alive to run these
        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.wait_idle();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        pool.stop();
    }

    #[test]
    fn stop_joins_all_workers() {
        let _trace = init_tracing();
        let pool = ThreadPool::new(4);

        for _ in 0..100 {
            pool.submit(|| std::thread::sleep(Duration::from_micros(50)));
        }

        pool.wait_idle();
        pool.stop();
        assert!(pool.handles.lock().unwrap().is_empty());
        // stop is idempotent
        pool.stop();
    }
}
