// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A manually driven executor.
//!
//! Nothing runs until the caller turns the crank, which makes interleavings
//! deterministic — the strand and fiber tests are built on this.

use crate::executor::Schedule;
use crate::task::{TaskQueue, TaskRef, run_task};
use std::sync::Mutex;

/// A single-threaded executor driven by explicit `run_*` calls.
#[derive(Debug, Default)]
pub struct ManualExecutor {
    queue: Mutex<TaskQueue>,
}

// === impl ManualExecutor ===

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs up to `limit` queued tasks; returns how many ran.
    ///
    /// Tasks submitted *by* those tasks are eligible within the same call.
    pub fn run_at_most(&self, limit: usize) -> usize {
        let mut ran = 0;
        while ran < limit {
            let Some(task) = self.queue.lock().unwrap().try_pop() else {
                break;
            };
            // run outside the lock: the task may re-submit to this executor
            run_task(task);
            ran += 1;
        }
        ran
    }

    /// Runs one task if any is queued.
    pub fn run_next(&self) -> bool {
        self.run_at_most(1) == 1
    }

    /// Runs until the queue stays empty; returns how many tasks ran.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    pub fn task_count(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn has_tasks(&self) -> bool {
        self.task_count() > 0
    }
}

impl Schedule for ManualExecutor {
    fn execute(&self, task: TaskRef) {
        self.queue.lock().unwrap().push(task);
    }
}

// Dropping the executor discards queued heap tasks via `TaskQueue`'s drop.
