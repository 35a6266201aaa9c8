// Copyright 2026 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A user-space concurrency runtime: a work-stealing task executor, stackful
//! fibers cooperating through a first-class suspension protocol, and the
//! synchronization primitives that compose with them.
//!
//! The pieces fit together like this: the [`executor`] decides *where* work
//! runs (worker threads with per-worker LIFO slots, bounded local rings, a
//! shared global queue, and stealing), the [`fiber`] layer decides *what*
//! work is (a suspendable stackful computation scheduled as a task), and
//! [`channel`]s, [`select`], and the [`sync`] primitives are the canonical
//! reasons a fiber suspends.
//!
//! ```
//! use weft::channel::Channel;
//! use weft::executor::ThreadPool;
//! use weft::fiber;
//!
//! let pool = ThreadPool::new(4);
//! let chan = Channel::new(16);
//!
//! let tx = chan.clone();
//! fiber::go(pool.clone(), move || {
//!     for i in 0..100 {
//!         tx.send(i);
//!     }
//! });
//!
//! let rx = chan.clone();
//! fiber::go(pool.clone(), move || {
//!     for i in 0..100 {
//!         assert_eq!(rx.recv(), i);
//!     }
//! });
//!
//! pool.wait_idle();
//! pool.stop();
//! ```

pub mod channel;
pub mod executor;
pub mod fiber;
mod park;
pub mod select;
pub mod spin;
pub mod strand;
pub mod sync;
pub mod task;

pub use channel::Channel;
pub use executor::{Hint, ManualExecutor, Schedule, ScheduleExt, ThreadPool};
pub use fiber::go;
pub use select::{Select2, Select3, Select4};
pub use strand::Strand;
pub use task::TaskRef;
