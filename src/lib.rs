#![deny(unsafe_code)]

//! # poolq - ordered multi-queue worker pool
//!
//! A fixed set of worker threads serves any number of independent job
//! queues, and each queue hands its results back in dispatch order, no
//! matter which worker finished first. This is the shape needed by
//! streaming pipelines: many heterogeneous parallel stages sharing one
//! thread budget, with every logical stream consuming its outputs in
//! sequence.
//!
//! ## Overview
//!
//! - **[`Pool`]** owns the worker threads and the scheduler state. It knows
//!   nothing about job payloads; it only runs closures and routes their
//!   results.
//! - **[`Queue`]** is one logical stream of jobs. Dispatch closures into
//!   it, retrieve [`JobResult`]s out of it in submission order. A queue
//!   built with [`Queue::new_discarding`] drops results on completion,
//!   for jobs run purely for their side effects.
//!
//! Backpressure is per queue: a queue admits at most `qsize` jobs across
//! its input, processing, and (for result-keeping queues) output stages.
//! At the bound, [`Queue::dispatch`] blocks and [`Queue::try_dispatch`]
//! returns the closure to the caller.
//!
//! ## Example
//!
//! ```
//! use poolq::{Pool, Queue};
//!
//! let pool = Pool::new(4)?;
//! let queue: Queue<u64> = Queue::new(&pool, 16);
//!
//! std::thread::scope(|s| {
//!     s.spawn(|| {
//!         for i in 0..100u64 {
//!             queue.dispatch(move || i + 1).expect("queue accepts jobs");
//!         }
//!     });
//!     for i in 0..100u64 {
//!         let r = queue.next_result_wait().expect("one result per job");
//!         assert_eq!(r.serial(), i);
//!         assert_eq!(*r.payload(), i + 1);
//!     }
//! });
//! # Ok::<(), std::io::Error>(())
//! ```

mod error;
mod pool;
mod queue;

pub use error::{DispatchError, FlushError, TryDispatchError};
pub use pool::{Pool, PoolStats};
pub use queue::{JobResult, Queue};
