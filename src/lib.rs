//! Executor-bound futures and promises.
//!
//! A [`Future`] is a recipe for an asynchronous computation. Nothing happens
//! until the future is applied to an [`Executor`], at which point the recipe
//! runs and produces a [`Promise`]: a single-assignment cell that the
//! computation completes exactly once with an [`Outcome`].
//!
//! Futures compose without blocking. Combinators such as `map` or `flat_map`
//! register continuations on the parent promise; `flat_map`-style
//! continuations are resubmitted to the executor so that deep chains neither
//! grow the stack nor starve a small pool.
//!
//! ```
//! use futurebox::{Executor, Future, ThreadPool};
//! use std::sync::Arc;
//!
//! let executor: Arc<dyn Executor> = Arc::new(ThreadPool::fixed_size(2));
//!
//! let future = Future::task(|| Ok(18))
//!     .map(|v| v * 2)
//!     .flat_map(|v| Future::success(v + 25));
//!
//! assert_eq!(61, future.apply(&executor).get().unwrap());
//! ```
//!
//! The executor is always passed explicitly; the crate keeps no global
//! default.

#[macro_use]
extern crate log;

pub use crate::cancel::{interrupted, sleep};
pub use crate::delay_queue::{Delay, DelayQueue, Delayed};
pub use crate::error::{BoxError, Error, Outcome};
pub use crate::future::Future;
pub use crate::promise::Promise;
pub use crate::thread_pool::{Builder, ThreadPool};

use std::time::Duration;

mod bracket;
mod cancel;
mod delay_queue;
mod error;
mod future;
mod promise;
mod race;
mod thread_pool;

/// A unit of work submitted to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Schedules jobs for out-of-band execution.
pub trait Executor: Send + Sync + 'static {
    /// Runs the job as soon as possible.
    fn submit(&self, job: Job) -> Result<(), Error>;

    /// Runs the job once `delay` has elapsed.
    ///
    /// Implementations must not block a worker thread for the duration of
    /// the delay.
    fn submit_after(&self, delay: Duration, job: Job) -> Result<(), Error>;
}
