//! Cooperative cancellation of scheduled work.
//!
//! Every `task` / `delay` / `exec` future that is scheduled onto an executor
//! is backed by an `Execution` handle. The handle moves through
//! `Scheduled -> Running -> Done`, or `Scheduled -> Cancelled` when the
//! future is cancelled before the job starts, in which case the job body is
//! skipped once the executor gets to it.
//!
//! Rust has no way to interrupt a thread, so interruption is cooperative: a
//! running job can poll [`interrupted`] or sleep with [`sleep`], which returns
//! early with `Error::Interrupted` when the job is cancelled with
//! `may_interrupt` set.

use crate::error::Error;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

const SCHEDULED: usize = 0;
const RUNNING: usize = 1;
const DONE: usize = 2;
const CANCELLED: usize = 3;

thread_local! {
    // Interrupt flag of the job currently running on this thread
    static CURRENT: RefCell<Option<Arc<AtomicBool>>> = RefCell::new(None);
}

pub(crate) struct Execution {
    state: AtomicUsize,

    // Set while the job body runs, so that it can be unparked
    runner: Mutex<Option<Thread>>,

    interrupt: Arc<AtomicBool>,
}

impl Execution {
    pub fn new() -> Arc<Execution> {
        Arc::new(Execution {
            state: AtomicUsize::new(SCHEDULED),
            runner: Mutex::new(None),
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Runs `f` unless the execution was cancelled first.
    ///
    /// Returns `false` if `f` was skipped.
    pub fn run<F: FnOnce()>(&self, f: F) -> bool {
        if self.state.compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire).is_err() {
            debug!("execution cancelled before start -- skipping job");
            return false;
        }

        *self.runner.lock() = Some(thread::current());

        {
            let _current = CurrentGuard::enter(self.interrupt.clone());
            f();
        }

        *self.runner.lock() = None;
        self.state.store(DONE, Ordering::Release);

        true
    }

    /// Requests cancellation.
    ///
    /// A job that has not started yet will never run. A running job is only
    /// signalled when `may_interrupt` is set.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        match self.state.compare_exchange(SCHEDULED, CANCELLED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                debug!("execution cancelled; state=Scheduled");
                true
            }
            Err(RUNNING) if may_interrupt => {
                debug!("execution interrupted; state=Running");
                self.interrupt.store(true, Ordering::Release);

                if let Some(ref runner) = *self.runner.lock() {
                    runner.unpark();
                }

                true
            }
            Err(_) => false,
        }
    }
}

struct CurrentGuard {
    prev: Option<Arc<AtomicBool>>,
}

impl CurrentGuard {
    fn enter(flag: Arc<AtomicBool>) -> CurrentGuard {
        let prev = CURRENT.with(|current| current.replace(Some(flag)));
        CurrentGuard { prev }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

/// Returns `true` if the job running on the current thread has been
/// interrupted.
///
/// Always `false` outside of a `task`, `delay` or `exec` job.
pub fn interrupted() -> bool {
    CURRENT.with(|current| {
        current.borrow()
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Acquire))
    })
}

/// Sleeps the current thread, waking up early if the running job is
/// interrupted.
pub fn sleep(duration: Duration) -> Result<(), Error> {
    // `None` when the deadline is too far out to represent
    let deadline = Instant::now().checked_add(duration);

    loop {
        if interrupted() {
            return Err(Error::Interrupted);
        }

        let deadline = match deadline {
            Some(deadline) => deadline,
            None => {
                thread::park();
                continue;
            }
        };

        let now = Instant::now();

        if now >= deadline {
            return Ok(());
        }

        thread::park_timeout(deadline - now);
    }
}
