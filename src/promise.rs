//! Single-assignment completion cell.
//!
//! A `Promise` starts out pending and is completed exactly once, either with a
//! value or with an `Error`. Any number of listeners may be registered; each
//! one observes the final outcome exactly once, whether it was registered
//! before or after completion.
//!
//! The implementation is a mutex guarding a two-state machine plus a condvar
//! for the blocking accessors. Listeners are invoked outside of the lock, on
//! the thread performing the completing write (or on the registering thread
//! when the promise is already complete).

use crate::error::{self, Error, Outcome};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    condvar: Condvar,
}

enum State<T> {
    Pending(Vec<Callback<T>>),
    Completed(Outcome<T>),
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Returns a new, pending promise.
    pub fn new() -> Promise<T> {
        Promise {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Returns a promise that is already completed with `outcome`.
    pub fn completed(outcome: Outcome<T>) -> Promise<T> {
        Promise {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Completed(outcome)),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Completes the promise if it is still pending.
    ///
    /// Returns `true` if this call performed the completion. A call that
    /// loses the race is discarded.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();

            let callbacks = match *state {
                State::Pending(ref mut callbacks) => std::mem::take(callbacks),
                State::Completed(..) => {
                    trace!("Promise::complete; already completed -- discarding");
                    return false;
                }
            };

            *state = State::Completed(outcome.clone());
            self.inner.condvar.notify_all();

            callbacks
        };

        debug!("Promise::complete; ok={}; listeners={}", outcome.is_ok(), callbacks.len());

        for cb in callbacks {
            invoke(cb, outcome.clone());
        }

        true
    }

    /// Completes the promise with a value.
    pub fn succeed(&self, val: T) -> bool {
        self.complete(Ok(val))
    }

    /// Completes the promise with a failure.
    pub fn fail(&self, err: Error) -> bool {
        self.complete(Err(err))
    }

    pub fn is_completed(&self) -> bool {
        match *self.inner.state.lock() {
            State::Completed(..) => true,
            State::Pending(..) => false,
        }
    }

    /// Returns the outcome if the promise has completed, `None` otherwise.
    pub fn try_get(&self) -> Option<Outcome<T>> {
        match *self.inner.state.lock() {
            State::Completed(ref outcome) => Some(outcome.clone()),
            State::Pending(..) => None,
        }
    }

    /// Returns the value, `Error::Pending` if the promise has not completed or
    /// the stored failure if it failed.
    pub fn value(&self) -> Result<T, Error> {
        self.try_get().unwrap_or(Err(Error::Pending))
    }

    /// Blocks the current thread until the promise completes.
    ///
    /// Must not be called from a job running on the executor the promise
    /// depends on.
    pub fn get(&self) -> Outcome<T> {
        let mut state = self.inner.state.lock();

        loop {
            if let State::Completed(ref outcome) = *state {
                return outcome.clone();
            }

            self.inner.condvar.wait(&mut state);
        }
    }

    /// Blocks the current thread for up to `timeout`.
    ///
    /// If the promise is still pending when the timeout elapses, returns
    /// `Error::Timeout`. The promise itself is left untouched and will still
    /// be completed by the underlying computation.
    pub fn get_timeout(&self, timeout: Duration) -> Outcome<T> {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            // Past any representable instant
            None => return self.get(),
        };

        let mut state = self.inner.state.lock();

        loop {
            if let State::Completed(ref outcome) = *state {
                return outcome.clone();
            }

            if self.inner.condvar.wait_until(&mut state, deadline).timed_out() {
                if let State::Completed(ref outcome) = *state {
                    return outcome.clone();
                }

                debug!("Promise::get_timeout; timed out after {:?}", timeout);
                return Err(Error::Timeout(timeout));
            }
        }
    }

    /// Registers a listener invoked exactly once with the final outcome.
    pub fn on_complete<F>(&self, f: F) -> &Promise<T>
        where F: FnOnce(Outcome<T>) + Send + 'static
    {
        let outcome = {
            let mut state = self.inner.state.lock();

            match *state {
                State::Pending(ref mut callbacks) => {
                    callbacks.push(Box::new(f));
                    return self;
                }
                State::Completed(ref outcome) => outcome.clone(),
            }
        };

        invoke(Box::new(f), outcome);
        self
    }

    /// Registers a listener invoked only if the promise succeeds.
    pub fn on_success<F>(&self, f: F) -> &Promise<T>
        where F: FnOnce(T) + Send + 'static
    {
        self.on_complete(move |outcome| {
            if let Ok(val) = outcome {
                f(val);
            }
        })
    }

    /// Registers a listener invoked only if the promise fails.
    pub fn on_failure<F>(&self, f: F) -> &Promise<T>
        where F: FnOnce(Error) + Send + 'static
    {
        self.on_complete(move |outcome| {
            if let Err(err) = outcome {
                f(err);
            }
        })
    }

    /// Completes `self` with the outcome of `other` once it is available.
    pub(crate) fn complete_with(&self, other: &Promise<T>) {
        let this = self.clone();

        other.on_complete(move |outcome| {
            this.complete(outcome);
        });
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Promise<T> {
        Promise::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Promise<T> {
        Promise { inner: self.inner.clone() }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let completed = matches!(*self.inner.state.lock(), State::Completed(..));
        write!(fmt, "Promise {{ completed: {} }}", completed)
    }
}

fn invoke<T>(cb: Callback<T>, outcome: Outcome<T>) {
    if let Err(err) = error::catch(move || cb(outcome)) {
        warn!("promise listener panicked; err={:?}", err);
    }
}

/// Write side of a promise owned by a scheduled job.
///
/// If the job is dropped without running (the executor rejected it, or shut
/// down before getting to it), the promise is completed with
/// `Error::Rejected` so that waiters are never stranded.
pub(crate) struct Completer<T: Clone + Send + 'static> {
    promise: Option<Promise<T>>,
}

impl<T: Clone + Send + 'static> Completer<T> {
    pub fn new(promise: Promise<T>) -> Completer<T> {
        Completer { promise: Some(promise) }
    }

    pub fn is_completed(&self) -> bool {
        self.promise.as_ref().map_or(true, Promise::is_completed)
    }

    pub fn complete(mut self, outcome: Outcome<T>) -> bool {
        match self.promise.take() {
            Some(promise) => promise.complete(outcome),
            None => false,
        }
    }

    /// Completes with the outcome of `other` once it is available.
    pub fn complete_with(mut self, other: &Promise<T>) {
        if let Some(promise) = self.promise.take() {
            promise.complete_with(other);
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(promise) = self.promise.take() {
            if promise.complete(Err(Error::Rejected)) {
                debug!("completer dropped before completion -- job never ran");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dropped_completer_rejects() {
        let promise = Promise::<u32>::new();
        drop(Completer::new(promise.clone()));

        assert!(matches!(promise.get(), Err(Error::Rejected)));
    }

    #[test]
    fn test_used_completer_keeps_outcome() {
        let promise = Promise::<u32>::new();
        assert!(Completer::new(promise.clone()).complete(Ok(7)));

        assert_eq!(promise.get().unwrap(), 7);
    }
}
