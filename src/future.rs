//! Deferred, executor-bound computations.
//!
//! A `Future` is a recipe: a function from an executor to a promise. Nothing
//! runs until the future is applied. The first `apply` runs the recipe and
//! memoizes the resulting promise; later calls (and clones of the future)
//! observe that same promise, so side effects are never duplicated.
//!
//! Combinators come in two flavours:
//!
//! * pure transforms (`map`, `filter`, `recover`, `fold`, ...) run inline on
//!   the thread completing the parent promise;
//! * continuations that produce a new future (`flat_map`, `and_then`,
//!   `or_else`, the racing combinators) are resubmitted to the executor as a
//!   fresh job. Nested futures are therefore never applied from inside a
//!   completion callback, which keeps long chains from growing the stack and
//!   lets them finish on a single-worker executor.
//!
//! Applying a chain schedules its unscheduled ancestors first, deepest first,
//! in a loop; dropping an unapplied chain unlinks it the same way.

use crate::cancel::Execution;
use crate::error::{self, BoxError, Error, Outcome};
use crate::promise::{Completer, Promise};
use crate::{Executor, Job};
use parking_lot::Mutex;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, mem};

type Recipe<T> = Box<dyn FnOnce(&Arc<dyn Executor>) -> Scheduled<T> + Send>;

pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    stage: Stage<T>,
    // Future whose promise the recipe listens on. Only set while unscheduled.
    parent: Option<Arc<dyn Link>>,
}

enum Stage<T> {
    Unscheduled(Recipe<T>),
    // The recipe is running without the lock held. Callers arriving
    // meanwhile share `promise`, created on demand; a `cancel` is recorded
    // and applied to the handle the recipe returns.
    Scheduling {
        promise: Option<Promise<T>>,
        cancel: Option<bool>,
    },
    Scheduled(Scheduled<T>),
    // Recipe released while tearing down an unreferenced chain
    Detached,
}

// Type erased view of a future, so that chains can be scheduled and torn
// down with a loop instead of one stack frame per link.
trait Link: Send + Sync {
    // Returns the parent link if this one is still unscheduled.
    fn pending_parent(&self) -> Option<Arc<dyn Link>>;

    fn schedule_link(&self, executor: &Arc<dyn Executor>);

    // Releases the recipe, returning the parent link.
    fn unlink(&self) -> Option<Arc<dyn Link>>;
}

/// A scheduled future: the promise plus, for work actually submitted to the
/// executor, the handle used to cancel it.
pub(crate) struct Scheduled<T> {
    promise: Promise<T>,
    execution: Option<Arc<Execution>>,
}

impl<T: Clone + Send + 'static> Scheduled<T> {
    pub fn new(promise: Promise<T>) -> Scheduled<T> {
        Scheduled { promise, execution: None }
    }

    fn resolved(outcome: Outcome<T>) -> Scheduled<T> {
        Scheduled::new(Promise::completed(outcome))
    }
}

impl<T> Clone for Scheduled<T> {
    fn clone(&self) -> Scheduled<T> {
        Scheduled {
            promise: self.promise.clone(),
            execution: self.execution.clone(),
        }
    }
}

/*
 *
 * ===== Construction =====
 *
 */

impl<T: Clone + Send + 'static> Future<T> {
    pub(crate) fn from_recipe<F>(recipe: F) -> Future<T>
        where F: FnOnce(&Arc<dyn Executor>) -> Scheduled<T> + Send + 'static
    {
        Future::with_parent(Box::new(recipe), None)
    }

    /// Builds a future whose recipe applies `parent` first.
    ///
    /// Unscheduled parents are scheduled ahead of the recipe, so applying a
    /// long chain does not recurse through it.
    pub(crate) fn chain<P, F>(parent: Future<P>, recipe: F) -> Future<T>
        where P: Clone + Send + 'static,
              F: FnOnce(Future<P>, &Arc<dyn Executor>) -> Scheduled<T> + Send + 'static
    {
        let link: Arc<dyn Link> = parent.shared.clone();
        Future::with_parent(Box::new(move |executor: &Arc<dyn Executor>| recipe(parent, executor)), Some(link))
    }

    fn with_parent(recipe: Recipe<T>, parent: Option<Arc<dyn Link>>) -> Future<T> {
        Future {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    stage: Stage::Unscheduled(recipe),
                    parent,
                }),
            }),
        }
    }

    /// Returns a future that is already resolved with `outcome`.
    pub fn from_outcome(outcome: Outcome<T>) -> Future<T> {
        Future::from_recipe(move |_| Scheduled::resolved(outcome))
    }

    /// Returns an immediately successful future.
    ///
    /// Applying it never touches the executor.
    pub fn success(val: T) -> Future<T> {
        Future::from_outcome(Ok(val))
    }

    /// Returns an immediately failed future.
    pub fn failure<E: Into<BoxError>>(err: E) -> Future<T> {
        Future::from_outcome(Err(Error::from_boxed(err.into())))
    }

    /// Returns a future backed by an existing promise.
    pub fn from_promise(promise: Promise<T>) -> Future<T> {
        Future::from_recipe(move |_| Scheduled::new(promise))
    }

    /// Runs `producer` on the executor.
    ///
    /// ```
    /// use futurebox::{Executor, Future, ThreadPool};
    /// use std::sync::Arc;
    ///
    /// let executor: Arc<dyn Executor> = Arc::new(ThreadPool::single_thread());
    /// let future = Future::task(|| Ok("hello".to_uppercase()));
    ///
    /// assert_eq!("HELLO", future.await_on(&executor).unwrap());
    /// ```
    pub fn task<F>(producer: F) -> Future<T>
        where F: FnOnce() -> Result<T, BoxError> + Send + 'static
    {
        Future::from_recipe(move |executor| submit(executor, None, producer))
    }

    /// Runs `producer` on the executor once `delay` has elapsed.
    ///
    /// The delay is handled by the executor's delayed submission; no worker
    /// thread is held while waiting.
    pub fn delay<F>(delay: Duration, producer: F) -> Future<T>
        where F: FnOnce() -> Result<T, BoxError> + Send + 'static
    {
        Future::from_recipe(move |executor| submit(executor, Some(delay), producer))
    }

    /// Builds the future to run lazily, when this one is applied.
    pub fn defer<F>(producer: F) -> Future<T>
        where F: FnOnce() -> Future<T> + Send + 'static
    {
        Future::from_recipe(move |executor| {
            match error::catch(producer) {
                Ok(future) => future.schedule(executor),
                Err(err) => Scheduled::resolved(Err(err)),
            }
        })
    }
}

impl Future<()> {
    /// Runs a side-effecting action on the executor.
    pub fn exec<F>(action: F) -> Future<()>
        where F: FnOnce() -> Result<(), BoxError> + Send + 'static
    {
        Future::task(action)
    }
}

fn submit<T, F>(executor: &Arc<dyn Executor>, delay: Option<Duration>, producer: F) -> Scheduled<T>
    where T: Clone + Send + 'static,
          F: FnOnce() -> Result<T, BoxError> + Send + 'static
{
    let promise = Promise::new();
    let execution = Execution::new();

    let completer = Completer::new(promise.clone());
    let handle = execution.clone();

    let job: Job = Box::new(move || {
        handle.run(move || {
            let outcome = match error::catch(producer) {
                Ok(Ok(val)) => Ok(val),
                Ok(Err(err)) => Err(Error::from_boxed(err)),
                Err(err) => Err(err),
            };

            completer.complete(outcome);
        });
    });

    let res = match delay {
        Some(delay) => executor.submit_after(delay, job),
        None => executor.submit(job),
    };

    if let Err(err) = res {
        warn!("executor rejected job; err={:?}", err);
    }

    Scheduled { promise, execution: Some(execution) }
}

/*
 *
 * ===== Scheduling =====
 *
 */

impl<T: Clone + Send + 'static> Future<T> {
    /// Schedules the future on `executor`, returning its promise.
    ///
    /// Only the first call runs the recipe; subsequent calls return the same
    /// promise regardless of the executor passed.
    pub fn apply(&self, executor: &Arc<dyn Executor>) -> Promise<T> {
        self.schedule(executor).promise
    }

    pub(crate) fn schedule(&self, executor: &Arc<dyn Executor>) -> Scheduled<T> {
        let mut pending = Vec::new();
        let mut next = self.shared.pending_parent();

        while let Some(link) = next {
            next = link.pending_parent();
            pending.push(link);
        }

        // Deepest first: every recipe then finds its parent already scheduled
        while let Some(link) = pending.pop() {
            link.schedule_link(executor);
        }

        self.shared.schedule(executor)
    }

    /// Schedules the future and blocks until it completes.
    pub fn await_on(&self, executor: &Arc<dyn Executor>) -> Outcome<T> {
        self.apply(executor).get()
    }

    /// Schedules the future and blocks for up to `timeout`.
    ///
    /// On timeout the computation keeps running; awaiting again later
    /// observes its real outcome.
    pub fn await_timeout(&self, executor: &Arc<dyn Executor>, timeout: Duration) -> Outcome<T> {
        self.apply(executor).get_timeout(timeout)
    }

    /// Requests cancellation.
    ///
    /// If the future has not been applied yet it is fixed to a cancelled
    /// outcome and its recipe never runs. If its promise is still pending,
    /// the promise fails with `Error::Cancelled`; work that has not started
    /// is skipped, and running work is interrupted when `may_interrupt` is
    /// set. Cancelling a completed future has no effect and returns `false`.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let (promise, execution) = {
            let mut inner = self.shared.inner.lock();

            if matches!(inner.stage, Stage::Unscheduled(..) | Stage::Detached) {
                debug!("Future::cancel; not yet scheduled -- dropping recipe");

                let cancelled = Stage::Scheduled(Scheduled::resolved(Err(Error::Cancelled)));
                let recipe = mem::replace(&mut inner.stage, cancelled);
                let parent = inner.parent.take();

                drop(inner);
                drop((recipe, parent));
                return true;
            }

            match inner.stage {
                Stage::Scheduled(ref scheduled) => (scheduled.promise.clone(), scheduled.execution.clone()),
                Stage::Scheduling { ref mut promise, ref mut cancel } => {
                    cancel.get_or_insert(may_interrupt);
                    (promise.get_or_insert_with(Promise::new).clone(), None)
                }
                Stage::Unscheduled(..) | Stage::Detached => return false,
            }
        };

        if !promise.complete(Err(Error::Cancelled)) {
            debug!("Future::cancel; already completed");
            return false;
        }

        if let Some(execution) = execution {
            execution.cancel(may_interrupt);
        }

        true
    }
}

impl<T: Clone + Send + 'static> Shared<T> {
    // Runs the recipe at most once. The lock is released while it runs, so
    // the recipe (or a job an inline executor runs for it) may apply or
    // cancel this same future.
    fn schedule(&self, executor: &Arc<dyn Executor>) -> Scheduled<T> {
        let (recipe, parent) = {
            let mut inner = self.inner.lock();
            let scheduling = Stage::Scheduling { promise: None, cancel: None };

            match mem::replace(&mut inner.stage, scheduling) {
                Stage::Unscheduled(recipe) => (recipe, inner.parent.take()),
                stage => {
                    inner.stage = stage;
                    return inner.observe();
                }
            }
        };

        drop(parent);

        let scheduled = error::catch(move || recipe(executor))
            .unwrap_or_else(|err| Scheduled::resolved(Err(err)));

        let (placeholder, cancel) = {
            let mut inner = self.inner.lock();

            let (placeholder, cancel) = match inner.stage {
                Stage::Scheduling { ref mut promise, cancel } => (promise.take(), cancel),
                _ => (None, None),
            };

            inner.stage = Stage::Scheduled(match placeholder {
                Some(ref promise) => Scheduled {
                    promise: promise.clone(),
                    execution: scheduled.execution.clone(),
                },
                None => scheduled.clone(),
            });

            (placeholder, cancel)
        };

        if let (Some(may_interrupt), Some(execution)) = (cancel, scheduled.execution.as_ref()) {
            debug!("Future::schedule; cancelled while scheduling");
            execution.cancel(may_interrupt);
        }

        match placeholder {
            Some(promise) => {
                promise.complete_with(&scheduled.promise);
                Scheduled { promise, execution: scheduled.execution }
            }
            None => scheduled,
        }
    }
}

impl<T: Clone + Send + 'static> Inner<T> {
    // What a caller that does not run the recipe gets to see.
    fn observe(&mut self) -> Scheduled<T> {
        match self.stage {
            Stage::Scheduled(ref scheduled) => scheduled.clone(),
            Stage::Scheduling { ref mut promise, .. } => {
                Scheduled::new(promise.get_or_insert_with(Promise::new).clone())
            }
            Stage::Unscheduled(..) | Stage::Detached => Scheduled::resolved(Err(Error::Cancelled)),
        }
    }
}

impl<T: Clone + Send + 'static> Link for Shared<T> {
    fn pending_parent(&self) -> Option<Arc<dyn Link>> {
        let inner = self.inner.lock();

        match inner.stage {
            Stage::Unscheduled(..) => inner.parent.clone(),
            _ => None,
        }
    }

    fn schedule_link(&self, executor: &Arc<dyn Executor>) {
        self.schedule(executor);
    }

    fn unlink(&self) -> Option<Arc<dyn Link>> {
        let (recipe, parent) = {
            let mut inner = self.inner.lock();

            if !matches!(inner.stage, Stage::Unscheduled(..)) {
                return None;
            }

            (mem::replace(&mut inner.stage, Stage::Detached), inner.parent.take())
        };

        drop(recipe);
        parent
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let mut next = match inner.parent.take() {
            Some(parent) => Some(parent),
            None => return,
        };

        // The recipe holds its own handle on the parent
        inner.stage = Stage::Detached;

        while let Some(link) = next {
            if Arc::strong_count(&link) > 1 {
                break;
            }

            next = link.unlink();
        }
    }
}

/*
 *
 * ===== Combinators =====
 *
 */

impl<T: Clone + Send + 'static> Future<T> {
    /// Applies `f` to the outcome inline, on the completing thread.
    fn transform<R, F>(self, f: F) -> Future<R>
        where R: Clone + Send + 'static,
              F: FnOnce(Outcome<T>) -> Outcome<R> + Send + 'static
    {
        Future::chain(self, move |parent, executor| {
            let promise = Promise::new();
            let target = promise.clone();

            parent.apply(executor).on_complete(move |outcome| {
                target.complete(error::catch(move || f(outcome)).and_then(|res| res));
            });

            Scheduled::new(promise)
        })
    }

    /// Continues with the future returned by `f`, applied from a new job on
    /// the executor.
    ///
    /// The continuation is skipped when the resulting future has already
    /// been completed (cancelled) by the time the job runs.
    pub(crate) fn continue_with<R, F>(self, f: F) -> Future<R>
        where R: Clone + Send + 'static,
              F: FnOnce(Outcome<T>) -> Future<R> + Send + 'static
    {
        Future::chain(self, move |parent, executor| {
            let promise = Promise::new();
            let completer = Completer::new(promise.clone());
            let executor = executor.clone();

            parent.apply(&executor).on_complete(move |outcome| {
                let job_executor = executor.clone();

                let job: Job = Box::new(move || {
                    if completer.is_completed() {
                        trace!("continuation target already completed -- skipping");
                        return;
                    }

                    let next = error::catch(move || f(outcome))
                        .unwrap_or_else(|err| Future::from_outcome(Err(err)));

                    completer.complete_with(&next.apply(&job_executor));
                });

                if let Err(err) = executor.submit(job) {
                    warn!("executor rejected continuation; err={:?}", err);
                }
            });

            Scheduled::new(promise)
        })
    }

    pub fn map<R, F>(self, f: F) -> Future<R>
        where R: Clone + Send + 'static,
              F: FnOnce(T) -> R + Send + 'static
    {
        self.transform(move |outcome| outcome.map(f))
    }

    /// Chains a future-producing function onto this future.
    ///
    /// If this future fails, `f` is never invoked and the failure is passed
    /// through.
    pub fn flat_map<R, F>(self, f: F) -> Future<R>
        where R: Clone + Send + 'static,
              F: FnOnce(T) -> Future<R> + Send + 'static
    {
        self.continue_with(move |outcome| {
            match outcome {
                Ok(val) => f(val),
                Err(err) => Future::from_outcome(Err(err)),
            }
        })
    }

    /// Runs `next` after this future succeeds, discarding this future's
    /// value.
    pub fn and_then<R>(self, next: Future<R>) -> Future<R>
        where R: Clone + Send + 'static
    {
        self.flat_map(move |_| next)
    }

    /// Fails with `Error::NotFound` unless the value satisfies `pred`.
    pub fn filter<F>(self, pred: F) -> Future<T>
        where F: FnOnce(&T) -> bool + Send + 'static
    {
        self.transform(move |outcome| {
            outcome.and_then(|val| {
                if pred(&val) {
                    Ok(val)
                } else {
                    Err(Error::not_found("value rejected by filter"))
                }
            })
        })
    }

    /// Fails with `Error::NotFound` if the value satisfies `pred`.
    pub fn filter_not<F>(self, pred: F) -> Future<T>
        where F: FnOnce(&T) -> bool + Send + 'static
    {
        self.filter(move |val| !pred(val))
    }

    /// Substitutes a value for any failure.
    pub fn recover<F>(self, f: F) -> Future<T>
        where F: FnOnce(Error) -> T + Send + 'static
    {
        self.transform(move |outcome| outcome.or_else(|err| Ok(f(err))))
    }

    /// Substitutes a value for failures whose execution cause is an `E`.
    ///
    /// Any other failure passes through unchanged.
    pub fn recover_with<E, F>(self, f: F) -> Future<T>
        where E: StdError + 'static,
              F: FnOnce(&E) -> T + Send + 'static
    {
        self.transform(move |outcome| {
            outcome.or_else(|err| {
                match err.downcast_ref::<E>().map(f) {
                    Some(val) => Ok(val),
                    None => Err(err),
                }
            })
        })
    }

    /// Reduces the outcome to a plain value.
    pub fn fold<R, F, S>(self, on_failure: F, on_success: S) -> Future<R>
        where R: Clone + Send + 'static,
              F: FnOnce(Error) -> R + Send + 'static,
              S: FnOnce(T) -> R + Send + 'static
    {
        self.transform(move |outcome| {
            Ok(match outcome {
                Ok(val) => on_success(val),
                Err(err) => on_failure(err),
            })
        })
    }

    /// Switches to `alternative` if this future fails.
    pub fn or_else(self, alternative: Future<T>) -> Future<T> {
        self.continue_with(move |outcome| {
            match outcome {
                Ok(val) => Future::success(val),
                Err(err) => {
                    debug!("Future::or_else; switching to alternative; err={:?}", err);
                    alternative
                }
            }
        })
    }

    /// Invokes `f` with the outcome, passing the outcome through.
    ///
    /// A panic in `f` fails the resulting future with `Error::Panic`.
    pub fn on_complete<F>(self, f: F) -> Future<T>
        where F: FnOnce(Outcome<T>) + Send + 'static
    {
        self.transform(move |outcome| {
            f(outcome.clone());
            outcome
        })
    }

    pub fn on_success<F>(self, f: F) -> Future<T>
        where F: FnOnce(T) + Send + 'static
    {
        self.on_complete(move |outcome| {
            if let Ok(val) = outcome {
                f(val);
            }
        })
    }

    pub fn on_failure<F>(self, f: F) -> Future<T>
        where F: FnOnce(Error) + Send + 'static
    {
        self.on_complete(move |outcome| {
            if let Err(err) = outcome {
                f(err);
            }
        })
    }
}

impl<T: Clone + Send + 'static> Future<Future<T>> {
    pub fn flatten(self) -> Future<T> {
        self.flat_map(|future| future)
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Future<T> {
        Future { shared: self.shared.clone() }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let scheduled = matches!(self.shared.inner.lock().stage, Stage::Scheduled(..));
        write!(fmt, "Future {{ scheduled: {} }}", scheduled)
    }
}
