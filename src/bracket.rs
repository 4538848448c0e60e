use crate::error::{self, BoxError, Error};
use crate::future::{Future, Scheduled};
use crate::promise::{Completer, Promise};
use crate::Job;

impl<T: Clone + Send + 'static> Future<T> {
    /// Acquires a resource, uses it, then releases it.
    ///
    /// If `acquire` fails, the result fails with the same cause and `release`
    /// is never called. Otherwise `release` runs exactly once after the future
    /// returned by `use_` settles, whether it succeeded or failed, and even if
    /// the bracket future was cancelled in the meantime (in which case `use_`
    /// is skipped when it has not started yet).
    ///
    /// The caller observes `use_`'s outcome. A failing `release` is logged and
    /// never masks it.
    ///
    /// ```
    /// use futurebox::{Executor, Future, ThreadPool};
    /// use std::sync::Arc;
    ///
    /// let executor: Arc<dyn Executor> = Arc::new(ThreadPool::single_thread());
    ///
    /// let len = Future::bracket(
    ///     Future::success(vec![1, 2, 3]),
    ///     |buf| Future::success(buf.len()),
    ///     |_buf| Ok(()));
    ///
    /// assert_eq!(3, len.await_on(&executor).unwrap());
    /// ```
    pub fn bracket<A, U, R>(acquire: Future<A>, use_: U, release: R) -> Future<T>
        where A: Clone + Send + 'static,
              U: FnOnce(A) -> Future<T> + Send + 'static,
              R: FnOnce(A) -> Result<(), BoxError> + Send + 'static
    {
        Future::chain(acquire, move |acquire, executor| {
            let promise = Promise::new();
            let completer = Completer::new(promise.clone());
            let executor = executor.clone();

            acquire.apply(&executor).on_complete(move |outcome| {
                let resource = match outcome {
                    Ok(resource) => resource,
                    Err(err) => {
                        debug!("bracket; acquire failed -- release skipped; err={:?}", err);
                        completer.complete(Err(err));
                        return;
                    }
                };

                let release = Release::new(resource.clone(), release);
                let job_executor = executor.clone();

                let job: Job = Box::new(move || {
                    if completer.is_completed() {
                        debug!("bracket; cancelled before use -- releasing");
                        release.run();
                        return;
                    }

                    let used = match error::catch(move || use_(resource)) {
                        Ok(future) => future.apply(&job_executor),
                        Err(err) => Promise::completed(Err(err)),
                    };

                    used.on_complete(move |outcome| {
                        release.run();
                        completer.complete(outcome);
                    });
                });

                if let Err(err) = executor.submit(job) {
                    warn!("executor rejected bracket use; err={:?}", err);
                }
            });

            Scheduled::new(promise)
        })
    }
}

// Runs the release action exactly once, on `run` or, failing that, on drop.
struct Release<A, R>
    where R: FnOnce(A) -> Result<(), BoxError>
{
    action: Option<(A, R)>,
}

impl<A, R> Release<A, R>
    where R: FnOnce(A) -> Result<(), BoxError>
{
    fn new(resource: A, release: R) -> Release<A, R> {
        Release { action: Some((resource, release)) }
    }

    fn run(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let (resource, release) = match self.action.take() {
            Some(action) => action,
            None => return,
        };

        match error::catch(move || release(resource)) {
            Ok(Ok(())) => trace!("bracket; resource released"),
            Ok(Err(err)) => warn!("bracket; release failed; err={:?}", Error::from_boxed(err)),
            Err(err) => warn!("bracket; release panicked; err={:?}", err),
        }
    }
}

impl<A, R> Drop for Release<A, R>
    where R: FnOnce(A) -> Result<(), BoxError>
{
    fn drop(&mut self) {
        self.release();
    }
}
