use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error returned by producers and release actions.
///
/// Any error type converts into it with `?`.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The result of an asynchronous computation.
pub type Outcome<T> = Result<T, Error>;

/// Failure carried by a completed promise.
#[derive(Clone, thiserror::Error)]
pub enum Error {
    /// The scheduled work returned an error.
    #[error("execution failed: {0}")]
    Execution(Arc<dyn StdError + Send + Sync>),

    /// The scheduled work, or a transform applied to its result, panicked.
    #[error("execution panicked: {0}")]
    Panic(String),

    /// A bounded wait expired before the promise completed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The future was cancelled before it completed.
    #[error("future was cancelled")]
    Cancelled,

    /// The running job was interrupted while sleeping.
    #[error("job was interrupted")]
    Interrupted,

    /// No branch or value matched.
    #[error("no such element: {0}")]
    NotFound(String),

    /// The promise has not completed yet.
    #[error("no value available: promise is still pending")]
    Pending,

    /// The executor is no longer accepting jobs.
    #[error("executor rejected the job")]
    Rejected,
}

impl Error {
    /// Wraps an arbitrary error as an execution failure.
    pub fn execution<E>(err: E) -> Error
        where E: StdError + Send + Sync + 'static
    {
        Error::Execution(Arc::new(err))
    }

    /// Converts a boxed error, unwrapping it if it already is an `Error`.
    pub fn from_boxed(err: BoxError) -> Error {
        match err.downcast::<Error>() {
            Ok(err) => *err,
            Err(err) => Error::Execution(Arc::from(err)),
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Error {
        Error::NotFound(what.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Error {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        Error::Panic(msg)
    }

    pub fn is_execution(&self) -> bool {
        matches!(*self, Error::Execution(..) | Error::Panic(..))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self, Error::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(*self, Error::Timeout(..))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(*self, Error::NotFound(..))
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self, Error::Pending)
    }

    /// Returns the execution cause as `E`, if that is what it is.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match *self {
            Error::Execution(ref cause) => cause.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Execution(ref e) => write!(fmt, "Execution({:?})", e),
            Error::Panic(ref msg) => write!(fmt, "Panic({:?})", msg),
            Error::Timeout(d) => write!(fmt, "Timeout({:?})", d),
            Error::Cancelled => write!(fmt, "Cancelled"),
            Error::Interrupted => write!(fmt, "Interrupted"),
            Error::NotFound(ref what) => write!(fmt, "NotFound({:?})", what),
            Error::Pending => write!(fmt, "Pending"),
            Error::Rejected => write!(fmt, "Rejected"),
        }
    }
}

/// Runs `f`, turning a panic into `Error::Panic`.
pub(crate) fn catch<F, R>(f: F) -> Outcome<R>
    where F: FnOnce() -> R
{
    use std::panic::{self, AssertUnwindSafe};

    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Error::from_panic)
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_from_boxed_does_not_nest() {
        let boxed: BoxError = Box::new(Error::Cancelled);
        assert!(Error::from_boxed(boxed).is_cancelled());

        let boxed: BoxError = Box::new(Boom);
        let err = Error::from_boxed(boxed);
        assert!(err.is_execution());
        assert!(err.downcast_ref::<Boom>().is_some());
    }

    #[test]
    fn test_catch_panic_message() {
        let res: Outcome<()> = catch(|| panic!("kaboom"));

        match res {
            Err(Error::Panic(msg)) => assert_eq!(msg, "kaboom"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
