use futurebox::{BoxError, Error, Future, Promise};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use crate::{executor, ms, single_worker, sleep_ms, IllegalArgument, UnsupportedOp};

#[test]
pub fn test_success_map() {
    let future = Future::success("x".to_string()).map(|s| s.to_uppercase());

    assert_eq!("X", future.await_on(&executor()).unwrap());
}

#[test]
pub fn test_failure_or_else() {
    let future = Future::failure(UnsupportedOp).or_else(Future::success("y"));

    assert_eq!("y", future.await_on(&executor()).unwrap());
}

#[test]
pub fn test_or_else_passes_success_through() {
    let alternative = Future::task(|| -> Result<&'static str, BoxError> { panic!("alternative should not run") });
    let future = Future::success("x").or_else(alternative);

    assert_eq!("x", future.await_on(&executor()).unwrap());
}

#[test]
pub fn test_success_does_not_touch_executor() {
    let promise = Future::success(1).apply(&executor());

    // Already resolved when apply returns
    assert!(promise.is_completed());
    assert_eq!(1, promise.get().unwrap());
}

#[test]
pub fn test_failure_outcome() {
    let err = Future::<String>::failure(UnsupportedOp).await_on(&executor()).unwrap_err();

    assert!(err.is_execution());
    assert!(err.downcast_ref::<UnsupportedOp>().is_some());
}

#[test]
pub fn test_task_runs_on_executor() {
    let future = Future::task(|| Ok(thread::current().name().map(String::from)));
    let name = future.await_on(&executor()).unwrap().unwrap();

    assert!(name.starts_with("futurebox-worker"), "name={}", name);
}

#[test]
pub fn test_task_error_and_panic() {
    let executor = executor();

    let failed = Future::<u32>::task(|| Err(IllegalArgument.into()));
    let err = failed.await_on(&executor).unwrap_err();
    assert!(err.downcast_ref::<IllegalArgument>().is_some());

    let panicked = Future::<u32>::task(|| panic!("boom"));
    match panicked.await_on(&executor) {
        Err(Error::Panic(msg)) => assert_eq!("boom", msg),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
pub fn test_task_with_question_mark() {
    let future = Future::task(|| {
        let n: u32 = "42".parse()?;
        Ok(n)
    });

    assert_eq!(42, future.await_on(&executor()).unwrap());

    let future = Future::task(|| {
        let n: u32 = "nope".parse()?;
        Ok(n)
    });

    let err = future.await_on(&executor()).unwrap_err();
    assert!(err.downcast_ref::<std::num::ParseIntError>().is_some());
}

#[test]
pub fn test_flat_map() {
    let future = Future::success("Hello world!".to_string())
        .flat_map(|s| Future::task(move || Ok(s.to_uppercase())));

    assert_eq!("HELLO WORLD!", future.await_on(&executor()).unwrap());
}

#[test]
pub fn test_flat_map_failure_skips_mapper() {
    let called = Arc::new(AtomicUsize::new(0));
    let c = called.clone();

    let future = Future::<u32>::failure(UnsupportedOp)
        .flat_map(move |v| {
            c.fetch_add(1, Ordering::SeqCst);
            Future::success(v + 1)
        });

    let err = future.await_on(&executor()).unwrap_err();
    assert!(err.downcast_ref::<UnsupportedOp>().is_some());
    assert_eq!(0, called.load(Ordering::SeqCst));
}

#[test]
pub fn test_flatten() {
    let nested = Future::success(Future::success(7));

    assert_eq!(7, nested.flatten().await_on(&executor()).unwrap());
}

#[test]
pub fn test_filter() {
    let executor = executor();

    let kept = Future::success("Hello world!").filter(|s| s.contains("Hello"));
    assert_eq!("Hello world!", kept.await_on(&executor).unwrap());

    let dropped = Future::success("Hello world!").filter(|s| s.contains("Bye"));
    assert!(dropped.await_on(&executor).unwrap_err().is_not_found());

    let not = Future::success("Hello world!").filter_not(|s| s.contains("Bye"));
    assert_eq!("Hello world!", not.await_on(&executor).unwrap());
}

#[test]
pub fn test_recover() {
    let future = Future::failure(UnsupportedOp).recover(|err| format!("recovered {}", err.is_execution()));

    assert_eq!("recovered true", future.await_on(&executor()).unwrap());
}

#[test]
pub fn test_recover_with_matching_and_non_matching() {
    let executor = executor();

    let matching = Future::failure(UnsupportedOp)
        .recover_with(|_: &UnsupportedOp| "unsupported");
    assert_eq!("unsupported", matching.await_on(&executor).unwrap());

    let other = Future::<&'static str>::failure(IllegalArgument)
        .recover_with(|_: &UnsupportedOp| "unsupported");
    let err = other.await_on(&executor).unwrap_err();
    assert!(err.downcast_ref::<IllegalArgument>().is_some());
}

#[test]
pub fn test_fold() {
    let executor = executor();

    let ok = Future::success(2).fold(|_| -1, |v| v * 10);
    assert_eq!(20, ok.await_on(&executor).unwrap());

    let failed = Future::<i32>::failure(UnsupportedOp).fold(|_| -1, |v| v * 10);
    assert_eq!(-1, failed.await_on(&executor).unwrap());
}

#[test]
pub fn test_and_then_sequences() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let log = log.clone();
        Future::exec(move || { log.lock().unwrap().push("first"); Ok(()) })
    };

    let second = {
        let log = log.clone();
        Future::task(move || { log.lock().unwrap().push("second"); Ok(2) })
    };

    assert_eq!(2, first.and_then(second).await_on(&executor()).unwrap());
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
}

#[test]
pub fn test_defer_is_lazy() {
    let built = Arc::new(AtomicUsize::new(0));
    let b = built.clone();

    let future = Future::defer(move || {
        b.fetch_add(1, Ordering::SeqCst);
        Future::success("deferred")
    });

    assert_eq!(0, built.load(Ordering::SeqCst));
    assert_eq!("deferred", future.await_on(&executor()).unwrap());
    assert_eq!(1, built.load(Ordering::SeqCst));
}

#[test]
pub fn test_apply_memoizes_side_effects() {
    let executor = executor();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();

    let future = Future::task(move || Ok(c.fetch_add(1, Ordering::SeqCst)));

    let p1 = future.apply(&executor);
    let p2 = future.apply(&executor);

    assert_eq!(p1.get().unwrap(), p2.get().unwrap());
    assert_eq!(1, count.load(Ordering::SeqCst));
}

#[test]
pub fn test_from_promise() {
    let promise = Promise::new();
    let future = Future::from_promise(promise.clone()).map(|v: u32| v + 1);

    let result = future.apply(&executor());
    promise.succeed(1);

    assert_eq!(2, result.get().unwrap());
}

#[test]
pub fn test_delay() {
    let executor = executor();
    let start = std::time::Instant::now();

    let future = Future::delay(ms(100), || Ok("Hello World!"));

    assert_eq!("Hello World!", future.await_on(&executor).unwrap());
    assert!(start.elapsed() >= ms(100));
}

#[test]
pub fn test_delay_failure() {
    let future = Future::<String>::delay(ms(100), || Err(UnsupportedOp.into()));
    let err = future.await_on(&executor()).unwrap_err();

    assert!(err.downcast_ref::<UnsupportedOp>().is_some());
}

#[test]
pub fn test_delay_does_not_hold_worker() {
    let executor = single_worker();

    let delayed = Future::delay(Duration::from_secs(10), || Ok("late"));
    let promise = delayed.apply(&executor);

    // The only worker is free to run other jobs during the delay
    let quick = Future::task(|| Ok("quick"));
    assert_eq!("quick", quick.await_timeout(&executor, Duration::from_secs(1)).unwrap());
    assert!(!promise.is_completed());
}

#[test]
pub fn test_await_timeout_isolation() {
    let executor = executor();
    let future = Future::delay(Duration::from_secs(1), || Ok("Hello world!"));

    let err = future.await_timeout(&executor, ms(100)).unwrap_err();
    assert!(err.is_timeout());

    // The computation was not affected by the timed-out wait
    assert_eq!("Hello world!", future.await_on(&executor).unwrap());
}

#[test]
pub fn test_future_listeners() {
    let (tx, rx) = channel();

    let ok = {
        let tx = tx.clone();
        Future::success("Hello World!")
            .on_success(move |v| tx.send(format!("success {}", v)).unwrap())
    };

    let failed = {
        let tx = tx.clone();
        Future::<&'static str>::delay(ms(50), || Err(UnsupportedOp.into()))
            .on_failure(move |err| {
                tx.send(format!("failure {}", err.downcast_ref::<UnsupportedOp>().is_some())).unwrap()
            })
    };

    let executor = executor();
    assert_eq!("Hello World!", ok.await_on(&executor).unwrap());
    assert!(failed.await_on(&executor).is_err());

    drop(tx);

    let vals: Vec<String> = rx.iter().collect();
    assert_eq!(vals, vec!["success Hello World!".to_string(), "failure true".to_string()]);
}

#[test]
pub fn test_panicking_listener_fails_future() {
    let future = Future::success(1).on_complete(|_| panic!("listener failure"));

    match future.await_on(&executor()) {
        Err(Error::Panic(msg)) => assert_eq!("listener failure", msg),
        other => panic!("unexpected outcome {:?}", other),
    }
}

fn current_thread(result: &Arc<Mutex<Vec<String>>>) -> Future<()> {
    let result = result.clone();

    Future::exec(move || {
        let name = thread::current().name().unwrap_or("unnamed").to_string();
        result.lock().unwrap().push(name);
        Ok(())
    })
}

#[test]
pub fn test_no_deadlock() {
    let executor = single_worker();
    let result = Arc::new(Mutex::new(Vec::new()));

    current_thread(&result).and_then(
        current_thread(&result).and_then(
            current_thread(&result).and_then(
                current_thread(&result))))
        .await_timeout(&executor, Duration::from_secs(5))
        .unwrap();

    let result = result.lock().unwrap();
    assert_eq!(4, result.len());
    assert!(result.iter().all(|name| name == "single-0"), "names={:?}", *result);
}

#[test]
pub fn test_deep_flat_map_chain_on_single_worker() {
    let executor = single_worker();
    let mut future = Future::success(0u64);

    for _ in 0..5_000 {
        future = future.flat_map(|v| Future::task(move || Ok(v + 1)));
    }

    assert_eq!(5_000, future.await_timeout(&executor, Duration::from_secs(30)).unwrap());
}

#[test]
pub fn test_very_long_chain_applied_once() {
    let executor = single_worker();
    let mut future = Future::success(0u64);

    for _ in 0..100_000 {
        future = future.flat_map(|v| Future::success(v + 1));
    }

    assert_eq!(100_000, future.await_timeout(&executor, Duration::from_secs(60)).unwrap());
}

#[test]
pub fn test_dropping_long_unapplied_chain() {
    let dropped = Arc::new(AtomicUsize::new(0));

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let mut future = Future::success(0u64);

    for _ in 0..100_000 {
        let counted = Counted(dropped.clone());
        future = future.map(move |v| {
            let _ = &counted;
            v + 1
        });
    }

    let middle = future.clone().map(|v| v * 2);
    drop(future);

    // Only the part of the chain nothing else refers to is released
    assert_eq!(0, dropped.load(Ordering::SeqCst));

    drop(middle);
    assert_eq!(100_000, dropped.load(Ordering::SeqCst));
}

#[test]
pub fn test_blocking_get_from_other_thread_sees_completion() {
    let executor = executor();
    let future = Future::delay(ms(50), || Ok(5));
    let promise = future.apply(&executor);

    let handle = {
        let promise = promise.clone();
        thread::spawn(move || promise.get().unwrap())
    };

    sleep_ms(10);
    assert_eq!(5, handle.join().unwrap());
}
