#[macro_use]
extern crate log;

use futurebox::{Executor, ThreadPool};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

mod test_future;

/*
 *
 * ===== Helpers =====
 *
 */

#[derive(Debug, thiserror::Error)]
#[error("unsupported operation")]
pub struct UnsupportedOp;

#[derive(Debug, thiserror::Error)]
#[error("illegal argument")]
pub struct IllegalArgument;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn executor() -> Arc<dyn Executor> {
    init_logging();
    Arc::new(ThreadPool::fixed_size(4))
}

fn single_worker() -> Arc<dyn Executor> {
    init_logging();
    Arc::new(ThreadPool::builder().pool_size(1).name_prefix("single").build())
}

fn sleep_ms(ms: u64) {
    let target = Instant::now() + Duration::from_millis(ms);

    loop {
        let now = Instant::now();

        if now >= target {
            return;
        }

        thread::park_timeout(target - now);
    }
}

fn ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
