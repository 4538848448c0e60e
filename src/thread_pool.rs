//! A fixed-size pool of worker threads implementing `Executor`.
//!
//! The work queue is a `DelayQueue`, so the same workers serve both immediate
//! jobs and jobs submitted with a delay. A delayed job sits in the queue until
//! it is due; no worker is held while it waits.

use crate::delay_queue::{DelayQueue, Delayed};
use crate::error::{self, Error};
use crate::{Executor, Job};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DEFAULT_NAME_PREFIX: &str = "futurebox-worker";

/// Dropping the last handle shuts the pool down. A queued job that holds an
/// executor handle of its own (a pending continuation, say) keeps the pool
/// alive until it runs; call `shutdown` to stop such a pool deterministically.
pub struct ThreadPool {
    inner: Arc<ThreadPoolInner>,
}

impl ThreadPool {
    /// Returns a pool configuration builder.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn fixed_size(size: u32) -> ThreadPool {
        ThreadPool::builder().pool_size(size).build()
    }

    pub fn single_thread() -> ThreadPool {
        ThreadPool::fixed_size(1)
    }

    /// Starts a worker thread if fewer than the pool size are running.
    pub fn prestart_core_thread(&self) {
        let _ = self.inner.add_worker(None);
    }

    pub fn prestart_all_core_threads(&self) {
        while self.inner.add_worker(None).is_ok() {}
    }

    /// Stops accepting new jobs. Jobs that are already due keep running.
    /// Delayed jobs that are not due yet are dropped right away, which fails
    /// their promises with `Error::Rejected`.
    pub fn shutdown(&self) {
        self.inner.shutdown(Lifecycle::Shutdown);
    }

    /// Stops accepting new jobs and drops every queued one, failing their
    /// promises with `Error::Rejected`. Running jobs are left to finish.
    pub fn shutdown_now(&self) {
        self.inner.shutdown(Lifecycle::Stop);
    }

    pub fn is_shutdown(&self) -> bool {
        !self.inner.core.state.load().is_running()
    }

    /// Blocks until every worker has exited after a shutdown.
    pub fn await_termination(&self) {
        self.inner.core.await_termination();
    }
}

impl Executor for ThreadPool {
    fn submit(&self, job: Job) -> Result<(), Error> {
        self.inner.run(Task { job, delay: Duration::from_millis(0) }, true)
    }

    fn submit_after(&self, delay: Duration, job: Job) -> Result<(), Error> {
        self.inner.run(Task { job, delay }, false)
    }
}

impl Clone for ThreadPool {
    fn clone(&self) -> ThreadPool {
        ThreadPool { inner: self.inner.clone() }
    }
}

/// Thread pool configuration.
///
/// ```
/// use futurebox::ThreadPool;
///
/// let pool = ThreadPool::builder()
///     .pool_size(4)
///     .name_prefix("io")
///     .build();
/// # pool.shutdown();
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    pool_size: u32,
    name_prefix: String,
    stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Builder {
        let pool_size = thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Builder {
            pool_size,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            stack_size: None,
        }
    }

    /// Number of worker threads. Defaults to the available parallelism.
    pub fn pool_size(mut self, size: u32) -> Builder {
        assert!(size > 0, "thread pool size must be greater than 0");
        self.pool_size = size;
        self
    }

    /// Worker threads are named `{prefix}-{n}`.
    pub fn name_prefix<S: Into<String>>(mut self, prefix: S) -> Builder {
        self.name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Builder {
        self.stack_size = Some(size);
        self
    }

    pub fn build(self) -> ThreadPool {
        debug!("building thread pool; config={:?}", self);

        ThreadPool {
            inner: Arc::new(ThreadPoolInner {
                core: Arc::new(Core::new(self)),
                work_queue: DelayQueue::new(),
            }),
        }
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

struct Task {
    job: Job,
    delay: Duration,
}

impl Delayed for Task {
    fn delay(&self) -> Duration {
        self.delay
    }
}

// A `None` in the queue is a no-op token telling one worker to exit.
type WorkQueue = DelayQueue<Option<Task>>;

// ## Notes
//
// A worker increments the count before pulling from the queue and never
// touches the queue after decrementing the worker count.
struct ThreadPoolInner {
    // Contains the state, condvar, etc..
    core: Arc<Core>,

    // Holds jobs and hands them off to workers. Delayed jobs stay here until
    // due. Empty once the pool reaches Tidying.
    work_queue: WorkQueue,
}

impl ThreadPoolInner {
    fn run(&self, task: Task, immediate: bool) -> Result<(), Error> {
        //  1. If fewer than `pool_size` threads are running, try to start a
        //  new thread. An immediate task is handed directly to it as its
        //  first task; a delayed task goes through the queue.
        //
        //  2. If the pool is running, queue the task.
        //
        //  3. Otherwise the pool is shutting down; reject.
        let mut state = self.core.state.load();

        debug!("running task; tp-state={:?}; worker_count={}; delay={:?}",
               state.lifecycle(), state.worker_count(), task.delay);

        let mut task = Some(task);

        if state.worker_count() < self.core.pool_size {
            if immediate {
                match self.add_worker(task.take()) {
                    Ok(()) => {
                        debug!("worker successfully added with initial task");
                        return Ok(());
                    }
                    Err(t) => task = t,
                }
            } else {
                let _ = self.add_worker(None);
            }

            state = self.core.state.load();
        }

        if !state.is_running() {
            debug!("threadpool is not accepting new tasks");
            return Err(Error::Rejected);
        }

        // Unbounded queue
        let _ = self.work_queue.offer(task);

        // The last worker may have exited and emptied the queue between the
        // check above and the offer. Nothing would ever take the task.
        if self.core.state.load().lifecycle() >= Lifecycle::Tidying {
            debug!("threadpool terminated while queueing task");
            discard(self.work_queue.drain());
            return Err(Error::Rejected);
        }

        debug!("task submitted to queue");

        Ok(())
    }

    fn shutdown(&self, target: Lifecycle) {
        // Transition from Running -> target
        let mut state = self.core.state.load();
        let mut next;

        debug!("shutdown; tp-state={:?}; target={:?}; worker_count={}",
               state.lifecycle(), target, state.worker_count());

        loop {
            next = match state.lifecycle() {
                Lifecycle::Running => {
                    if state.worker_count() == 0 {
                        state.with_lifecycle(Lifecycle::Tidying)
                    } else {
                        state.with_lifecycle(target)
                    }
                }
                Lifecycle::Shutdown => {
                    if target == Lifecycle::Shutdown {
                        return;
                    }

                    state.with_lifecycle(target)
                }
                _ => return,
            };

            match self.core.state.compare_exchange(state, next) {
                Ok(()) => break,
                Err(actual) => state = actual,
            }
        }

        if next.lifecycle() == Lifecycle::Tidying {
            debug!("  no workers -- terminating");
            self.core.finalize_threadpool(&self.work_queue);
            return;
        }

        // Workers exit on the no-ops below before reaching anything queued
        // after them, so delayed jobs would never run. Stop runs nothing.
        match target {
            Lifecycle::Stop => discard(self.work_queue.drain()),
            _ => discard(self.work_queue.drain_delayed()),
        }

        // Submit a no-op for each worker. This unblocks workers currently
        // waiting for a task; a worker that sees the no-op exits without
        // pulling from the queue again.
        let cnt = next.worker_count();

        debug!("  enqueuing no-ops; count={}", cnt);

        for _ in 0..cnt {
            self.work_queue.put(None);
        }
    }

    fn add_worker(&self, task: Option<Task>) -> Result<(), Option<Task>> {
        // == Transition the state ==

        let mut state = self.core.state.load();

        loop {
            if !state.is_running() {
                return Err(task);
            }

            let wc = state.worker_count();

            if wc >= CAPACITY || wc >= self.core.pool_size {
                return Err(task);
            }

            match self.core.state.compare_exchange(state, state.inc_worker_count()) {
                Ok(()) => break,
                // CAS failed, re-read state
                Err(actual) => state = actual,
            }
        }

        // == Spawn the thread ==

        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.core.name_prefix, id);

        let mut builder = thread::Builder::new().name(name.clone());

        if let Some(size) = self.core.stack_size {
            builder = builder.stack_size(size);
        }

        let worker = Worker {
            core: self.core.clone(),
            initial_task: task,
            work_queue: self.work_queue.clone(),
        };

        debug!("spawning new worker thread; name={}", name);

        if let Err(err) = builder.spawn(move || worker.run()) {
            // The worker (and its initial task) was dropped with the closure
            error!("failed to spawn worker thread; err={}", err);
            worker_exited(&self.core, &self.work_queue);
        }

        Ok(())
    }
}

impl Drop for ThreadPoolInner {
    fn drop(&mut self) {
        self.shutdown(Lifecycle::Shutdown);
    }
}

struct Worker {
    // Core shared by ThreadPool and Worker
    core: Arc<Core>,

    // The task to run when the thread first starts
    initial_task: Option<Task>,

    // The queue on which to listen for new tasks
    work_queue: WorkQueue,
}

impl Worker {
    fn run(mut self) {
        while let Some(task) = self.get_task() {
            trace!("worker processing task");

            if let Err(err) = error::catch(task.job) {
                warn!("job panicked on worker thread; err={:?}", err);
            }
        }

        worker_exited(&self.core, &self.work_queue);
    }

    // Gets the next task, blocking if necessary. Returns None if the worker
    // should shutdown
    fn get_task(&mut self) -> Option<Task> {
        let mut task = self.initial_task.take();

        loop {
            if self.core.state.load().lifecycle() >= Lifecycle::Stop {
                debug!("threadpool is stopped -- aborting task get");
                return None;
            }

            if task.is_some() {
                return task;
            }

            trace!("worker waiting for task");

            match self.work_queue.take() {
                // Grab the task, but loop again in order to check the state.
                // If the pool transitioned to Stop while the worker was
                // blocked on the queue, the task is discarded.
                Some(t) => task = Some(t),
                None => {
                    debug!("received no-op token -- shutting down");
                    return None;
                }
            }
        }
    }
}

fn worker_exited(core: &Core, work_queue: &WorkQueue) {
    let prev = core.state.fetch_dec_worker_count();

    if prev.worker_count() == 1 && !prev.is_running() {
        core.finalize_threadpool(work_queue);
    }
}

// Drops tasks that will never run. Each job owns the completer of its
// promise, so the promise fails with `Error::Rejected`.
fn discard(tasks: Vec<Option<Task>>) {
    let jobs = tasks.into_iter().flatten().count();

    if jobs > 0 {
        debug!("discarded queued jobs; count={}", jobs);
    }
}

struct Core {
    // The main pool control state is an atomic integer packing two conceptual
    // fields
    //   worker_count: the number of workers permitted to start and not yet
    //                 exited
    //   lifecycle:    whether running, shutting down etc
    //
    // The lifecycle takes on values:
    //
    //   Running:    Accept new tasks and process queued tasks
    //   Shutdown:   Don't accept new tasks, process tasks that are due
    //   Stop:       Don't accept new tasks, don't process queued tasks
    //   Tidying:    All workers have exited
    //   Terminated: Termination has been signalled
    //
    // The numerical order among these values matters, to allow ordered
    // comparisons. The lifecycle monotonically increases over time, but need
    // not hit each state.
    //
    // Threads waiting in await_termination() return when the state reaches
    // Terminated.
    state: AtomicState,

    mutex: Mutex<()>,

    // Wait condition to support await_termination
    termination: Condvar,

    pool_size: u32,
    name_prefix: String,
    stack_size: Option<usize>,
    next_id: AtomicUsize,
}

impl Core {
    fn new(config: Builder) -> Core {
        Core {
            state: AtomicState::new(Lifecycle::Running),
            mutex: Mutex::new(()),
            termination: Condvar::new(),
            pool_size: config.pool_size,
            name_prefix: config.name_prefix,
            stack_size: config.stack_size,
            next_id: AtomicUsize::new(0),
        }
    }

    fn await_termination(&self) {
        let mut lock = self.mutex.lock();

        while !self.state.load().is_terminated() {
            self.termination.wait(&mut lock);
        }
    }

    fn finalize_threadpool(&self, work_queue: &WorkQueue) {
        self.state.transition_to(Lifecycle::Tidying);
        debug!("threadpool tidying -- all workers exited");

        // Dropped outside the lock; rejected promises run their listeners
        discard(work_queue.drain());

        let _lock = self.mutex.lock();
        self.state.transition_to(Lifecycle::Terminated);

        // Notify all pending threads
        self.termination.notify_all();
    }
}

struct AtomicState {
    atomic: AtomicUsize,
}

impl AtomicState {
    fn new(lifecycle: Lifecycle) -> AtomicState {
        AtomicState {
            atomic: AtomicUsize::new(State::of(lifecycle).as_usize()),
        }
    }

    fn load(&self) -> State {
        State::load(self.atomic.load(Ordering::Acquire))
    }

    fn compare_exchange(&self, expect: State, val: State) -> Result<(), State> {
        self.atomic.compare_exchange(expect.as_usize(), val.as_usize(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(State::load)
    }

    fn fetch_dec_worker_count(&self) -> State {
        let prev = self.atomic.fetch_sub(1 << LIFECYCLE_BITS, Ordering::AcqRel);
        State::load(prev)
    }

    fn transition_to(&self, lifecycle: Lifecycle) {
        let mut state = self.load();

        loop {
            let next = state.with_lifecycle(lifecycle);

            match self.compare_exchange(state, next) {
                Ok(()) => return,
                Err(actual) => state = actual,
            }
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
struct State {
    state: usize,
}

impl State {
    fn load(num: usize) -> State {
        State { state: num }
    }

    fn of(lifecycle: Lifecycle) -> State {
        State { state: lifecycle as usize }
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_usize(self.state & LIFECYCLE_MASK)
    }

    fn with_lifecycle(&self, lifecycle: Lifecycle) -> State {
        State { state: self.state & !LIFECYCLE_MASK | lifecycle as usize }
    }

    fn worker_count(&self) -> u32 {
        (self.state >> LIFECYCLE_BITS) as u32
    }

    fn inc_worker_count(&self) -> State {
        State { state: self.state + (1 << LIFECYCLE_BITS) }
    }

    fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    fn is_terminated(&self) -> bool {
        self.lifecycle() == Lifecycle::Terminated
    }

    fn as_usize(&self) -> usize {
        self.state
    }
}

const LIFECYCLE_BITS: usize = 3;
const LIFECYCLE_MASK: usize = 7;
const CAPACITY: u32 = (1 << (32 - 3)) - 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
enum Lifecycle {
    Running    = 0,
    Shutdown   = 1,
    Stop       = 2,
    Tidying    = 3,
    Terminated = 4,
}

impl Lifecycle {
    fn from_usize(val: usize) -> Lifecycle {
        use self::Lifecycle::*;

        match val {
            0 => Running,
            1 => Shutdown,
            2 => Stop,
            3 => Tidying,
            _ => Terminated,
        }
    }
}
