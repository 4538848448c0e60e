use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{self, Ordering};
use std::collections::BinaryHeap;
use std::{mem, ops};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A value that should not be used until the delay has expired.
pub trait Delayed {
    /// Returns the delay associated with the value.
    fn delay(&self) -> Duration;
}

impl<T: Delayed> Delayed for Option<T> {
    fn delay(&self) -> Duration {
        match *self {
            Some(ref v) => v.delay(),
            None => Duration::from_millis(0),
        }
    }
}

/// Associate a delay with a value.
#[derive(Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct Delay<T>(pub T, pub Duration);

impl<T> Delay<T> {
    /// Moves the value out of the `Delay<T>`.
    pub fn unwrap(self) -> T {
        self.0
    }
}

impl<T> Delayed for Delay<T> {
    fn delay(&self) -> Duration {
        self.1
    }
}

impl<T> ops::Deref for Delay<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> ops::DerefMut for Delay<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// An unbounded blocking queue of delayed values. When a value is pushed onto
/// the queue, a delay is included. The value will only be able to be popped
/// off once the specified delay has expired. The head of the queue is the
/// value whose delay is expired and furthest in the past; values that expire
/// at the same instant come out in insertion order.
pub struct DelayQueue<T: Delayed + Send> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    queue: Mutex<Heap<T>>,
    condvar: Condvar,
}

struct Heap<T> {
    entries: BinaryHeap<Entry<T>>,
    seq: u64,
}

impl<T: Delayed + Send> DelayQueue<T> {
    /// Constructs a new `DelayQueue`.
    pub fn new() -> DelayQueue<T> {
        DelayQueue {
            inner: Arc::new(Inner {
                queue: Mutex::new(Heap {
                    entries: BinaryHeap::new(),
                    seq: 0,
                }),
                condvar: Condvar::new(),
            })
        }
    }

    /// Returns the number of values in the queue, expired or not.
    pub fn len(&self) -> usize {
        self.inner.queue.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds the value to the queue. It becomes available once its delay has
    /// expired.
    ///
    /// The queue is unbounded, so this never fails; the `Result` mirrors
    /// bounded queues.
    pub fn offer(&self, e: T) -> Result<(), T> {
        let delay = e.delay();
        let mut queue = self.inner.queue.lock();

        trace!("offering value to delay queue; delay={:?}", delay);

        let entry = Entry::new(e, delay, queue.seq);
        queue.seq += 1;

        match queue.entries.peek() {
            Some(head) => {
                if entry.time < head.time {
                    self.inner.condvar.notify_one();
                }
            }
            None => {
                self.inner.condvar.notify_one();
            }
        }

        queue.entries.push(entry);
        Ok(())
    }

    /// Adds the value to the queue.
    pub fn put(&self, e: T) {
        // Unbounded, offer cannot fail
        let _ = self.offer(e);
    }

    /// Takes the head of the queue if its delay has expired.
    pub fn poll(&self) -> Option<T> {
        let queue = self.inner.queue.lock();

        match queue.entries.peek() {
            Some(e) if e.time > Instant::now() => return None,
            Some(_) => {}
            None => return None,
        }

        self.finish_pop(queue)
    }

    /// Takes from the queue, blocking for up to `timeout`.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let end = match Instant::now().checked_add(timeout) {
            Some(end) => end,
            None => return Some(self.take()),
        };

        let mut queue = self.inner.queue.lock();

        loop {
            let now = Instant::now();

            let wait_until = match queue.entries.peek() {
                Some(e) if e.time <= now => break,
                Some(e) => cmp::min(end, e.time),
                None => end,
            };

            if now >= end {
                return None;
            }

            self.inner.condvar.wait_until(&mut queue, wait_until);
        }

        self.finish_pop(queue)
    }

    /// Takes from the queue, blocking until a value's delay has expired.
    pub fn take(&self) -> T {
        let mut queue = self.inner.queue.lock();

        loop {
            let now = Instant::now();

            let wait_until = match queue.entries.peek() {
                Some(e) if e.time <= now => break,
                Some(e) => Some(e.time),
                None => None,
            };

            trace!("delay queue waiting; until={:?}", wait_until);

            match wait_until {
                Some(time) => {
                    self.inner.condvar.wait_until(&mut queue, time);
                }
                None => self.inner.condvar.wait(&mut queue),
            }
        }

        match self.finish_pop(queue) {
            Some(val) => val,
            None => unreachable!("head checked under lock"),
        }
    }

    /// Removes every value, expired or not.
    pub fn drain(&self) -> Vec<T> {
        let entries = mem::take(&mut self.inner.queue.lock().entries);
        entries.into_iter().map(|e| e.val).collect()
    }

    /// Removes the values whose delay has not expired yet, leaving the
    /// expired ones in place.
    pub fn drain_delayed(&self) -> Vec<T> {
        let now = Instant::now();
        let mut queue = self.inner.queue.lock();

        let (expired, delayed): (Vec<_>, Vec<_>) = mem::take(&mut queue.entries)
            .into_iter()
            .partition(|e| e.time <= now);

        queue.entries = expired.into_iter().collect();
        drop(queue);

        delayed.into_iter().map(|e| e.val).collect()
    }

    fn finish_pop(&self, mut queue: MutexGuard<Heap<T>>) -> Option<T> {
        let entry = queue.entries.pop()?;

        // Another waiter may now be able to make progress on the new head
        if !queue.entries.is_empty() {
            self.inner.condvar.notify_one();
        }

        Some(entry.val)
    }
}

impl<T: Delayed + Send> Default for DelayQueue<T> {
    fn default() -> DelayQueue<T> {
        DelayQueue::new()
    }
}

impl<T: Delayed + Send> Clone for DelayQueue<T> {
    fn clone(&self) -> DelayQueue<T> {
        DelayQueue { inner: self.inner.clone() }
    }
}

struct Entry<T> {
    val: T,
    time: Instant,
    seq: u64,
}

impl<T> Entry<T> {
    fn new(val: T, delay: Duration, seq: u64) -> Entry<T> {
        Entry {
            val,
            time: due(delay),
            seq,
        }
    }
}

// Longest delay honoured as given; longer ones are clamped to it.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn due(delay: Duration) -> Instant {
    let now = Instant::now();

    now.checked_add(delay)
        .or_else(|| now.checked_add(MAX_DELAY))
        .unwrap_or(now)
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Entry<T>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Entry<T>) -> Ordering {
        // BinaryHeap is a max heap, so reverse
        self.time.cmp(&other.time)
            .then(self.seq.cmp(&other.seq))
            .reverse()
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Entry<T>) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}
