//! Bounded FIFO queues between pipeline stages.
//!
//! A [`FrameQueue`] is a `VecDeque` behind a `parking_lot::Mutex` with one
//! `Condvar`. Producers never block: a push onto a full queue hands the item
//! back so the caller can account for the loss. Consumers block in
//! [`FrameQueue::wait_pop`] until an item arrives, a stop predicate turns
//! true, or a timeout expires.
//!
//! Stop flags are plain atomics owned by the pipeline. Whoever sets one must
//! call [`FrameQueue::notify_all`] afterwards; it takes the queue lock before
//! notifying, so a consumer cannot miss the wake-up between checking the flag
//! and going to sleep.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of [`FrameQueue::wait_pop`].
#[derive(Debug)]
pub enum Wait<T> {
    Item(T),
    /// The stop predicate returned true while the queue was empty.
    Stopped,
    TimedOut,
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    peak: usize,
}

pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
    cv: Condvar,
}

impl<T> FrameQueue<T> {
    /// Queue holding at most `capacity` items (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(4096)),
                capacity,
                peak: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Append `item` and wake one consumer. Returns the item when full.
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let mut inner = self.inner.lock();
            if inner.items.len() >= inner.capacity {
                return Err(item);
            }
            inner.items.push_back(item);
            inner.peak = inner.peak.max(inner.items.len());
        }
        self.cv.notify_one();
        Ok(())
    }

    #[must_use]
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Pop the oldest item, waiting while the queue is empty.
    ///
    /// Queued items are returned before `stop` is consulted, so a consumer
    /// stopping on "producer done" drains the queue first. `None` waits
    /// without a timeout.
    pub fn wait_pop(&self, timeout: Option<Duration>, stop: impl Fn() -> bool) -> Wait<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Wait::Item(item);
            }
            if stop() {
                return Wait::Stopped;
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut inner, deadline).timed_out()
                        && inner.items.is_empty()
                        && !stop()
                    {
                        return Wait::TimedOut;
                    }
                }
                None => self.cv.wait(&mut inner),
            }
        }
    }

    /// Wake every waiting consumer so it re-checks its stop predicate.
    pub fn notify_all(&self) {
        let _guard = self.inner.lock();
        self.cv.notify_all();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Change the capacity. Items above a reduced capacity stay queued;
    /// pushes fail until the queue drains below it.
    pub fn set_capacity(&self, capacity: usize) {
        self.inner.lock().capacity = capacity.max(1);
    }

    /// Highest length observed since creation.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.inner.lock().peak
    }

    /// Remove every queued item. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<T> = self.inner.lock().items.drain(..).collect();
        drained.len()
    }
}
