//! Bounded dual-lane work queue.
//!
//! Two FIFO lanes share one capacity bound: a primary lane seeded from input
//! and a retry lane fed by the classifier. Dequeue drains the retry lane
//! strictly before the primary lane so requeued jobs finish close to their
//! first attempt, keeping checkpoint windows tight.
//!
//! Shutdown has two flavors. `close()` seals the intake: dequeue keeps
//! serving until both lanes are empty and no job is in flight (a worker may
//! still push a retry). `halt()` is the operator stop: dequeues end
//! immediately and anything still queued is left for the next resume.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::job::Job;

/// Which lane a job enters. Retry always wins at dequeue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Primary,
    Retry,
}

#[derive(Default)]
struct Lanes {
    primary: VecDeque<Job>,
    retry: VecDeque<Job>,
}

impl Lanes {
    fn len(&self) -> usize {
        self.primary.len() + self.retry.len()
    }

    fn pop(&mut self) -> Option<Job> {
        self.retry.pop_front().or_else(|| self.primary.pop_front())
    }
}

pub struct TaskQueue {
    lanes: Mutex<Lanes>,
    capacity: usize,
    /// Jobs dequeued but not yet acknowledged via [`TaskQueue::task_done`].
    in_flight: AtomicUsize,
    closed: AtomicBool,
    halted: AtomicBool,
    readable: Notify,
    writable: Notify,
}

impl TaskQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            capacity: capacity.max(1),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Add a job, waiting while the queue is at capacity.
    ///
    /// Backpressure only ever blocks the feeder: a worker enqueues a retry
    /// only after having dequeued a job (and before `task_done`), so at least
    /// one slot-equivalent is always available to it and workers cannot
    /// deadlock the intake. After `halt()` the job is dropped; it was never
    /// checkpointed as complete, so the next resume re-attempts it.
    pub async fn enqueue(&self, job: Job, lane: Lane) {
        loop {
            if self.halted.load(Ordering::Acquire) {
                self.writable.notify_one();
                return;
            }
            let wait = self.writable.notified();
            {
                let mut lanes = self.lanes.lock();
                if lanes.len() < self.capacity || lane == Lane::Retry {
                    match lane {
                        Lane::Primary => lanes.primary.push_back(job),
                        Lane::Retry => lanes.retry.push_back(job),
                    }
                    drop(lanes);
                    self.readable.notify_one();
                    return;
                }
            }
            wait.await;
        }
    }

    /// Take the next job, retry lane first. Returns `None` once the queue is
    /// drained after `close()` (both lanes empty, nothing in flight) or
    /// immediately after `halt()`.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            if self.halted.load(Ordering::Acquire) {
                self.readable.notify_one();
                return None;
            }
            let wait = self.readable.notified();
            {
                let mut lanes = self.lanes.lock();
                if let Some(job) = lanes.pop() {
                    drop(lanes);
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                    self.writable.notify_one();
                    // Wake the next reader too in case several were parked
                    // and more items remain.
                    self.readable.notify_one();
                    return Some(job);
                }
                if self.closed.load(Ordering::Acquire)
                    && self.in_flight.load(Ordering::Acquire) == 0
                {
                    drop(lanes);
                    // Cascade the drained signal: notify_one stores a permit
                    // for a consumer racing between its check and its park,
                    // which notify_waiters alone would miss.
                    self.readable.notify_waiters();
                    self.readable.notify_one();
                    return None;
                }
            }
            wait.await;
        }
    }

    /// Acknowledge that a dequeued job reached a terminal outcome or was
    /// requeued. Must be called exactly once per successful `dequeue`.
    pub fn task_done(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "task_done without matching dequeue");
        if prev == 1 && self.closed.load(Ordering::Acquire) {
            // Last in-flight job finished: parked dequeuers can now observe
            // the drained state.
            self.readable.notify_waiters();
            self.readable.notify_one();
        }
    }

    /// Seal the intake. Existing items (and retries from in-flight jobs)
    /// still drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
        self.writable.notify_one();
    }

    /// Stop immediately: all pending and future dequeues return `None`.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
        self.writable.notify_one();
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
