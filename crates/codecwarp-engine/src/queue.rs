//! FIFO work queue shared by a session and its worker thread.
//!
//! The item list, the in-flight counter and the running flag sit behind a
//! single mutex and are only read or written while it is held. The worker
//! checks its wait predicate and parks on the condition variable under that
//! same lock, so a shutdown can never slip in between the check and the wait.
//!
//! [`TaskQueue::is_drained`] and [`TaskQueue::wait_drained`] are for callers
//! that want to block on an idle worker. Session flushes do not use them: a
//! flush completes when its sentinel, queued behind the earlier work, has
//! passed through the worker and the bridge in order.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct QueueState<T> {
    items: VecDeque<T>,
    processing: usize,
    running: bool,
}

/// Blocking-dequeue, non-blocking-enqueue FIFO
pub struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                processing: 0,
                running: true,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item. Hands the item back if the queue has been shut down.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        if !state.running {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Block until an item is available or the queue shuts down.
    ///
    /// The returned guard counts as in flight until it is dropped, so
    /// [`TaskQueue::is_drained`] stays false while the item executes.
    pub fn pop(&self) -> Option<InFlight<'_, T>> {
        let state = self.lock();
        let mut state = self
            .cond
            .wait_while(state, |s| s.running && s.items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);

        if !state.running {
            return None;
        }
        let item = state.items.pop_front()?;
        state.processing += 1;
        Some(InFlight {
            queue: self,
            item: Some(item),
        })
    }

    /// Queue empty and nothing executing
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.items.is_empty() && state.processing == 0
    }

    /// Block until drained or the timeout elapses. Returns true if drained.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.items.is_empty() && state.processing == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Number of queued items, excluding the one in flight
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Drop every queued item. Returns how many were dropped.
    pub fn discard(&self) -> usize {
        let dropped: Vec<T> = {
            let mut state = self.lock();
            state.items.drain(..).collect()
        };
        self.cond.notify_all();
        // Items are dropped outside the lock
        dropped.len()
    }

    /// Stop accepting items and wake every waiter. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.running = false;
        drop(state);
        self.cond.notify_all();
    }

    fn finish_one(&self) {
        let mut state = self.lock();
        state.processing = state.processing.saturating_sub(1);
        drop(state);
        self.cond.notify_all();
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An item taken off the queue. Releases its in-flight mark exactly once, on drop.
pub struct InFlight<'a, T> {
    queue: &'a TaskQueue<T>,
    item: Option<T>,
}

impl<T> InFlight<'_, T> {
    /// Take ownership of the item; the in-flight mark stays until drop
    pub fn take(&mut self) -> Option<T> {
        self.item.take()
    }
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        self.queue.finish_one();
    }
}
