use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A bounded, thread-safe FIFO. `push` never blocks: a full queue rejects the
/// item instead, which is how the acceptor/receiver threads apply
/// backpressure instead of stalling on a slow worker pool.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            not_empty: Condvar::new(),
        }
    }

    /// Returns `false` without blocking if the queue is already at capacity.
    pub fn try_push(&self, item: T) -> bool {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Waits up to `timeout` for an item. Returns `None` on timeout so the
    /// caller can recheck its own shutdown flag periodically rather than
    /// blocking forever on a queue that will never receive more work.
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while items.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self.not_empty.wait_timeout(items, remaining).unwrap();
            items = guard;
            if result.timed_out() && items.is_empty() {
                return None;
            }
        }
        items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn wake_all(&self) {
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_push_past_capacity() {
        let q = BoundedQueue::new(1);
        assert!(q.try_push(1));
        assert!(!q.try_push(2));
    }

    #[test]
    fn pop_wait_times_out_on_empty_queue() {
        let q: BoundedQueue<i32> = BoundedQueue::new(4);
        assert_eq!(q.pop_wait(Duration::from_millis(20)), None);
    }

    #[test]
    fn pop_wait_returns_pushed_item() {
        let q = BoundedQueue::new(4);
        q.try_push(42);
        assert_eq!(q.pop_wait(Duration::from_millis(20)), Some(42));
    }
}
