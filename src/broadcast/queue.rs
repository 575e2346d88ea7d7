//! Bounded queue that evicts its oldest item when full.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Single-consumer queue with a fixed capacity.
///
/// `push` never blocks: a full queue gives up its oldest item to make room.
pub struct DropOldestQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `item`, returning the evicted item if the queue was full.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    pub fn pop(&self) -> Option<T> {
        self.items().pop_front()
    }

    /// Wait up to `wait` for the next item.
    pub async fn recv_timeout(&self, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.pop();
            }
        }
    }

    /// Wake the consumer and stop waiting for new items.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_evicts_oldest() {
        let queue = DropOldestQueue::new(3);
        for i in 0..3 {
            assert_eq!(queue.push(i), None);
        }
        assert_eq!(queue.push(3), Some(0));
        assert_eq!(queue.push(4), Some(1));
        assert_eq!(queue.len(), 3);
        let drained: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, [2, 3, 4]);
    }

    #[test]
    fn zero_capacity_holds_one() {
        let queue = DropOldestQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push("a");
        assert_eq!(queue.push("b"), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn recv_times_out_when_idle() {
        let queue: DropOldestQueue<u32> = DropOldestQueue::new(4);
        assert_eq!(queue.recv_timeout(Duration::from_secs(1)).await, None);
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let queue = std::sync::Arc::new(DropOldestQueue::new(4));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(7u32);
        });
        assert_eq!(queue.recv_timeout(Duration::from_secs(5)).await, Some(7));
    }

    #[tokio::test]
    async fn close_releases_waiter() {
        let queue = std::sync::Arc::new(DropOldestQueue::<u32>::new(4));
        let closer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });
        assert_eq!(queue.recv_timeout(Duration::from_secs(30)).await, None);
        assert!(queue.is_closed());
    }
}
