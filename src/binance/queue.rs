// =============================================================================
// Bounded event queues for WebSocket consumers
// =============================================================================
//
// `watch_ticker` / `watch_trades` block on these. Capacity enforces
// backpressure; the ticker variant drops the OLDEST item when full (a stale
// ticker is worthless), the trade variant drops the incoming item instead
// (every retained trade keeps its order).
// =============================================================================

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Push, evicting the oldest element when full.
    pub fn push_drop_oldest(&self, item: T) {
        {
            let mut q = self.inner.lock();
            if q.len() >= self.capacity {
                q.pop_front();
            }
            q.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Push unless full; a full queue discards the incoming element.
    pub fn push_drop_newest(&self, item: T) {
        {
            let mut q = self.inner.lock();
            if q.len() >= self.capacity {
                return;
            }
            q.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Await the next element.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.inner.lock().pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pop_returns_in_fifo_order() {
        let q = BoundedQueue::new(4);
        q.push_drop_newest(1);
        q.push_drop_newest(2);
        assert_eq!(q.pop().await, 1);
        assert_eq!(q.pop().await, 2);
    }

    #[test]
    fn drop_oldest_evicts_front() {
        let q = BoundedQueue::new(2);
        q.push_drop_oldest(1);
        q.push_drop_oldest(2);
        q.push_drop_oldest(3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.inner.lock().front(), Some(&2));
    }

    #[test]
    fn drop_newest_discards_incoming() {
        let q = BoundedQueue::new(2);
        q.push_drop_newest(1);
        q.push_drop_newest(2);
        q.push_drop_newest(3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.inner.lock().back(), Some(&2));
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = std::sync::Arc::new(BoundedQueue::new(4));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push_drop_newest(7u32);
        assert_eq!(waiter.await.unwrap(), 7);
    }
}
