//! Fixed-capacity MPMC FIFO over `crossbeam-channel`.
//!
//! The queue owns both channel ends, so a clone can never observe a
//! disconnect: full and empty are the only failure modes, and both are
//! reported as plain `bool`/`Option` results rather than errors.

use std::time::Duration;

pub struct BoundedQueue<T> {
    tx: crossbeam_channel::Sender<T>,
    rx: crossbeam_channel::Receiver<T>,
    capacity: usize,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Non-blocking put. Returns `false` (dropping `item`) when full.
    #[inline]
    pub fn try_put(&self, item: T) -> bool {
        self.tx.try_send(item).is_ok()
    }

    /// Blocking put, giving up after `timeout`. Returns `false` when the
    /// queue stayed full for the whole wait.
    #[inline]
    pub fn put(&self, item: T, timeout: Duration) -> bool {
        self.tx.send_timeout(item, timeout).is_ok()
    }

    /// Non-blocking get.
    #[inline]
    pub fn try_get(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocking get, returning `None` if nothing arrived within `timeout`.
    #[inline]
    pub fn get(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Pull up to `max_n` items, waiting at most `per_item_timeout` for
    /// each. Stops early at the first timeout, so the result may hold fewer
    /// items or none.
    pub fn get_batch(&self, max_n: usize, per_item_timeout: Duration) -> Vec<T> {
        let mut items = Vec::with_capacity(max_n);
        for _ in 0..max_n {
            match self.rx.recv_timeout(per_item_timeout) {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }
        items
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(10);

    #[test]
    fn try_put_fails_when_full() {
        let q = BoundedQueue::new(2);
        assert!(q.try_put(1));
        assert!(q.try_put(2));
        assert!(q.is_full());
        assert!(!q.try_put(3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_get(), Some(1));
        assert!(q.try_put(3));
    }

    #[test]
    fn get_times_out_on_empty() {
        let q: BoundedQueue<u32> = BoundedQueue::new(4);
        assert!(q.is_empty());
        assert_eq!(q.get(SHORT), None);
    }

    #[test]
    fn fifo_order() {
        let q = BoundedQueue::new(8);
        for i in 0..5 {
            assert!(q.try_put(i));
        }
        let got: Vec<_> = std::iter::from_fn(|| q.try_get()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn get_batch_stops_at_timeout() {
        let q = BoundedQueue::new(8);
        q.try_put(1);
        q.try_put(2);
        let batch = q.get_batch(5, SHORT);
        assert_eq!(batch, vec![1, 2]);
        assert!(q.get_batch(5, SHORT).is_empty());
    }

    #[test]
    fn get_batch_respects_max() {
        let q = BoundedQueue::new(8);
        for i in 0..6 {
            q.try_put(i);
        }
        assert_eq!(q.get_batch(4, SHORT).len(), 4);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn shared_between_threads() {
        let q = BoundedQueue::new(64);
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                for i in 0..100u32 {
                    assert!(q.put(i, Duration::from_secs(1)));
                }
            })
        };
        let consumer = {
            let q = q.clone();
            std::thread::spawn(move || {
                let mut n = 0;
                while n < 100 {
                    if q.get(Duration::from_secs(1)).is_some() {
                        n += 1;
                    }
                }
                n
            })
        };
        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), 100);
    }
}
