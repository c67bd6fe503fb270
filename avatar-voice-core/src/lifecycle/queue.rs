//! Named bounded FIFO connecting two worker loops.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use tracing::warn;

use super::StopSignal;

/// A bounded multi-producer FIFO with a registered name.
///
/// Both channel halves live inside the queue, so a queue can never become
/// disconnected while a handle to it exists.
pub struct ManagedQueue<T> {
    name: String,
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T: Send + 'static> ManagedQueue<T> {
    /// Create an empty queue holding at most `capacity` items (minimum 1).
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            name: name.into(),
            tx,
            rx,
            capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue `item`.
    ///
    /// - `blocking = false`: fails immediately when the queue is full.
    /// - `blocking = true, timeout = Some(d)`: waits up to `d` for space.
    /// - `blocking = true, timeout = None`: waits until space is available.
    ///
    /// Returns `false` when the item was not enqueued.
    pub fn put(&self, item: T, blocking: bool, timeout: Option<Duration>) -> bool {
        if !blocking {
            return match self.tx.try_send(item) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(queue = %self.name, "queue full, item dropped");
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            };
        }

        match timeout {
            Some(timeout) => match self.tx.send_timeout(item, timeout) {
                Ok(()) => true,
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(queue = %self.name, ?timeout, "queue full after timeout, item dropped");
                    false
                }
                Err(SendTimeoutError::Disconnected(_)) => false,
            },
            None => self.tx.send(item).is_ok(),
        }
    }

    /// Enqueue `item`, retrying every `interval` until there is space or
    /// `stop` is set. Returns `false` only when stopped first.
    ///
    /// Used where losing an item would corrupt what the consumer assembles.
    pub fn put_until_stopped(&self, item: T, stop: &StopSignal, interval: Duration) -> bool {
        let mut item = item;
        loop {
            match self.tx.send_timeout(item, interval) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if stop.is_set() {
                        return false;
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    /// Non-blocking enqueue that silently drops the item when full.
    ///
    /// Used for lossy telemetry such as volume samples.
    pub fn offer(&self, item: T) -> bool {
        self.tx.try_send(item).is_ok()
    }

    /// Dequeue one item, waiting at most `timeout`. `None` on timeout.
    pub fn get(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Dequeue one item without waiting.
    pub fn try_get(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Remove and return everything currently buffered, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

/// Type-erased view used by the manager's registry.
pub(crate) trait ErasedQueue: Send + Sync {
    fn is_empty(&self) -> bool;
    fn len(&self) -> usize;
    fn clear(&self) -> usize;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + 'static> ErasedQueue for ManagedQueue<T> {
    fn is_empty(&self) -> bool {
        ManagedQueue::is_empty(self)
    }

    fn len(&self) -> usize {
        ManagedQueue::len(self)
    }

    fn clear(&self) -> usize {
        self.drain().len()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let q = ManagedQueue::new("frames", 8);
        for i in 0..5 {
            assert!(q.put(i, true, Some(Duration::from_millis(10))));
        }
        let got: Vec<i32> = (0..5)
            .filter_map(|_| q.get(Duration::from_millis(10)))
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn get_returns_none_on_timeout() {
        let q: ManagedQueue<u8> = ManagedQueue::new("empty", 1);
        assert_eq!(q.get(Duration::from_millis(5)), None);
    }

    #[test]
    fn non_blocking_put_fails_when_full() {
        let q = ManagedQueue::new("tiny", 1);
        assert!(q.put(1u8, false, None));
        assert!(!q.put(2u8, false, None));
        assert!(!q.put(3u8, true, Some(Duration::from_millis(5))));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn put_until_stopped_waits_for_space() {
        let q = Arc::new(ManagedQueue::new("segments", 1));
        q.offer(1u8);
        let consumer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                q.get(Duration::from_millis(50))
            })
        };
        assert!(q.put_until_stopped(2u8, &StopSignal::new(), Duration::from_millis(5)));
        assert_eq!(consumer.join().unwrap(), Some(1));
        assert_eq!(q.try_get(), Some(2));
    }

    #[test]
    fn put_until_stopped_gives_up_when_stopped() {
        let q = ManagedQueue::new("segments", 1);
        q.offer(1u8);
        let stop = StopSignal::new();
        stop.set();
        assert!(!q.put_until_stopped(2u8, &stop, Duration::from_millis(1)));
    }

    #[test]
    fn drain_empties_queue() {
        let q = ManagedQueue::new("volume", 4);
        q.offer(0.1f32);
        q.offer(0.2f32);
        assert_eq!(q.drain(), vec![0.1, 0.2]);
        assert!(q.is_empty());
    }
}
