//! Bounded FIFO buffer decoupling producers from connection state.
//!
//! Producers enqueue regardless of whether a link is currently open; the
//! connection write loops drain in FIFO order once connected. Capacity is
//! strict: a full queue rejects new messages with `QueueFull` instead of
//! evicting older entries, so producers see backpressure explicitly.

use crate::envelope::Envelope;
use crate::{MeshError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::debug;

pub struct OutboundQueue {
    capacity: usize,
    inner: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Append a message, or reject immediately when at capacity.
    pub fn try_enqueue(&self, envelope: Envelope) -> Result<()> {
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                return Err(MeshError::QueueFull {
                    capacity: self.capacity,
                });
            }
            queue.push_back(envelope);
        }
        // notify_one stores a permit when nobody is waiting yet, so a writer
        // that checks the queue and then waits cannot miss the wakeup.
        self.notify.notify_one();
        Ok(())
    }

    /// Take the oldest message, if any.
    pub fn dequeue(&self) -> Option<Envelope> {
        self.inner.lock().pop_front()
    }

    /// Put a message back at the head after a failed send, preserving FIFO.
    pub fn requeue_front(&self, envelope: Envelope) {
        // May transiently exceed capacity by the one message being returned.
        self.inner.lock().push_front(envelope);
        self.notify.notify_one();
    }

    /// Resolves the next time a message is enqueued.
    pub fn wait_for_message(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Drop everything buffered; returns how many messages were discarded.
    pub fn clear(&self) -> usize {
        let mut queue = self.inner.lock();
        let dropped = queue.len();
        if dropped > 0 {
            debug!(dropped, "discarding pending outbound messages");
        }
        queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(n: u64) -> Envelope {
        Envelope::new("agent:update", json!({ "n": n }), format!("m-{}", n))
    }

    #[test]
    fn drains_in_fifo_order() {
        let q = OutboundQueue::new(100);
        for n in 0..50 {
            q.try_enqueue(envelope(n)).unwrap();
        }
        for n in 0..50 {
            assert_eq!(q.dequeue().unwrap().id, format!("m-{}", n));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn rejects_enqueue_beyond_capacity() {
        let q = OutboundQueue::new(10);
        for n in 0..10 {
            q.try_enqueue(envelope(n)).unwrap();
        }
        assert!(matches!(
            q.try_enqueue(envelope(10)),
            Err(MeshError::QueueFull { capacity: 10 })
        ));
        // Nothing was evicted.
        assert_eq!(q.len(), 10);
        assert_eq!(q.dequeue().unwrap().id, "m-0");
    }

    #[test]
    fn requeue_front_preserves_order() {
        let q = OutboundQueue::new(10);
        q.try_enqueue(envelope(0)).unwrap();
        q.try_enqueue(envelope(1)).unwrap();
        let head = q.dequeue().unwrap();
        q.requeue_front(head);
        assert_eq!(q.dequeue().unwrap().id, "m-0");
        assert_eq!(q.dequeue().unwrap().id, "m-1");
    }

    #[test]
    fn clear_drops_everything() {
        let q = OutboundQueue::new(10);
        for n in 0..7 {
            q.try_enqueue(envelope(n)).unwrap();
        }
        assert_eq!(q.clear(), 7);
        assert!(q.is_empty());
        assert!(q.dequeue().is_none());
    }

    #[tokio::test]
    async fn enqueue_wakes_waiters() {
        let q = std::sync::Arc::new(OutboundQueue::new(10));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            q2.wait_for_message().await;
            q2.dequeue()
        });
        tokio::task::yield_now().await;
        q.try_enqueue(envelope(1)).unwrap();
        let got = waiter.await.unwrap();
        assert_eq!(got.unwrap().id, "m-1");
    }
}
