//! Bounded FIFO of requests awaiting a worker.
//!
//! Dispatch never writes to a worker directly; it enqueues here and the
//! dispatcher's periodic drainer pulls one payload per tick. The bound is
//! the dispatcher's backpressure: a full queue fails the enqueueing call.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::bridge::protocol::IpcPayload;

pub(crate) const PENDING_CAPACITY: usize = 4096;

pub(crate) struct PendingQueue {
    queue: Mutex<VecDeque<IpcPayload>>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Enqueue at the tail. Returns false when the queue is full.
    pub fn push(&self, payload: IpcPayload) -> bool {
        let Ok(mut queue) = self.queue.lock() else {
            return false;
        };
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(payload);
        true
    }

    /// Return a payload to the head after a failed drain, preserving its
    /// place in line.
    pub fn push_front(&self, payload: IpcPayload) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_front(payload);
        }
    }

    pub fn pop(&self) -> Option<IpcPayload> {
        self.queue.lock().ok()?.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(id: &str) -> IpcPayload {
        IpcPayload::request(id, "svc", None, "run", Vec::new())
    }

    #[test]
    fn pop_returns_payloads_in_fifo_order() {
        let queue = PendingQueue::new(8);
        assert!(queue.push(payload("a")));
        assert!(queue.push(payload("b")));

        assert_eq!(queue.pop().unwrap().payload_id(), Some("a"));
        assert_eq!(queue.pop().unwrap().payload_id(), Some("b"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn push_fails_once_full() {
        let queue = PendingQueue::new(2);
        assert!(queue.push(payload("a")));
        assert!(queue.push(payload("b")));
        assert!(!queue.push(payload("c")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn push_front_restores_head_position() {
        let queue = PendingQueue::new(8);
        queue.push(payload("a"));
        queue.push(payload("b"));

        let head = queue.pop().unwrap();
        queue.push_front(head);

        assert_eq!(queue.pop().unwrap().payload_id(), Some("a"));
        assert_eq!(queue.pop().unwrap().payload_id(), Some("b"));
    }
}
