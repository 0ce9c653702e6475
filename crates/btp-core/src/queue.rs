//! Bounded outbound frame queue
//!
//! Producers are application tasks calling `transmit_frame`; the consumer is
//! the role's main loop. A full queue is reported to the producer instead of
//! blocking it. The queue can be cleared from any task, which the roles do
//! whenever discovery restarts.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{BusError, Result};
use crate::frame::SlaveAddress;

/// Application frame waiting for a transmission opportunity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Destination (master) or own address (slave)
    pub address: SlaveAddress,
    /// Application payload
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create an outbound frame
    pub fn new(address: SlaveAddress, payload: impl Into<Bytes>) -> Self {
        Self {
            address,
            payload: payload.into(),
        }
    }
}

/// Bounded multi-producer, single-consumer frame queue
#[derive(Debug)]
pub struct FrameQueue {
    items: Mutex<VecDeque<OutboundFrame>>,
    capacity: usize,
    notify: Notify,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue a frame
    pub fn push(&self, frame: OutboundFrame) -> Result<()> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Err(BusError::QueueFull {
                    capacity: self.capacity,
                });
            }
            items.push_back(frame);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue a frame if one is waiting
    pub fn try_pop(&self) -> Option<OutboundFrame> {
        self.items.lock().pop_front()
    }

    /// Dequeue a frame, waiting at most `timeout` for one to arrive
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<OutboundFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Drop all pending frames, returning how many were discarded
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        if dropped > 0 {
            trace!(dropped, "Cleared transmit queue");
        }
        dropped
    }

    /// Number of pending frames
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether no frame is pending
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Maximum number of pending frames
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(n: u8) -> OutboundFrame {
        OutboundFrame::new(SlaveAddress::new(1), vec![n])
    }

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new(4);
        queue.push(frame(1)).unwrap();
        queue.push(frame(2)).unwrap();
        assert_eq!(queue.try_pop().unwrap().payload.as_ref(), &[1]);
        assert_eq!(queue.try_pop().unwrap().payload.as_ref(), &[2]);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_full_queue_rejects() {
        let queue = FrameQueue::new(2);
        queue.push(frame(1)).unwrap();
        queue.push(frame(2)).unwrap();
        assert!(matches!(
            queue.push(frame(3)),
            Err(BusError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_clear() {
        let queue = FrameQueue::new(4);
        queue.push(frame(1)).unwrap();
        queue.push(frame(2)).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout_expires() {
        let queue = FrameQueue::new(4);
        let start = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(10)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(4));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            producer.push(frame(9)).unwrap();
        });

        let got = queue.pop_timeout(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.payload.as_ref(), &[9]);
    }
}
