//! Bounded per-session send queue.
//!
//! The write loop is the only consumer. Producers either fail fast with
//! backpressure (request/response paths) or drop the oldest non-heartbeat
//! frame to make room (push paths). Closing the outbox lets the write
//! loop drain what is already queued and then exit.

use mgate_proto::Frame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct OutboxInner {
    queue: VecDeque<Frame>,
    closed: bool,
}

#[derive(Debug)]
pub struct Outbox {
    inner: Mutex<OutboxInner>,
    capacity: usize,
    /// Wakes the consumer when a frame arrives or the queue closes.
    notify: Notify,
    /// Wakes tasks waiting specifically for closure.
    close_notify: Notify,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(OutboxInner {
                queue: VecDeque::new(),
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
            close_notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame, failing with `false` when the queue is full or
    /// closed. Used by request/response senders, which surface
    /// backpressure to the caller instead of shedding load silently.
    pub fn push(&self, frame: Frame) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed || inner.queue.len() >= self.capacity {
            return false;
        }
        inner.queue.push_back(frame);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Enqueue a frame, evicting the oldest non-heartbeat frame when full.
    /// Used by push fan-out and heartbeats, which must never block.
    /// Returns `false` only when the outbox is closed.
    pub fn push_or_drop_oldest(&self, frame: Frame) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        if inner.queue.len() >= self.capacity {
            let victim = inner.queue.iter().position(|f| !f.is_heartbeat());
            match victim {
                Some(idx) => {
                    inner.queue.remove(idx);
                }
                // Queue entirely heartbeats; shed the front one.
                None => {
                    inner.queue.pop_front();
                }
            }
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.queue.push_back(frame);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Pop the next frame in FIFO order, waiting for one to arrive.
    /// After `close()`, remaining frames are still yielded (drain), then
    /// `None` marks the end of the stream.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(frame) = inner.queue.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.notify.notify_waiters();
        self.close_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Wait until the outbox has been closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgate_proto::FrameType;

    fn normal(tag: u8) -> Frame {
        Frame::normal(vec![tag])
    }

    #[tokio::test]
    async fn fifo_order() {
        let outbox = Outbox::new(8);
        assert!(outbox.push(normal(1)));
        assert!(outbox.push(normal(2)));
        assert_eq!(outbox.pop().await.unwrap().payload, vec![1]);
        assert_eq!(outbox.pop().await.unwrap().payload, vec![2]);
    }

    #[test]
    fn push_fails_when_full() {
        let outbox = Outbox::new(2);
        assert!(outbox.push(normal(1)));
        assert!(outbox.push(normal(2)));
        assert!(!outbox.push(normal(3)));
        assert_eq!(outbox.dropped(), 0);
    }

    #[tokio::test]
    async fn drop_oldest_spares_heartbeats() {
        let outbox = Outbox::new(3);
        assert!(outbox.push(Frame::ping()));
        assert!(outbox.push(normal(1)));
        assert!(outbox.push(normal(2)));
        // Full: the oldest non-heartbeat (tag 1) goes, the ping survives.
        assert!(outbox.push_or_drop_oldest(normal(3)));
        assert_eq!(outbox.dropped(), 1);
        assert_eq!(outbox.pop().await.unwrap().frame_type, FrameType::Ping);
        assert_eq!(outbox.pop().await.unwrap().payload, vec![2]);
        assert_eq!(outbox.pop().await.unwrap().payload, vec![3]);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let outbox = Outbox::new(8);
        assert!(outbox.push(normal(1)));
        outbox.close();
        assert!(!outbox.push(normal(2)));
        assert!(!outbox.push_or_drop_oldest(normal(3)));
        assert_eq!(outbox.pop().await.unwrap().payload, vec![1]);
        assert!(outbox.pop().await.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let outbox = std::sync::Arc::new(Outbox::new(8));
        let consumer = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.pop().await })
        };
        tokio::task::yield_now().await;
        assert!(outbox.push(normal(7)));
        let frame = consumer.await.unwrap().unwrap();
        assert_eq!(frame.payload, vec![7]);
    }

    #[tokio::test]
    async fn closed_waiter_fires() {
        let outbox = std::sync::Arc::new(Outbox::new(8));
        let waiter = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.closed().await })
        };
        tokio::task::yield_now().await;
        outbox.close();
        waiter.await.unwrap();
    }
}
